//! Per-run outcome types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RuntimeError, StepError};

/// Lifecycle of a step within one run.
///
/// `Pending -> Running -> Succeeded | Failed`, or `Pending -> Skipped`.
/// A step in a terminal state never changes again during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
  Pending,
  Running,
  Succeeded,
  Failed,
  Skipped,
}

impl StepState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
  }
}

impl fmt::Display for StepState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
      Self::Skipped => "skipped",
    };
    f.write_str(s)
  }
}

/// Why a step never started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
  /// A direct or transitive dependency failed.
  DependencyFailed { dependency: String },
  /// The step's condition did not hold when it became ready.
  ConditionNotMet,
  /// A dependency was skipped because its condition did not hold.
  DependencySkipped { dependency: String },
  /// Another step failed with `stop_on_error` set.
  Halted { failed: String },
  /// The run was cancelled.
  Cancelled,
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::DependencyFailed { dependency } => write!(f, "dependency '{dependency}' failed"),
      Self::ConditionNotMet => f.write_str("condition not met"),
      Self::DependencySkipped { dependency } => write!(f, "dependency '{dependency}' was skipped"),
      Self::Halted { failed } => write!(f, "workflow halted after '{failed}' failed"),
      Self::Cancelled => f.write_str("workflow cancelled"),
    }
  }
}

/// Final record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
  pub step_id: String,
  pub name: String,
  pub state: StepState,
  /// Delegate output, set only when `state` is `Succeeded`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  /// Error of the last attempt, set only when `state` is `Failed`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<StepError>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub skip_reason: Option<SkipReason>,
  /// Attempts made; zero for skipped steps.
  pub attempts: u32,
  /// Wall time from first attempt to final outcome, including retry delays.
  pub duration_ms: u64,
}

impl StepRecord {
  pub(crate) fn pending(step_id: &str, name: &str) -> Self {
    Self {
      step_id: step_id.to_string(),
      name: name.to_string(),
      state: StepState::Pending,
      output: None,
      error: None,
      skip_reason: None,
      attempts: 0,
      duration_ms: 0,
    }
  }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
  /// Every step succeeded.
  Completed,
  /// Some steps succeeded and some failed.
  PartialSuccess,
  /// Steps failed and none succeeded.
  Failed,
  /// The run was cancelled before it finished.
  Cancelled,
}

impl fmt::Display for WorkflowStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Completed => "completed",
      Self::PartialSuccess => "partial_success",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    };
    f.write_str(s)
  }
}

/// Result of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
  pub run_id: String,
  pub workflow: String,
  pub started_at: DateTime<Utc>,
  /// True when no step failed and the run was not cancelled.
  pub success: bool,
  pub status: WorkflowStatus,
  /// A step failed with `stop_on_error` set.
  pub aborted: bool,
  pub duration_ms: u64,
  /// Step ids in the order they were started.
  pub execution_order: Vec<String>,
  /// One record per step, in insertion order.
  pub steps: Vec<StepRecord>,
}

impl WorkflowResult {
  pub(crate) fn status_for(steps: &[StepRecord], cancelled: bool) -> WorkflowStatus {
    let failed = steps.iter().filter(|s| s.state == StepState::Failed).count();
    let succeeded = steps.iter().filter(|s| s.state == StepState::Succeeded).count();

    if cancelled {
      WorkflowStatus::Cancelled
    } else if failed == 0 {
      WorkflowStatus::Completed
    } else if succeeded > 0 {
      WorkflowStatus::PartialSuccess
    } else {
      WorkflowStatus::Failed
    }
  }

  pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
    self.steps.iter().find(|s| s.step_id == step_id)
  }

  pub fn state_of(&self, step_id: &str) -> Option<StepState> {
    self.step(step_id).map(|s| s.state)
  }

  /// Output of a succeeded step.
  pub fn output(&self, step_id: &str) -> Option<&Value> {
    self.step(step_id).and_then(|s| s.output.as_ref())
  }

  pub fn steps_in(&self, state: StepState) -> Vec<&str> {
    self
      .steps
      .iter()
      .filter(|s| s.state == state)
      .map(|s| s.step_id.as_str())
      .collect()
  }

  pub fn failed_steps(&self) -> Vec<&str> {
    self.steps_in(StepState::Failed)
  }

  pub fn skipped_steps(&self) -> Vec<&str> {
    self.steps_in(StepState::Skipped)
  }

  /// Percentage of steps that succeeded; 100 for an empty workflow.
  pub fn success_rate(&self) -> f64 {
    if self.steps.is_empty() {
      return 100.0;
    }
    let succeeded = self.steps_in(StepState::Succeeded).len();
    succeeded as f64 * 100.0 / self.steps.len() as f64
  }

  /// Output of the last step, in start order, that succeeded.
  pub fn final_output(&self) -> Option<&Value> {
    self
      .execution_order
      .iter()
      .rev()
      .find_map(|id| self.output(id))
  }

  pub fn duration(&self) -> Duration {
    Duration::from_millis(self.duration_ms)
  }

  pub fn duration_seconds(&self) -> f64 {
    self.duration().as_secs_f64()
  }

  /// Convert an unsuccessful run into an error.
  pub fn into_result(self) -> Result<Self, RuntimeError> {
    if self.success {
      return Ok(self);
    }
    if self.status == WorkflowStatus::Cancelled {
      return Err(RuntimeError::Cancelled {
        workflow: self.workflow,
      });
    }

    let failed = self.failed_steps().into_iter().map(String::from).collect();
    if self.aborted {
      let skipped = self.skipped_steps().into_iter().map(String::from).collect();
      Err(RuntimeError::WorkflowAborted {
        workflow: self.workflow,
        failed,
        skipped,
      })
    } else {
      Err(RuntimeError::StepsFailed {
        workflow: self.workflow,
        failed,
      })
    }
  }
}
