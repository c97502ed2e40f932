//! Engine errors.

use serde::{Deserialize, Serialize};
use stepflow_workflow::WorkflowError;
use thiserror::Error;

/// Why a single step attempt did not produce a result.
///
/// Recorded on the step after its last attempt and surfaced in
/// [`crate::StepRecord::error`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
  /// The attempt exceeded the step's timeout and was abandoned.
  #[error("step '{step_id}' timed out after {timeout_ms}ms on attempt {attempt}")]
  Timeout {
    step_id: String,
    attempt: u32,
    timeout_ms: u64,
  },

  /// The delegate returned an error.
  #[error("step '{step_id}' failed on attempt {attempt}: {message}")]
  Execution {
    step_id: String,
    attempt: u32,
    message: String,
  },

  /// The delegate panicked.
  #[error("step '{step_id}' panicked on attempt {attempt}: {message}")]
  Panicked {
    step_id: String,
    attempt: u32,
    message: String,
  },

  /// The run was cancelled while the attempt was in flight or waiting to retry.
  #[error("step '{step_id}' cancelled on attempt {attempt}")]
  Cancelled { step_id: String, attempt: u32 },
}

impl StepError {
  pub fn step_id(&self) -> &str {
    match self {
      Self::Timeout { step_id, .. }
      | Self::Execution { step_id, .. }
      | Self::Panicked { step_id, .. }
      | Self::Cancelled { step_id, .. } => step_id,
    }
  }

  /// The attempt (1-based) that produced this error.
  pub fn attempt(&self) -> u32 {
    match self {
      Self::Timeout { attempt, .. }
      | Self::Execution { attempt, .. }
      | Self::Panicked { attempt, .. }
      | Self::Cancelled { attempt, .. } => *attempt,
    }
  }
}

/// Errors surfaced by a workflow run as a whole.
#[derive(Debug, Error)]
pub enum RuntimeError {
  /// A step failed with `stop_on_error` set; no further steps were started.
  #[error("workflow '{workflow}' aborted after failure of: {}", failed.join(", "))]
  WorkflowAborted {
    workflow: String,
    failed: Vec<String>,
    skipped: Vec<String>,
  },

  /// The run finished but one or more steps failed.
  #[error("workflow '{workflow}' finished with failed steps: {}", failed.join(", "))]
  StepsFailed {
    workflow: String,
    failed: Vec<String>,
  },

  /// The run was cancelled before every step finished.
  #[error("workflow '{workflow}' was cancelled")]
  Cancelled { workflow: String },

  /// The scheduler reached a state a validated graph cannot produce.
  #[error("workflow invariant violated: {message}")]
  InvariantViolation { message: String },
}

/// Errors from the shared execution context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
  /// The step has not completed successfully in this run.
  #[error("result for step '{step_id}' is not available")]
  ResultUnavailable { step_id: String },

  /// Results are write-once per step.
  #[error("result for step '{step_id}' was already recorded")]
  ResultAlreadyRecorded { step_id: String },

  /// The stored result does not deserialize into the requested type.
  #[error("result for step '{step_id}' has an unexpected shape: {message}")]
  ResultDecode { step_id: String, message: String },

  /// The resource factory failed.
  #[error("failed to initialize resource '{name}': {message}")]
  ResourceInit { name: String, message: String },

  /// The resource exists under this name with a different type.
  #[error("resource '{name}' is not of type {expected}")]
  ResourceTypeMismatch { name: String, expected: &'static str },

  /// Resources were already released at the end of the run.
  #[error("resource '{name}' requested after the run released its resources")]
  ResourcesReleased { name: String },
}

/// Errors from registering delegates or resolving a workflow definition.
#[derive(Debug, Error)]
pub enum RegistryError {
  /// Delegate names must be non-empty and contain no whitespace.
  #[error("invalid delegate name '{name}'")]
  InvalidName { name: String },

  #[error("delegate '{name}' is already registered")]
  DuplicateDelegate { name: String },

  #[error("step '{step_id}' references unknown delegate '{name}'")]
  UnknownDelegate { step_id: String, name: String },

  #[error("step '{step_id}' does not name a delegate")]
  MissingDelegate { step_id: String },

  #[error(transparent)]
  Workflow(#[from] WorkflowError),
}
