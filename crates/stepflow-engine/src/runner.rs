//! Workflow execution.
//!
//! The runner keeps a ready set ordered by step insertion index and launches
//! ready steps while fewer than `max_parallel_steps` are in flight. Each step
//! runs as its own tokio task; the scheduler reacts to completions one at a
//! time, releasing dependents on success and skipping transitive dependents
//! on failure.
//!
//! Dropping a run future mid-flight aborts its step tasks, cancels their
//! tokens and closes the run's resources on a background task.

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, instrument, warn};

use crate::context::ExecutionContext;
use crate::error::{RuntimeError, StepError};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::graph::WorkflowGraph;
use crate::result::{SkipReason, StepRecord, StepState, WorkflowResult};
use crate::retry::RetryPolicy;
use crate::step::{Step, StepCall};

/// Executes workflow graphs.
///
/// # Usage
///
/// ```ignore
/// let (notifier, mut events) = ChannelNotifier::channel();
/// let runner = Runner::with_notifier(notifier);
///
/// let context = ExecutionContext::new().with_metadata("triggered_by", "cron");
/// let result = runner.run(&graph, context).await?;
/// println!("{} in {:.2}s", result.status, result.duration_seconds());
/// ```
pub struct Runner<N: ExecutionNotifier = NoopNotifier> {
  notifier: Arc<N>,
}

impl Runner<NoopNotifier> {
  pub fn new() -> Self {
    Self {
      notifier: Arc::new(NoopNotifier),
    }
  }
}

impl Default for Runner<NoopNotifier> {
  fn default() -> Self {
    Self::new()
  }
}

impl<N: ExecutionNotifier + 'static> Runner<N> {
  pub fn with_notifier(notifier: N) -> Self {
    Self {
      notifier: Arc::new(notifier),
    }
  }

  /// Run a graph with a fresh context.
  pub async fn execute(&self, graph: &WorkflowGraph) -> Result<WorkflowResult, RuntimeError> {
    self.run(graph, ExecutionContext::new()).await
  }

  /// Run a graph against the given context.
  ///
  /// Step failures are reported in the returned [`WorkflowResult`], not as
  /// an error; use [`WorkflowResult::into_result`] to turn an unsuccessful
  /// run into one. `Err` is reserved for scheduler invariant violations.
  pub async fn run(
    &self,
    graph: &WorkflowGraph,
    context: ExecutionContext,
  ) -> Result<WorkflowResult, RuntimeError> {
    self
      .run_with_cancel(graph, context, CancellationToken::new())
      .await
  }

  /// Run a graph, stopping early when `cancel` fires.
  ///
  /// On cancellation no new steps start, in-flight attempts are abandoned
  /// and fail with [`StepError::Cancelled`], and steps that never started
  /// are skipped.
  #[instrument(
    name = "workflow_run",
    skip_all,
    fields(workflow = %graph.name(), run_id = %context.run_id())
  )]
  pub async fn run_with_cancel(
    &self,
    graph: &WorkflowGraph,
    context: ExecutionContext,
    cancel: CancellationToken,
  ) -> Result<WorkflowResult, RuntimeError> {
    let context = Arc::new(context);
    let run_id = context.run_id().to_string();
    let started = Instant::now();

    // Both guards fire if this future is dropped before the run finishes.
    let run_cancel = cancel.child_token();
    let _stop_steps = run_cancel.clone().drop_guard();
    let resources = ReleaseOnDrop(Some(context.clone()));

    info!(
      run_id = %run_id,
      workflow = %graph.name(),
      steps = graph.len(),
      max_parallel_steps = graph.config().max_parallel_steps,
      "workflow_started"
    );
    self.notifier.notify(ExecutionEvent::WorkflowStarted {
      run_id: run_id.clone(),
      workflow: graph.name().to_string(),
    });

    let mut run = RunState::new(graph, &run_id, self.notifier.clone());
    let outcome = run.dispatch(&context, &run_cancel).await;

    // Resources are closed whatever the outcome.
    resources.release().await;

    if let Err(e) = outcome {
      error!(run_id = %run_id, error = %e, "workflow_failed");
      self.notifier.notify(ExecutionEvent::WorkflowCompleted {
        run_id,
        success: false,
      });
      return Err(e);
    }

    let status = WorkflowResult::status_for(&run.records, run.cancelled);
    let success = !run.cancelled && run.records.iter().all(|r| r.state != StepState::Failed);
    let result = WorkflowResult {
      run_id: run_id.clone(),
      workflow: graph.name().to_string(),
      started_at: context.started_at(),
      success,
      status,
      aborted: run.aborted,
      duration_ms: started.elapsed().as_millis() as u64,
      execution_order: run.execution_order,
      steps: run.records,
    };

    info!(
      run_id = %run_id,
      status = %result.status,
      success = result.success,
      success_rate = result.success_rate(),
      duration_ms = result.duration_ms,
      "workflow_completed"
    );
    self.notifier.notify(ExecutionEvent::WorkflowCompleted {
      run_id,
      success: result.success,
    });

    Ok(result)
  }
}

/// Closes a run's resources, on a spawned task if the run never got to.
struct ReleaseOnDrop(Option<Arc<ExecutionContext>>);

impl ReleaseOnDrop {
  async fn release(mut self) {
    if let Some(context) = self.0.take() {
      context.release_resources().await;
    }
  }
}

impl Drop for ReleaseOnDrop {
  fn drop(&mut self) {
    let Some(context) = self.0.take() else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        warn!(run_id = %context.run_id(), "workflow_dropped");
        handle.spawn(async move { context.release_resources().await });
      }
      Err(_) => warn!(run_id = %context.run_id(), "resources_not_released"),
    }
  }
}

/// Aborts a step task when the scheduler lets go of it unfinished.
struct AbortOnDrop(JoinHandle<StepOutcome>);

impl Drop for AbortOnDrop {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// What a step task reports back to the scheduler.
struct StepOutcome {
  result: Result<Value, StepError>,
  attempts: u32,
  duration: Duration,
}

type StepFuture = BoxFuture<'static, (usize, Result<StepOutcome, JoinError>)>;

/// Mutable bookkeeping of one run. Owned by the scheduler loop only.
struct RunState<'g, N> {
  graph: &'g WorkflowGraph,
  run_id: String,
  notifier: Arc<N>,
  records: Vec<StepRecord>,
  /// Unfinished dependencies per step.
  waiting: Vec<usize>,
  ready: BTreeSet<usize>,
  execution_order: Vec<String>,
  /// First step that failed under `stop_on_error`.
  halted_by: Option<String>,
  aborted: bool,
  cancelled: bool,
}

impl<'g, N: ExecutionNotifier + 'static> RunState<'g, N> {
  fn new(graph: &'g WorkflowGraph, run_id: &str, notifier: Arc<N>) -> Self {
    let topology = graph.topology();
    Self {
      graph,
      run_id: run_id.to_string(),
      notifier,
      records: graph
        .steps()
        .iter()
        .map(|step| StepRecord::pending(step.id(), step.name()))
        .collect(),
      waiting: (0..graph.len()).map(|i| topology.upstream(i).len()).collect(),
      ready: topology.entry_points().iter().copied().collect(),
      execution_order: Vec::new(),
      halted_by: None,
      aborted: false,
      cancelled: false,
    }
  }

  async fn dispatch(
    &mut self,
    context: &Arc<ExecutionContext>,
    cancel: &CancellationToken,
  ) -> Result<(), RuntimeError> {
    let max_parallel = self.graph.config().max_parallel_steps.max(1);
    let mut running: FuturesUnordered<StepFuture> = FuturesUnordered::new();

    loop {
      if cancel.is_cancelled() && !self.cancelled {
        warn!(run_id = %self.run_id, in_flight = running.len(), "workflow_cancelled");
        self.cancelled = true;
      }

      if self.halted_by.is_none() && !self.cancelled {
        while running.len() < max_parallel {
          let Some(index) = self.ready.pop_first() else {
            break;
          };
          if !self.condition_holds(index, context) {
            self.skip_unmet(index);
            continue;
          }
          running.push(self.launch(index, context, cancel));
        }
      }

      let next = tokio::select! {
        next = running.next() => next,
        _ = cancel.cancelled(), if !self.cancelled && !running.is_empty() => continue,
      };
      let Some((index, joined)) = next else {
        break;
      };

      let outcome = joined.unwrap_or_else(|e| StepOutcome {
        result: Err(StepError::Panicked {
          step_id: self.graph.topology().id(index).to_string(),
          attempt: 0,
          message: e.to_string(),
        }),
        attempts: 0,
        duration: Duration::ZERO,
      });
      self.complete(index, outcome, context)?;
    }

    let leftover: Vec<usize> = (0..self.records.len())
      .filter(|&i| self.records[i].state == StepState::Pending)
      .collect();
    for index in leftover {
      let reason = if self.cancelled {
        SkipReason::Cancelled
      } else if let Some(failed) = &self.halted_by {
        SkipReason::Halted {
          failed: failed.clone(),
        }
      } else {
        return Err(RuntimeError::InvariantViolation {
          message: format!(
            "step '{}' never became ready",
            self.graph.topology().id(index)
          ),
        });
      };
      self.skip(index, reason);
    }

    Ok(())
  }

  /// Mark a step running and spawn its task.
  fn launch(
    &mut self,
    index: usize,
    context: &Arc<ExecutionContext>,
    cancel: &CancellationToken,
  ) -> StepFuture {
    let step = self.graph.steps()[index].clone();
    self.records[index].state = StepState::Running;
    self.execution_order.push(step.id().to_string());

    let task = StepTask {
      timeout: self.graph.timeout_for(&step),
      policy: self.graph.retry_policy_for(&step),
      step,
      context: context.clone(),
      notifier: self.notifier.clone(),
      cancel: cancel.clone(),
      run_id: self.run_id.clone(),
    };
    let span = info_span!("step", step_id = %task.step.id(), run_id = %self.run_id);
    let mut task = AbortOnDrop(tokio::spawn(task.run().instrument(span)));

    async move { (index, (&mut task.0).await) }.boxed()
  }

  /// Evaluate a ready step's condition. A panicking condition counts as false.
  fn condition_holds(&self, index: usize, context: &ExecutionContext) -> bool {
    let Some(condition) = self.graph.steps()[index].condition() else {
      return true;
    };
    catch_unwind(AssertUnwindSafe(|| condition(context))).unwrap_or_else(|panic| {
      warn!(
        run_id = %self.run_id,
        step_id = %self.graph.topology().id(index),
        error = %panic_message(&*panic),
        "step_condition_panicked"
      );
      false
    })
  }

  /// Skip a step whose condition did not hold, and everything after it.
  fn skip_unmet(&mut self, index: usize) {
    self.skip(index, SkipReason::ConditionNotMet);

    let step_id = self.graph.topology().id(index).to_string();
    for dependent in self.graph.topology().transitive_dependents(index) {
      if self.records[dependent].state == StepState::Pending {
        self.skip(
          dependent,
          SkipReason::DependencySkipped {
            dependency: step_id.clone(),
          },
        );
      }
    }
  }

  /// Apply a finished step's outcome and propagate it to dependents.
  fn complete(
    &mut self,
    index: usize,
    outcome: StepOutcome,
    context: &ExecutionContext,
  ) -> Result<(), RuntimeError> {
    let step_id = self.graph.topology().id(index).to_string();
    let record = &mut self.records[index];
    record.attempts = outcome.attempts;
    record.duration_ms = outcome.duration.as_millis() as u64;

    match outcome.result {
      Ok(output) => {
        context
          .record_result(&step_id, output.clone())
          .map_err(|e| RuntimeError::InvariantViolation {
            message: e.to_string(),
          })?;
        record.state = StepState::Succeeded;
        record.output = Some(output);

        info!(
          run_id = %self.run_id,
          step_id = %step_id,
          attempts = outcome.attempts,
          duration_ms = record.duration_ms,
          "step_succeeded"
        );
        self.notifier.notify(ExecutionEvent::StepSucceeded {
          run_id: self.run_id.clone(),
          step_id,
          attempts: outcome.attempts,
        });

        for &dependent in self.graph.topology().downstream(index) {
          self.waiting[dependent] -= 1;
          if self.waiting[dependent] == 0 && self.records[dependent].state == StepState::Pending {
            self.ready.insert(dependent);
          }
        }
      }
      Err(step_error) => {
        record.state = StepState::Failed;
        record.error = Some(step_error.clone());

        error!(
          run_id = %self.run_id,
          step_id = %step_id,
          attempts = outcome.attempts,
          error = %step_error,
          "step_failed"
        );
        self.notifier.notify(ExecutionEvent::StepFailed {
          run_id: self.run_id.clone(),
          step_id: step_id.clone(),
          attempts: outcome.attempts,
          error: step_error.to_string(),
        });

        if self.graph.config().stop_on_error && self.halted_by.is_none() && !self.cancelled {
          warn!(run_id = %self.run_id, step_id = %step_id, "workflow_halted");
          self.halted_by = Some(step_id.clone());
          self.aborted = true;
        }

        for dependent in self.graph.topology().transitive_dependents(index) {
          if self.records[dependent].state == StepState::Pending {
            self.skip(
              dependent,
              SkipReason::DependencyFailed {
                dependency: step_id.clone(),
              },
            );
          }
        }
      }
    }

    Ok(())
  }

  fn skip(&mut self, index: usize, reason: SkipReason) {
    self.ready.remove(&index);
    let record = &mut self.records[index];
    record.state = StepState::Skipped;

    info!(
      run_id = %self.run_id,
      step_id = %record.step_id,
      reason = %reason,
      "step_skipped"
    );
    self.notifier.notify(ExecutionEvent::StepSkipped {
      run_id: self.run_id.clone(),
      step_id: record.step_id.clone(),
      reason: reason.to_string(),
    });
    record.skip_reason = Some(reason);
  }
}

/// A step's attempt loop, run on its own task.
struct StepTask<N> {
  step: Arc<Step>,
  context: Arc<ExecutionContext>,
  notifier: Arc<N>,
  cancel: CancellationToken,
  run_id: String,
  timeout: Duration,
  policy: RetryPolicy,
}

impl<N: ExecutionNotifier + 'static> StepTask<N> {
  async fn run(self) -> StepOutcome {
    let started = Instant::now();
    let step_id = self.step.id().to_string();
    let mut attempt = 0;

    loop {
      attempt += 1;
      info!(run_id = %self.run_id, step_id = %step_id, attempt, "step_started");
      self.notifier.notify(ExecutionEvent::StepStarted {
        run_id: self.run_id.clone(),
        step_id: step_id.clone(),
        attempt,
      });

      let result = self.attempt(attempt).await;
      let error = match result {
        Ok(output) => {
          return StepOutcome {
            result: Ok(output),
            attempts: attempt,
            duration: started.elapsed(),
          };
        }
        Err(e) => e,
      };

      let retryable = !matches!(error, StepError::Cancelled { .. });
      if !retryable || attempt >= self.policy.max_attempts() {
        return StepOutcome {
          result: Err(error),
          attempts: attempt,
          duration: started.elapsed(),
        };
      }

      let delay = self.policy.delay_after(attempt);
      warn!(
        run_id = %self.run_id,
        step_id = %step_id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "step_retrying"
      );
      self.notifier.notify(ExecutionEvent::StepRetrying {
        run_id: self.run_id.clone(),
        step_id: step_id.clone(),
        attempt,
        delay_ms: delay.as_millis() as u64,
        error: error.to_string(),
      });

      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = self.cancel.cancelled() => {
          return StepOutcome {
            result: Err(StepError::Cancelled { step_id, attempt }),
            attempts: attempt,
            duration: started.elapsed(),
          };
        }
      }
      if delay.is_zero() {
        tokio::task::yield_now().await;
      }
    }
  }

  /// One bounded attempt. The delegate future is dropped on timeout or
  /// cancellation, and the attempt's token is cancelled.
  async fn attempt(&self, attempt: u32) -> Result<Value, StepError> {
    let step_id = self.step.id().to_string();
    let attempt_cancel = self.cancel.child_token();
    let call = StepCall::new(
      self.context.clone(),
      self.step.clone(),
      attempt,
      attempt_cancel.clone(),
    );
    let delegate = self.step.delegate().clone();
    let work = AssertUnwindSafe(async move { delegate.execute(call).await }).catch_unwind();

    let outcome = tokio::select! {
      outcome = tokio::time::timeout(self.timeout, work) => outcome,
      _ = attempt_cancel.cancelled() => {
        return Err(StepError::Cancelled { step_id, attempt });
      }
    };

    match outcome {
      Err(_elapsed) => {
        attempt_cancel.cancel();
        Err(StepError::Timeout {
          step_id,
          attempt,
          timeout_ms: self.timeout.as_millis() as u64,
        })
      }
      Ok(Err(panic)) => Err(StepError::Panicked {
        step_id,
        attempt,
        message: panic_message(&*panic),
      }),
      Ok(Ok(Err(e))) => Err(StepError::Execution {
        step_id,
        attempt,
        message: format!("{e:#}"),
      }),
      Ok(Ok(Ok(output))) => Ok(output),
    }
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::builder::WorkflowBuilder;
  use crate::step::delegate_fn;
  use serde_json::json;
  use stepflow_config::ExecutionConfig;

  #[tokio::test]
  async fn test_empty_workflow_completes() {
    let graph = WorkflowBuilder::new("empty").build().unwrap();
    let result = Runner::new().execute(&graph).await.unwrap();

    assert!(result.success);
    assert!(result.steps.is_empty());
    assert_eq!(result.success_rate(), 100.0);
    assert_eq!(result.final_output(), None);
  }

  #[tokio::test]
  async fn test_dependent_reads_upstream_result() {
    let graph = WorkflowBuilder::new("pipe")
      .add_step(Step::new(
        "produce",
        "Produce",
        delegate_fn(|_call| async { Ok(json!(21)) }),
      ))
      .unwrap()
      .add_step(
        Step::new(
          "double",
          "Double",
          delegate_fn(|call: StepCall| async move {
            let n: u64 = call.context().result_as("produce")?;
            Ok(json!(n * 2))
          }),
        )
        .depends_on(["produce"]),
      )
      .unwrap()
      .build()
      .unwrap();

    let result = Runner::new().execute(&graph).await.unwrap();
    assert_eq!(result.output("double"), Some(&json!(42)));
    assert_eq!(result.final_output(), Some(&json!(42)));
  }

  #[tokio::test]
  async fn test_panic_is_a_failed_attempt() {
    let graph = WorkflowBuilder::new("panics")
      .with_config(ExecutionConfig {
        default_retry_count: 0,
        ..Default::default()
      })
      .add_step(Step::new(
        "boom",
        "Boom",
        delegate_fn(|_call| async { panic!("delegate exploded") }),
      ))
      .unwrap()
      .build()
      .unwrap();

    let result = Runner::new().execute(&graph).await.unwrap();
    let record = result.step("boom").unwrap();
    assert_eq!(record.state, StepState::Failed);
    assert_eq!(
      record.error,
      Some(StepError::Panicked {
        step_id: "boom".to_string(),
        attempt: 1,
        message: "delegate exploded".to_string(),
      })
    );
  }

  #[test]
  fn test_panic_message_payloads() {
    assert_eq!(panic_message(&"static"), "static");
    assert_eq!(panic_message(&String::from("owned")), "owned");
    assert_eq!(panic_message(&42u8), "unknown panic payload");
  }
}
