//! Execution events and notifiers.
//!
//! The runner emits an event at every step transition so callers can
//! observe a run as it happens: persist progress, stream to a UI, or
//! collect timings in tests.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted during a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
  WorkflowStarted { run_id: String, workflow: String },

  /// An attempt of a step has been handed to its delegate.
  StepStarted {
    run_id: String,
    step_id: String,
    attempt: u32,
  },

  /// An attempt failed and another will follow after `delay_ms`.
  StepRetrying {
    run_id: String,
    step_id: String,
    attempt: u32,
    delay_ms: u64,
    error: String,
  },

  StepSucceeded {
    run_id: String,
    step_id: String,
    attempts: u32,
  },

  /// The step's final attempt failed.
  StepFailed {
    run_id: String,
    step_id: String,
    attempts: u32,
    error: String,
  },

  /// The step will never run.
  StepSkipped {
    run_id: String,
    step_id: String,
    reason: String,
  },

  WorkflowCompleted { run_id: String, success: bool },
}

/// Receives execution events.
///
/// Called inline from the runner and from step tasks, so implementations
/// must not block.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Forwards events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls the scheduler. Volume is a
  // handful of events per step.
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }

  /// Create a notifier together with the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_channel_notifier_forwards_events() {
    let (notifier, mut receiver) = ChannelNotifier::channel();
    notifier.notify(ExecutionEvent::WorkflowCompleted {
      run_id: "r1".to_string(),
      success: true,
    });

    assert_eq!(
      receiver.try_recv().unwrap(),
      ExecutionEvent::WorkflowCompleted {
        run_id: "r1".to_string(),
        success: true,
      }
    );
  }

  #[test]
  fn test_channel_notifier_ignores_dropped_receiver() {
    let (notifier, receiver) = ChannelNotifier::channel();
    drop(receiver);
    notifier.notify(ExecutionEvent::WorkflowStarted {
      run_id: "r1".to_string(),
      workflow: "w".to_string(),
    });
  }

  #[test]
  fn test_event_serialization() {
    let event = ExecutionEvent::StepSkipped {
      run_id: "r1".to_string(),
      step_id: "load".to_string(),
      reason: "dependency 'extract' failed".to_string(),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "step_skipped");
    assert_eq!(json["step_id"], "load");
  }
}
