use serde::{Deserialize, Serialize};

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  /// Retry immediately, only yielding to the scheduler.
  None,
  Constant,
  Linear,
  #[default]
  Exponential,
}
