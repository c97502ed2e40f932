use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::enums::RetryBackoff;

/// Graph-wide execution defaults.
///
/// Steps may override the timeout and retry count individually; everything
/// else applies to the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
  /// Upper bound on concurrently running steps. Must be at least 1.
  pub max_parallel_steps: usize,
  /// Timeout for a single attempt when the step does not set one.
  pub default_timeout_ms: u64,
  /// Stop launching new steps once any step has failed.
  pub stop_on_error: bool,
  /// Additional attempts after the first failure when the step does not set one.
  pub default_retry_count: u32,
  pub retry_backoff: RetryBackoff,
  /// Base delay for the backoff curve.
  pub retry_initial_delay_ms: u64,
  /// Cap applied to every computed backoff delay.
  pub retry_max_delay_ms: u64,
}

impl ExecutionConfig {
  pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 3;
  pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
  pub const DEFAULT_RETRY_COUNT: u32 = 2;
  pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
  pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

  pub fn default_timeout(&self) -> Duration {
    Duration::from_millis(self.default_timeout_ms)
  }

  pub fn retry_initial_delay(&self) -> Duration {
    Duration::from_millis(self.retry_initial_delay_ms)
  }

  pub fn retry_max_delay(&self) -> Duration {
    Duration::from_millis(self.retry_max_delay_ms)
  }
}

impl Default for ExecutionConfig {
  fn default() -> Self {
    Self {
      max_parallel_steps: Self::DEFAULT_MAX_PARALLEL_STEPS,
      default_timeout_ms: Self::DEFAULT_TIMEOUT_MS,
      stop_on_error: false,
      default_retry_count: Self::DEFAULT_RETRY_COUNT,
      retry_backoff: RetryBackoff::default(),
      retry_initial_delay_ms: Self::DEFAULT_RETRY_INITIAL_DELAY_MS,
      retry_max_delay_ms: Self::DEFAULT_RETRY_MAX_DELAY_MS,
    }
  }
}
