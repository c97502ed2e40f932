use std::time::Duration;

use stepflow_config::{ExecutionConfig, RetryBackoff};

/// Retry limits and backoff for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Retries after the first attempt.
  pub max_retries: u32,
  pub backoff: RetryBackoff,
  pub initial_delay: Duration,
  /// Upper bound on any single delay.
  pub max_delay: Duration,
}

impl RetryPolicy {
  /// Policy for a step with `retry_count` retries under `config`'s backoff.
  pub fn new(config: &ExecutionConfig, retry_count: u32) -> Self {
    Self {
      max_retries: retry_count,
      backoff: config.retry_backoff,
      initial_delay: config.retry_initial_delay(),
      max_delay: config.retry_max_delay(),
    }
  }

  /// Total attempts, including the first.
  pub fn max_attempts(&self) -> u32 {
    self.max_retries.saturating_add(1)
  }

  /// Delay before the attempt following failed attempt `attempt` (1-based).
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let delay = match self.backoff {
      RetryBackoff::None => Duration::ZERO,
      RetryBackoff::Constant => self.initial_delay,
      RetryBackoff::Linear => self.initial_delay.saturating_mul(attempt),
      RetryBackoff::Exponential => {
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
      }
    };
    delay.min(self.max_delay)
  }
}
