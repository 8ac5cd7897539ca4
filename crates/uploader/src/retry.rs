use std::time::Duration;

use crate::error::BackendError;

/// Decides whether and when a failed call is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Whether another attempt follows `attempts_made` failed ones.
    pub fn should_retry(&self, attempts_made: u32, err: &BackendError) -> bool {
        err.is_retryable() && attempts_made <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based): `retry * base_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry)
    }

    /// Total attempts a call may receive.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}
