//! Exponential backoff between rebuild attempts.

use std::time::Duration;

/// Delay doubling from `min` up to `max` on consecutive failures.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub(crate) const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, attempt: 0 }
    }

    /// Delay for the given 1-based failure count.
    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Records a failure and returns how long to wait.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay_for_attempt(self.attempt)
    }

    /// Forgets previous failures.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
