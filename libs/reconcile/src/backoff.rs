//! Exponential backoff for job requeues.

use std::time::Duration;

/// Longest delay a requeue may carry (the delayed queue's ceiling).
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(900);

/// Backoff settings for re-checking a job that may not be visible yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    /// Requeues allowed per job.
    pub max_attempts: u32,

    /// Delay before the first requeue.
    pub base_delay: Duration,

    /// Multiplier applied per previous requeue.
    pub factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl RetryBackoff {
    /// Delay for the next requeue of a job already requeued `retry_count`
    /// times, or `None` once `max_attempts` is reached.
    ///
    /// `min(base * factor^retry_count, 900s)`, truncated to whole seconds.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_attempts {
            return None;
        }

        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = if seconds.is_finite() {
            seconds.min(MAX_RETRY_DELAY.as_secs_f64())
        } else {
            MAX_RETRY_DELAY.as_secs_f64()
        };

        Some(Duration::from_secs(capped.max(0.0) as u64))
    }
}
