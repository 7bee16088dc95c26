//! Exponential backoff policy with jitter
//!
//! Pure attempt-index to delay mapping used by the executor between retry
//! attempts and by the rate limiter as its queue polling cadence.

use rand::Rng;
use std::time::Duration;

/// Backoff policy configuration
///
/// `delay(n)` grows as `base * 2^n` up to `ceiling`, plus a uniform random
/// jitter in `0..=max_jitter` to spread out synchronized retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on the exponential part
    pub ceiling: Duration,
    /// Maximum uniform jitter added on top of the exponential part
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            ceiling: Duration::from_secs(10),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with a custom base delay
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    /// Set the ceiling
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Set the maximum jitter
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Delay before retrying after `attempt` failed attempts
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max_ms = self.max_jitter.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
        };
        self.delay_without_jitter(attempt) + jitter
    }

    /// The deterministic part of the delay, exposed for polling cadences
    /// and tests
    pub fn delay_without_jitter(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let exponential = self
            .base
            .checked_mul(factor)
            .unwrap_or(Duration::from_secs(u64::MAX / 2));
        exponential.min(self.ceiling)
    }
}
