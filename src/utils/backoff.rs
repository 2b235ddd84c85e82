//! Exponential backoff as explicit state.
//!
//! [`BackoffPolicy`] is a pure function from attempt number to delay.
//! [`RetryState`] carries the attempt count and the next eligible instant so
//! schedulers can decide when to retry without looping on errors.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Delay to wait after the `failures`-th consecutive failure.
    ///
    /// The first failure waits `base_delay`; every following failure
    /// multiplies the delay, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Attempt bookkeeping for one retried unit of work.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made so far, successful or not
    pub attempts: u32,
    pub next_eligible_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt and schedule the next one.
    pub fn record_failure(
        &mut self,
        policy: &BackoffPolicy,
        now: Instant,
        error: impl Into<String>,
    ) -> Duration {
        self.attempts += 1;
        let delay = policy.delay_for(self.attempts);
        self.next_eligible_at = Some(now + delay);
        self.last_error = Some(error.into());
        delay
    }

    /// Whether another attempt is allowed given `max_retries` retries after
    /// the first attempt.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.attempts <= max_retries
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_eligible_at.map_or(true, |at| now >= at)
    }
}
