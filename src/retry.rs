//! Bounded per-record retry with exponential backoff.
//!
//! Only fetch failures that can plausibly clear up on their own are retried
//! (see [`FetchFailure::is_retryable`](crate::acquire::FetchFailure::is_retryable)).
//! The delay before attempt `n + 1` is `min(base * 2^(n-1), max)` plus up to
//! [`MAX_JITTER`] of random jitter.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(16);
pub const MAX_JITTER: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (1-based), or `None` once
    /// the budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        Some(backoff + self.jitter())
    }

    fn jitter(&self) -> Duration {
        if !self.jitter || MAX_JITTER.is_zero() {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(6)
            .with_delays(Duration::from_secs(1), Duration::from_secs(4))
            .without_jitter();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_after(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_after(4), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_after(6), None);
    }

    #[test]
    fn single_attempt_never_retries() {
        assert_eq!(RetryPolicy::none().delay_after(1), None);
        assert_eq!(RetryPolicy::new(0).max_attempts(), 1);
    }

    #[test]
    fn jitter_is_bounded() {
        let policy =
            RetryPolicy::new(3).with_delays(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let delay = policy.delay_after(1).unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(100) + MAX_JITTER);
        }
    }
}
