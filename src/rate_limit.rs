//! Shared request pacing for the metadata service.
//!
//! All workers funnel their lookups through one [`RateLimiter`], so the
//! combined request rate stays under the configured interval no matter how
//! many workers run.

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }

    /// Blocks until the caller may issue one request. The slot is reserved
    /// under the lock; the sleep happens after releasing it.
    pub fn acquire(&self) {
        if self.is_disabled() {
            return;
        }
        let wait = {
            let mut guard = match self.next_slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let slot = match *guard {
                Some(next) if next > now => next,
                _ => now,
            };
            *guard = Some(slot + self.interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "metadata rate limit");
            thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_request_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        let start = Instant::now();
        limiter.acquire();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn consecutive_requests_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        limiter.acquire();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn spacing_holds_across_threads() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(40)));
        let start = Instant::now();
        let handles = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || limiter.acquire())
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn disabled_never_waits() {
        let limiter = RateLimiter::disabled();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire();
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
