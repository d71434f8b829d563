//! Write-rate limiter.
//!
//! Token bucket refilled continuously at the effective rate. The effective
//! rate starts at the configured limit; write errors and slow commits
//! shrink it multiplicatively (never below `min_limit`), and a run of
//! `recovery_successes` fast commits grows it back by `increase_step`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::clock::Clock;

/// Write-rate limit configuration. Disabled by default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Entries per second.
    pub limit: u64,
    /// Adapt the effective rate to commit latency and errors.
    pub throttling: bool,
    /// Lower bound for the effective rate, entries per second.
    pub min_limit: u64,
    /// Multiplier applied to the effective rate on congestion.
    pub backoff_ratio: f64,
    /// Commits slower than this count as congestion.
    pub expected_commit_latency_ms: u64,
    /// Fast commits needed before the effective rate grows again.
    pub recovery_successes: u32,
    /// Additive growth per recovery, entries per second.
    pub increase_step: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 10_000,
            throttling: true,
            min_limit: 100,
            backoff_ratio: 0.5,
            expected_commit_latency_ms: 1_000,
            recovery_successes: 100,
            increase_step: 100,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill_millis: i64,
    effective_limit: f64,
    consecutive_successes: u32,
}

/// Token-bucket limiter over a `Clock`.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let limit = config.limit as f64;
        let now = clock.now_millis();
        Self {
            config,
            clock,
            bucket: Mutex::new(Bucket {
                tokens: limit,
                last_refill_millis: now,
                effective_limit: limit,
                consecutive_successes: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Largest batch the bucket can ever admit. `None` when disabled.
    pub fn max_batch(&self) -> Option<usize> {
        self.config
            .enabled
            .then(|| usize::try_from(self.config.limit).unwrap_or(usize::MAX))
    }

    /// Take `count` tokens if available. Always succeeds when disabled.
    pub fn try_acquire(&self, count: usize) -> bool {
        if !self.config.enabled {
            return true;
        }
        let Ok(mut bucket) = self.bucket.lock() else {
            return false;
        };
        self.refill(&mut bucket);
        let needed = count as f64;
        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Report a committed write.
    pub fn on_commit(&self, latency: Duration) {
        if !self.adapts() {
            return;
        }
        if latency > Duration::from_millis(self.config.expected_commit_latency_ms) {
            self.throttle("slow commit");
            return;
        }
        let Ok(mut bucket) = self.bucket.lock() else {
            return;
        };
        bucket.consecutive_successes += 1;
        if bucket.consecutive_successes >= self.config.recovery_successes {
            bucket.consecutive_successes = 0;
            bucket.effective_limit = (bucket.effective_limit + self.config.increase_step as f64)
                .min(self.config.limit as f64);
        }
    }

    /// Report a failed write.
    pub fn on_error(&self) {
        if self.adapts() {
            self.throttle("write error");
        }
    }

    /// Current effective rate, entries per second.
    pub fn effective_limit(&self) -> u64 {
        self.bucket
            .lock()
            .map(|b| b.effective_limit as u64)
            .unwrap_or(0)
    }

    fn adapts(&self) -> bool {
        self.config.enabled && self.config.throttling
    }

    fn throttle(&self, reason: &'static str) {
        let Ok(mut bucket) = self.bucket.lock() else {
            return;
        };
        bucket.consecutive_successes = 0;
        bucket.effective_limit = (bucket.effective_limit * self.config.backoff_ratio)
            .max(self.config.min_limit as f64);
        bucket.tokens = bucket.tokens.min(bucket.effective_limit);
        debug!(
            reason,
            effective_limit = bucket.effective_limit as u64,
            "Throttled write rate"
        );
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = self.clock.now_millis();
        let elapsed = (now - bucket.last_refill_millis).max(0) as f64;
        bucket.tokens =
            (bucket.tokens + elapsed * bucket.effective_limit / 1_000.0).min(bucket.effective_limit);
        bucket.last_refill_millis = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ControlledClock;

    fn limiter(clock: Arc<ControlledClock>) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig {
                enabled: true,
                limit: 10,
                min_limit: 2,
                recovery_successes: 2,
                increase_step: 3,
                ..Default::default()
            },
            clock,
        )
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(
            RateLimitConfig::default(),
            Arc::new(ControlledClock::new(0)),
        );
        assert!(limiter.try_acquire(1_000_000));
    }

    #[test]
    fn test_max_batch_follows_configured_limit() {
        let clock = Arc::new(ControlledClock::new(0));
        let limiter = limiter(clock.clone());
        assert_eq!(limiter.max_batch(), Some(10));

        // A batch over the limit never fits, however long we wait.
        clock.increase_time(Duration::from_secs(60));
        assert!(!limiter.try_acquire(11));

        let disabled = RateLimiter::new(RateLimitConfig::default(), clock);
        assert_eq!(disabled.max_batch(), None);
    }

    #[test]
    fn test_tokens_exhaust_and_refill_with_time() {
        let clock = Arc::new(ControlledClock::new(0));
        let limiter = limiter(clock.clone());

        assert!(limiter.try_acquire(10));
        assert!(!limiter.try_acquire(1));

        clock.increase_time(Duration::from_millis(100));
        assert!(limiter.try_acquire(1));
        assert!(!limiter.try_acquire(1));
    }

    #[test]
    fn test_errors_shrink_and_successes_recover_the_rate() {
        let clock = Arc::new(ControlledClock::new(0));
        let limiter = limiter(clock);

        limiter.on_error();
        assert_eq!(limiter.effective_limit(), 5);
        limiter.on_error();
        limiter.on_error();
        assert_eq!(limiter.effective_limit(), 2);

        limiter.on_commit(Duration::from_millis(1));
        limiter.on_commit(Duration::from_millis(1));
        assert_eq!(limiter.effective_limit(), 5);
    }

    #[test]
    fn test_slow_commit_counts_as_congestion() {
        let limiter = limiter(Arc::new(ControlledClock::new(0)));
        limiter.on_commit(Duration::from_secs(5));
        assert_eq!(limiter.effective_limit(), 5);
    }
}
