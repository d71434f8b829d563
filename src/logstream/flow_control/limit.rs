//! Request (concurrency) limits.
//!
//! A `Limit` decides how many appends may be in flight at once. Every
//! completed request reports a sample (round-trip time, in-flight count at
//! completion, and whether it was dropped) so adaptive limits can move.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

/// Default in-flight limit for `Fixed`.
pub const DEFAULT_FIXED_LIMIT: usize = 1_000;

/// Concurrency limit algorithm.
pub trait Limit: Send + Sync {
    /// Current maximum number of in-flight requests.
    fn current(&self) -> usize;

    /// Report a completed request.
    fn on_sample(&self, rtt: Duration, in_flight: usize, dropped: bool);
}

/// Request limit configuration.
///
/// ```yaml
/// request_limit:
///   algorithm: aimd
///   initial_limit: 100
///   min_limit: 1
///   max_limit: 1000
///   backoff_ratio: 0.9
///   expected_rtt_ms: 200
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RequestLimitConfig {
    /// Constant limit.
    Fixed {
        #[serde(default = "default_fixed_limit")]
        limit: usize,
    },
    /// Additive increase, multiplicative decrease.
    Aimd(AimdConfig),
}

fn default_fixed_limit() -> usize {
    DEFAULT_FIXED_LIMIT
}

impl Default for RequestLimitConfig {
    fn default() -> Self {
        RequestLimitConfig::Aimd(AimdConfig::default())
    }
}

impl RequestLimitConfig {
    /// Build the configured limit.
    pub fn build(&self) -> Arc<dyn Limit> {
        match self {
            RequestLimitConfig::Fixed { limit } => Arc::new(FixedLimit::new(*limit)),
            RequestLimitConfig::Aimd(config) => Arc::new(AimdLimit::new(config.clone())),
        }
    }
}

/// AIMD tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AimdConfig {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    /// Multiplier applied on a drop or a slow sample. Must be in (0, 1).
    pub backoff_ratio: f64,
    /// Samples slower than this count as congestion.
    pub expected_rtt_ms: u64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            initial_limit: 100,
            min_limit: 1,
            max_limit: 1_000,
            backoff_ratio: 0.9,
            expected_rtt_ms: 200,
        }
    }
}

/// Constant limit.
#[derive(Debug)]
pub struct FixedLimit {
    limit: usize,
}

impl FixedLimit {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl Limit for FixedLimit {
    fn current(&self) -> usize {
        self.limit
    }

    fn on_sample(&self, _rtt: Duration, _in_flight: usize, _dropped: bool) {}
}

/// Additive-increase, multiplicative-decrease limit.
#[derive(Debug)]
pub struct AimdLimit {
    config: AimdConfig,
    limit: AtomicUsize,
}

impl AimdLimit {
    pub fn new(config: AimdConfig) -> Self {
        let initial = config
            .initial_limit
            .clamp(config.min_limit, config.max_limit.max(config.min_limit));
        Self {
            config,
            limit: AtomicUsize::new(initial),
        }
    }
}

impl Limit for AimdLimit {
    fn current(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    fn on_sample(&self, rtt: Duration, in_flight: usize, dropped: bool) {
        let expected = Duration::from_millis(self.config.expected_rtt_ms);
        let _ = self
            .limit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |limit| {
                let next = if dropped || rtt > expected {
                    ((limit as f64 * self.config.backoff_ratio).floor() as usize)
                        .max(self.config.min_limit)
                } else if in_flight * 2 >= limit {
                    (limit + 1).min(self.config.max_limit)
                } else {
                    limit
                };
                (next != limit).then_some(next)
            });
        trace!(
            limit = self.current(),
            rtt_ms = rtt.as_millis() as u64,
            in_flight,
            dropped,
            "AIMD sample"
        );
    }
}

/// Tracks in-flight requests against a `Limit`.
pub struct RequestLimiter {
    limit: Arc<dyn Limit>,
    in_flight: AtomicUsize,
}

impl RequestLimiter {
    pub fn new(limit: Arc<dyn Limit>) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Take an in-flight slot if one is free.
    pub fn try_acquire(&self) -> bool {
        let limit = self.limit.current();
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Release a slot and feed the sample to the limit.
    pub fn release(&self, rtt: Duration, dropped: bool) {
        let before = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        self.limit.on_sample(rtt, before, dropped);
    }

    /// Give a slot back without reporting a sample.
    pub fn cancel(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aimd(initial: usize) -> AimdLimit {
        AimdLimit::new(AimdConfig {
            initial_limit: initial,
            min_limit: 2,
            max_limit: 12,
            backoff_ratio: 0.5,
            expected_rtt_ms: 100,
        })
    }

    #[test]
    fn test_aimd_grows_when_busy() {
        let limit = aimd(10);
        limit.on_sample(Duration::from_millis(5), 5, false);
        assert_eq!(limit.current(), 11);
    }

    #[test]
    fn test_aimd_holds_when_underused() {
        let limit = aimd(10);
        limit.on_sample(Duration::from_millis(5), 1, false);
        assert_eq!(limit.current(), 10);
    }

    #[test]
    fn test_aimd_caps_at_max() {
        let limit = aimd(12);
        limit.on_sample(Duration::from_millis(5), 12, false);
        assert_eq!(limit.current(), 12);
    }

    #[test]
    fn test_aimd_backs_off_on_drop_and_slow_sample() {
        let limit = aimd(10);
        limit.on_sample(Duration::from_millis(5), 5, true);
        assert_eq!(limit.current(), 5);
        limit.on_sample(Duration::from_millis(500), 5, false);
        assert_eq!(limit.current(), 2);
        limit.on_sample(Duration::from_millis(500), 5, false);
        assert_eq!(limit.current(), 2);
    }

    #[test]
    fn test_limiter_rejects_past_limit() {
        let limiter = RequestLimiter::new(Arc::new(FixedLimit::new(2)));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.release(Duration::ZERO, false);
        assert_eq!(limiter.in_flight(), 1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_request_limit_config_parses_tagged_algorithm() {
        let config: RequestLimitConfig =
            serde_json::from_str(r#"{"algorithm":"fixed","limit":7}"#).unwrap();
        assert_eq!(config, RequestLimitConfig::Fixed { limit: 7 });
        assert_eq!(config.build().current(), 7);

        let config: RequestLimitConfig =
            serde_json::from_str(r#"{"algorithm":"aimd","max_limit":50}"#).unwrap();
        match config {
            RequestLimitConfig::Aimd(aimd) => {
                assert_eq!(aimd.max_limit, 50);
                assert_eq!(aimd.initial_limit, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
