//! Time sources.
//!
//! Everything time-dependent (rate limiting, commit latency, redistribution
//! backoff) reads a `Clock`, so tests can drive time explicitly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Millisecond wall or logical clock.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Logical clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ControlledClock {
    now: AtomicI64,
}

impl ControlledClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    /// Advance the clock, returning the new time.
    pub fn increase_time(&self, by: Duration) -> i64 {
        let delta = by.as_millis() as i64;
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn set_time(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ControlledClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controlled_clock_only_moves_when_advanced() {
        let clock = ControlledClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        assert_eq!(clock.increase_time(Duration::from_secs(60)), 61_000);
        assert_eq!(clock.now_millis(), 61_000);
    }

    #[test]
    fn test_set_time_moves_backwards_too() {
        let clock = ControlledClock::default();
        clock.set_time(5_000);
        assert_eq!(clock.now_millis(), 5_000);
        clock.set_time(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
