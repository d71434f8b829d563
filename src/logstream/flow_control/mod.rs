//! Append admission control.
//!
//! Two independent gates sit in front of the sequencer:
//!
//! - the request limiter bounds appended-but-not-committed user commands
//! - the rate limiter bounds entries per second for user and
//!   inter-partition commands
//!
//! Processing results and internal writes skip both gates: their command is
//! already on the log, and refusing its follow-up records would lose them.
//!
//! Rejection is immediate. Each admitted request becomes an `InFlightEntry`
//! that storage reports back to, so commit latency and failures feed the
//! adaptive limits.

pub mod limit;
pub mod rate;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::storage::{AppendListener, StorageError};

use super::metrics::LogStreamMetrics;

pub use limit::{AimdConfig, AimdLimit, FixedLimit, Limit, RequestLimitConfig, RequestLimiter};
pub use rate::{RateLimitConfig, RateLimiter};

/// Who is asking to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteContext {
    /// A command submitted by a client.
    UserCommand,
    /// A command received from another partition.
    InterPartition,
    /// Follow-up records of a command already on the log.
    ProcessingResult,
    /// Bookkeeping written by the partition itself.
    Internal,
}

impl WriteContext {
    fn request_limited(self) -> bool {
        matches!(self, WriteContext::UserCommand)
    }

    fn rate_limited(self) -> bool {
        matches!(self, WriteContext::UserCommand | WriteContext::InterPartition)
    }
}

/// Why flow control refused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    RequestLimitExhausted,
    WriteRateLimitExhausted,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::RequestLimitExhausted => "request_limit_exhausted",
            Rejection::WriteRateLimitExhausted => "write_rate_limit_exhausted",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flow control configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub request_limit: RequestLimitConfig,
    pub write_rate: RateLimitConfig,
}

/// Admission control for one partition.
pub struct FlowControl {
    requests: Arc<RequestLimiter>,
    rate: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LogStreamMetrics>,
}

impl FlowControl {
    pub fn new(
        config: &FlowControlConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<LogStreamMetrics>,
    ) -> Self {
        let requests = Arc::new(RequestLimiter::new(config.request_limit.build()));
        metrics.set_request_limit(requests.limit());
        Self {
            requests,
            rate: Arc::new(RateLimiter::new(config.write_rate.clone(), clock.clone())),
            clock,
            metrics,
        }
    }

    /// Most entries one batch in `context` can ever be admitted with.
    /// Larger batches are rejected no matter how long the writer waits.
    pub fn max_batch_entries(&self, context: WriteContext) -> Option<usize> {
        if context.rate_limited() {
            self.rate.max_batch()
        } else {
            None
        }
    }

    /// Admit a write of `entry_count` entries, or reject it immediately.
    pub fn try_acquire(
        &self,
        context: WriteContext,
        entry_count: usize,
    ) -> Result<Arc<InFlightEntry>, Rejection> {
        let holds_slot = context.request_limited();
        if holds_slot && !self.requests.try_acquire() {
            return Err(self.reject(context, Rejection::RequestLimitExhausted));
        }

        if context.rate_limited() && !self.rate.try_acquire(entry_count) {
            if holds_slot {
                self.requests.cancel();
            }
            return Err(self.reject(context, Rejection::WriteRateLimitExhausted));
        }

        self.metrics.set_in_flight(self.requests.in_flight());
        Ok(Arc::new(InFlightEntry {
            requests: self.requests.clone(),
            rate: self.rate.clone(),
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            holds_slot,
            started_millis: self.clock.now_millis(),
            released: AtomicBool::new(false),
        }))
    }

    /// Whether a write of this shape would currently be admitted, without
    /// taking anything.
    pub fn would_admit(&self, context: WriteContext) -> bool {
        !context.request_limited() || self.requests.in_flight() < self.requests.limit()
    }

    pub fn in_flight(&self) -> usize {
        self.requests.in_flight()
    }

    pub fn request_limit(&self) -> usize {
        self.requests.limit()
    }

    pub fn effective_write_rate(&self) -> Option<u64> {
        self.rate
            .is_enabled()
            .then(|| self.rate.effective_limit())
    }

    fn reject(&self, context: WriteContext, rejection: Rejection) -> Rejection {
        trace!(?context, %rejection, "Write rejected by flow control");
        self.metrics.record_rejection(rejection);
        rejection
    }
}

/// An admitted append, waiting for storage to commit it.
///
/// Releases its request slot exactly once: on commit as a success sample,
/// on a write or commit error as a drop.
pub struct InFlightEntry {
    requests: Arc<RequestLimiter>,
    rate: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LogStreamMetrics>,
    holds_slot: bool,
    started_millis: i64,
    released: AtomicBool,
}

impl InFlightEntry {
    /// Release without a sample, for writes that never reached storage.
    pub fn abandon(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.holds_slot {
            self.requests.cancel();
        }
        self.metrics.set_in_flight(self.requests.in_flight());
    }

    fn elapsed(&self) -> Duration {
        let elapsed = self.clock.now_millis() - self.started_millis;
        Duration::from_millis(elapsed.max(0) as u64)
    }

    fn release(&self, dropped: bool) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let rtt = self.elapsed();
        if self.holds_slot {
            self.requests.release(rtt, dropped);
        }
        if dropped {
            self.rate.on_error();
            self.metrics.record_dropped();
        } else {
            self.rate.on_commit(rtt);
            self.metrics.record_commit(rtt);
        }
        self.metrics.set_in_flight(self.requests.in_flight());
        self.metrics.set_request_limit(self.requests.limit());
    }
}

impl AppendListener for InFlightEntry {
    fn on_write_error(&self, error: &StorageError) {
        debug!(error = %error, "Append failed to write");
        self.release(true);
    }

    fn on_commit(&self, _index: u64, _highest_position: i64) {
        self.release(false);
    }

    fn on_commit_error(&self, index: u64, error: &StorageError) {
        debug!(index, error = %error, "Append failed to commit");
        self.release(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ControlledClock;

    fn flow_control(limit: usize, rate: Option<u64>) -> (FlowControl, Arc<ControlledClock>) {
        let clock = Arc::new(ControlledClock::new(0));
        let config = FlowControlConfig {
            request_limit: RequestLimitConfig::Fixed { limit },
            write_rate: RateLimitConfig {
                enabled: rate.is_some(),
                limit: rate.unwrap_or(0),
                ..Default::default()
            },
        };
        let metrics = Arc::new(LogStreamMetrics::new(1));
        (FlowControl::new(&config, clock.clone(), metrics), clock)
    }

    #[test]
    fn test_user_commands_limited_until_commit() {
        let (flow, _) = flow_control(1, None);

        let first = flow.try_acquire(WriteContext::UserCommand, 1).unwrap();
        assert_eq!(
            flow.try_acquire(WriteContext::UserCommand, 1).err(),
            Some(Rejection::RequestLimitExhausted)
        );

        first.on_commit(0, 1);
        assert!(flow.try_acquire(WriteContext::UserCommand, 1).is_ok());
    }

    #[test]
    fn test_processing_results_bypass_limits() {
        let (flow, _) = flow_control(1, Some(1));
        let _held = flow.try_acquire(WriteContext::UserCommand, 1).unwrap();

        assert!(flow.try_acquire(WriteContext::ProcessingResult, 50).is_ok());
        assert!(flow.try_acquire(WriteContext::Internal, 50).is_ok());
    }

    #[test]
    fn test_inter_partition_commands_are_rate_limited_only() {
        let (flow, clock) = flow_control(1, Some(2));
        let _held = flow.try_acquire(WriteContext::UserCommand, 1).unwrap();

        assert!(flow.try_acquire(WriteContext::InterPartition, 1).is_ok());
        assert_eq!(
            flow.try_acquire(WriteContext::InterPartition, 1).err(),
            Some(Rejection::WriteRateLimitExhausted)
        );

        clock.increase_time(Duration::from_secs(1));
        assert!(flow.try_acquire(WriteContext::InterPartition, 1).is_ok());
    }

    #[test]
    fn test_rate_rejection_returns_request_slot() {
        let (flow, _) = flow_control(5, Some(1));
        assert!(flow.try_acquire(WriteContext::UserCommand, 1).is_ok());
        assert!(flow.try_acquire(WriteContext::UserCommand, 1).is_err());
        assert_eq!(flow.in_flight(), 1);
    }

    #[test]
    fn test_release_happens_once() {
        let (flow, _) = flow_control(2, None);
        let entry = flow.try_acquire(WriteContext::UserCommand, 1).unwrap();
        let _other = flow.try_acquire(WriteContext::UserCommand, 1).unwrap();

        entry.on_commit(0, 1);
        entry.on_commit_error(0, &StorageError::Closed);
        entry.abandon();
        assert_eq!(flow.in_flight(), 1);
    }
}
