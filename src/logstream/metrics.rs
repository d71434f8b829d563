//! Per-partition log stream metrics.
//!
//! Always kept as in-process atomics (tests and operators read them through
//! `snapshot()`); mirrored to OpenTelemetry when the `otel` feature is on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::record::PartitionId;

use super::flow_control::Rejection;

#[cfg(feature = "otel")]
use crate::utils::metrics::{
    partition_attr, reason_attr, LOG_APPEND_TOTAL, LOG_COMMIT_LATENCY, LOG_REJECTED_TOTAL,
    LOG_REQUEST_LIMIT,
};

/// Counters for one partition's log stream.
#[derive(Debug)]
pub struct LogStreamMetrics {
    partition_id: PartitionId,
    appended: AtomicU64,
    rejected_request_limit: AtomicU64,
    rejected_write_rate: AtomicU64,
    committed: AtomicU64,
    dropped: AtomicU64,
    in_flight: AtomicU64,
    request_limit: AtomicU64,
    removed: AtomicBool,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStreamMetricsSnapshot {
    pub appended: u64,
    pub rejected_request_limit: u64,
    pub rejected_write_rate: u64,
    pub committed: u64,
    pub dropped: u64,
    pub in_flight: u64,
    pub request_limit: u64,
}

impl LogStreamMetrics {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            appended: AtomicU64::new(0),
            rejected_request_limit: AtomicU64::new(0),
            rejected_write_rate: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            request_limit: AtomicU64::new(0),
            removed: AtomicBool::new(false),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn record_append(&self, entries: usize) {
        if self.is_removed() {
            return;
        }
        self.appended.fetch_add(entries as u64, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        LOG_APPEND_TOTAL.add(entries as u64, &[partition_attr(self.partition_id)]);
    }

    pub fn record_rejection(&self, rejection: Rejection) {
        if self.is_removed() {
            return;
        }
        let counter = match rejection {
            Rejection::RequestLimitExhausted => &self.rejected_request_limit,
            Rejection::WriteRateLimitExhausted => &self.rejected_write_rate,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        LOG_REJECTED_TOTAL.add(
            1,
            &[
                partition_attr(self.partition_id),
                reason_attr(rejection.as_str()),
            ],
        );
    }

    pub fn record_commit(&self, latency: Duration) {
        if self.is_removed() {
            return;
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        LOG_COMMIT_LATENCY.record(latency.as_secs_f64(), &[partition_attr(self.partition_id)]);
        #[cfg(not(feature = "otel"))]
        let _ = latency;
    }

    pub fn record_dropped(&self) {
        if !self.is_removed() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        if !self.is_removed() {
            self.in_flight.store(in_flight as u64, Ordering::Relaxed);
        }
    }

    pub fn set_request_limit(&self, limit: usize) {
        if self.is_removed() {
            return;
        }
        self.request_limit.store(limit as u64, Ordering::Relaxed);
        #[cfg(feature = "otel")]
        LOG_REQUEST_LIMIT.record(limit as u64, &[partition_attr(self.partition_id)]);
    }

    pub fn snapshot(&self) -> LogStreamMetricsSnapshot {
        LogStreamMetricsSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            rejected_request_limit: self.rejected_request_limit.load(Ordering::Relaxed),
            rejected_write_rate: self.rejected_write_rate.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            request_limit: self.request_limit.load(Ordering::Relaxed),
        }
    }

    /// Stop recording and zero the gauges. Counters keep their totals.
    pub fn remove(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.in_flight.store(0, Ordering::Relaxed);
        self.request_limit.store(0, Ordering::Relaxed);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_counted_by_reason() {
        let metrics = LogStreamMetrics::new(1);
        metrics.record_rejection(Rejection::RequestLimitExhausted);
        metrics.record_rejection(Rejection::WriteRateLimitExhausted);
        metrics.record_rejection(Rejection::WriteRateLimitExhausted);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rejected_request_limit, 1);
        assert_eq!(snapshot.rejected_write_rate, 2);
    }

    #[test]
    fn test_removed_metrics_stop_recording() {
        let metrics = LogStreamMetrics::new(1);
        metrics.record_append(3);
        metrics.set_in_flight(2);
        metrics.remove();
        metrics.record_append(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.appended, 3);
        assert_eq!(snapshot.in_flight, 0);
        assert!(metrics.is_removed());
    }
}
