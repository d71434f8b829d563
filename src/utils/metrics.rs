//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("tidelog"));

// ============================================================================
// Log Stream
// ============================================================================

/// Entries appended to a partition's log.
pub static LOG_APPEND_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tidelog.log.append.total")
        .with_description("Total log entries appended")
        .build()
});

/// Appends rejected by flow control.
pub static LOG_REJECTED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tidelog.log.rejected.total")
        .with_description("Total appends rejected by flow control")
        .build()
});

/// Append-to-commit latency.
pub static LOG_COMMIT_LATENCY: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("tidelog.log.commit.latency")
        .with_description("Append to commit latency")
        .with_unit("s")
        .build()
});

/// Current request limit.
pub static LOG_REQUEST_LIMIT: LazyLock<Gauge<u64>> = LazyLock::new(|| {
    METER
        .u64_gauge("tidelog.log.request.limit")
        .with_description("Current in-flight request limit")
        .build()
});

// ============================================================================
// Command Distribution
// ============================================================================

/// DISTRIBUTE messages sent, including redeliveries.
pub static DISTRIBUTION_SENT_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tidelog.distribution.sent.total")
        .with_description("Total distribute messages sent")
        .build()
});

/// Redeliveries triggered by the redistribution cycle.
pub static DISTRIBUTION_RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tidelog.distribution.retry.total")
        .with_description("Total distribute redeliveries")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a partition label.
pub fn partition_attr(partition_id: u32) -> KeyValue {
    KeyValue::new("partition", partition_id as i64)
}

/// Create a reason label.
pub fn reason_attr(reason: &str) -> KeyValue {
    KeyValue::new("reason", reason.to_string())
}
