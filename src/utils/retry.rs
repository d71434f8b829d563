//! Retry utilities: backoff builders and retrying writers.
//!
//! Uses `backon` for exponential backoff with jitter. Flow control rejects
//! writes immediately instead of queueing them; callers that would rather
//! wait use `append_with_retry`.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::logstream::{Sequencer, WriteContext, WriteFailure};
use crate::record::LogAppendEntry;

/// Standard backoff for appends rejected by flow control.
///
/// - Min delay: 5ms
/// - Max delay: 1s
/// - Max attempts: 10
/// - Jitter enabled
pub fn append_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(10)
        .with_jitter()
}

/// Determines if a write failure is worth retrying.
///
/// Only flow-control rejections are transient. A closed writer stays
/// closed and an invalid batch stays invalid.
pub fn is_retryable_write(failure: &WriteFailure) -> bool {
    failure.is_retryable()
}

/// Write `entries`, retrying flow-control rejections with `backoff`.
pub async fn append_with_retry(
    writer: &Sequencer,
    context: WriteContext,
    entries: &[LogAppendEntry],
    source_position: i64,
    backoff: ExponentialBuilder,
) -> Result<i64, WriteFailure> {
    (|| async move { writer.try_write(context, entries, source_position) })
        .retry(backoff)
        .when(is_retryable_write)
        .notify(|err: &WriteFailure, dur: Duration| {
            debug!(error = %err, delay = ?dur, "Append rejected, retrying");
        })
        .await
}
