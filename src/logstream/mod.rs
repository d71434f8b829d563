//! Partition log stream.
//!
//! A `LogStream` wraps one partition's `LogStorage`:
//!
//! - a single shared `Sequencer` assigns positions and applies flow control
//! - any number of independent `LogStreamReader`s see committed entries
//! - registered `LogRecordAwaiter`s are woken on every commit
//!
//! The awaiter registry is copy-on-write: a commit dispatch iterates a
//! snapshot, so registering or removing an awaiter concurrently never drops
//! the notification for awaiters already in the snapshot.

pub mod flow_control;
pub mod metrics;
pub mod reader;
pub mod sequencer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::record::{PartitionId, NO_POSITION};
use crate::storage::{same_listener, CommitListener, LogStorage};

pub use flow_control::{FlowControl, FlowControlConfig, Rejection, WriteContext};
pub use metrics::{LogStreamMetrics, LogStreamMetricsSnapshot};
pub use reader::LogStreamReader;
pub use sequencer::{Sequencer, WriteFailure};

/// Default maximum encoded size of one batch (4 MiB).
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 4 * 1024 * 1024;

/// Errors from the log stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogStreamError {
    #[error("Log stream is closed")]
    Closed,

    #[error("Corrupted log batch: {0}")]
    Corrupted(String),
}

/// Log stream configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogStreamConfig {
    /// Maximum encoded size of one batch, in bytes.
    pub max_fragment_size: usize,
    pub flow_control: FlowControlConfig,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            flow_control: FlowControlConfig::default(),
        }
    }
}

/// Woken whenever new entries are committed.
pub trait LogRecordAwaiter: Send + Sync {
    fn on_record_available(&self);
}

/// Awaiter backed by a tokio `Notify`, for async consumers.
///
/// A notification that arrives while nobody waits is kept, so the next
/// `notified().await` returns immediately.
#[derive(Debug, Default)]
pub struct RecordAvailableSignal {
    notify: Notify,
}

impl RecordAvailableSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl LogRecordAwaiter for RecordAvailableSignal {
    fn on_record_available(&self) {
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct AwaiterRegistry {
    awaiters: RwLock<Arc<Vec<Arc<dyn LogRecordAwaiter>>>>,
}

impl AwaiterRegistry {
    fn add(&self, awaiter: Arc<dyn LogRecordAwaiter>) {
        if let Ok(mut guard) = self.awaiters.write() {
            let mut next = Vec::with_capacity(guard.len() + 1);
            next.extend(guard.iter().cloned());
            next.push(awaiter);
            *guard = Arc::new(next);
        }
    }

    fn remove(&self, awaiter: &Arc<dyn LogRecordAwaiter>) {
        if let Ok(mut guard) = self.awaiters.write() {
            let next: Vec<_> = guard
                .iter()
                .filter(|a| !same_listener(*a, awaiter))
                .cloned()
                .collect();
            *guard = Arc::new(next);
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<dyn LogRecordAwaiter>>> {
        self.awaiters
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }
}

impl CommitListener for AwaiterRegistry {
    fn on_commit(&self) {
        for awaiter in self.snapshot().iter() {
            awaiter.on_record_available();
        }
    }
}

#[derive(Default)]
struct ReaderRegistry {
    closed: bool,
    readers: Vec<Arc<AtomicBool>>,
}

/// One partition's log: a writer, readers and commit fan-out.
pub struct LogStream {
    partition_id: PartitionId,
    storage: Arc<dyn LogStorage>,
    sequencer: Arc<Sequencer>,
    metrics: Arc<LogStreamMetrics>,
    awaiters: Arc<AwaiterRegistry>,
    commit_listener: Arc<dyn CommitListener>,
    readers: Mutex<ReaderRegistry>,
}

impl LogStream {
    /// Open the log stream over existing storage. The writer continues
    /// after the last committed position, or at 1 for an empty log.
    pub fn open(
        partition_id: PartitionId,
        storage: Arc<dyn LogStorage>,
        config: &LogStreamConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let last_position =
            LogStreamReader::new(storage.new_reader(), Arc::new(AtomicBool::new(false)))
                .seek_to_end();
        let initial_position = if last_position == NO_POSITION {
            1
        } else {
            last_position + 1
        };

        let metrics = Arc::new(LogStreamMetrics::new(partition_id));
        let flow_control = Arc::new(FlowControl::new(
            &config.flow_control,
            clock,
            metrics.clone(),
        ));
        let sequencer = Arc::new(Sequencer::new(
            partition_id,
            initial_position,
            config.max_fragment_size,
            storage.clone(),
            flow_control,
            metrics.clone(),
        ));

        let awaiters = Arc::new(AwaiterRegistry::default());
        let commit_listener: Arc<dyn CommitListener> = awaiters.clone();
        storage.add_commit_listener(commit_listener.clone());

        info!(partition_id, last_position, "Opened log stream");
        Self {
            partition_id,
            storage,
            sequencer,
            metrics,
            awaiters,
            commit_listener,
            readers: Mutex::new(ReaderRegistry::default()),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// The partition's single writer.
    pub fn new_log_stream_writer(&self) -> Arc<Sequencer> {
        Arc::clone(&self.sequencer)
    }

    /// A new independent reader positioned at the start of the log.
    pub fn new_log_stream_reader(&self) -> Result<LogStreamReader, LogStreamError> {
        let mut registry = self.readers.lock().map_err(|_| LogStreamError::Closed)?;
        if registry.closed {
            return Err(LogStreamError::Closed);
        }
        registry.readers.retain(|flag| Arc::strong_count(flag) > 1);

        let closed = Arc::new(AtomicBool::new(false));
        registry.readers.push(closed.clone());
        Ok(LogStreamReader::new(self.storage.new_reader(), closed))
    }

    pub fn register_record_available_listener(&self, awaiter: Arc<dyn LogRecordAwaiter>) {
        self.awaiters.add(awaiter);
    }

    pub fn remove_record_available_listener(&self, awaiter: &Arc<dyn LogRecordAwaiter>) {
        self.awaiters.remove(awaiter);
    }

    pub fn flow_control(&self) -> &FlowControl {
        self.sequencer.flow_control()
    }

    pub fn metrics(&self) -> LogStreamMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.readers
            .lock()
            .map(|registry| registry.closed)
            .unwrap_or(true)
    }

    /// Close readers, detach from storage, release metrics and stop the
    /// writer. Idempotent.
    pub fn close(&self) {
        let readers = {
            let Ok(mut registry) = self.readers.lock() else {
                return;
            };
            if registry.closed {
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.readers)
        };

        for reader in &readers {
            reader.store(true, Ordering::SeqCst);
        }
        self.storage.remove_commit_listener(&self.commit_listener);
        self.metrics.remove();
        self.sequencer.close();
        debug!(
            partition_id = self.partition_id,
            readers = readers.len(),
            "Closed log stream"
        );
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ControlledClock;
    use crate::logstream::flow_control::RateLimitConfig;
    use crate::record::{GroupIntent, LogAppendEntry, RecordMetadata, RecordType, ValueType};
    use crate::storage::InMemoryLogStorage;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn entry(key: i64) -> LogAppendEntry {
        LogAppendEntry {
            key,
            record_type: RecordType::Event,
            value_type: ValueType::Group,
            intent: GroupIntent::Created.into(),
            metadata: RecordMetadata::default(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn open(storage: Arc<InMemoryLogStorage>) -> LogStream {
        LogStream::open(
            1,
            storage,
            &LogStreamConfig::default(),
            Arc::new(ControlledClock::new(0)),
        )
    }

    #[derive(Default)]
    struct CountingAwaiter(AtomicUsize);

    impl LogRecordAwaiter for CountingAwaiter {
        fn on_record_available(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_positions_start_at_one_and_increase() {
        let stream = open(Arc::new(InMemoryLogStorage::new()));
        let writer = stream.new_log_stream_writer();

        let first = writer
            .try_write(WriteContext::UserCommand, &[entry(1), entry(2)], NO_POSITION)
            .unwrap();
        let second = writer
            .try_write(WriteContext::UserCommand, &[entry(3)], NO_POSITION)
            .unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 3);
    }

    #[test]
    fn test_reopen_continues_after_last_committed() {
        let storage = Arc::new(InMemoryLogStorage::new());
        {
            let stream = open(storage.clone());
            stream
                .new_log_stream_writer()
                .try_write(WriteContext::Internal, &[entry(1), entry(2)], NO_POSITION)
                .unwrap();
            stream.close();
        }

        let stream = open(storage);
        let position = stream
            .new_log_stream_writer()
            .try_write(WriteContext::Internal, &[entry(3)], NO_POSITION)
            .unwrap();
        assert_eq!(position, 3);
    }

    #[test]
    fn test_empty_and_oversized_batches_are_invalid() {
        let storage = Arc::new(InMemoryLogStorage::new());
        let stream = LogStream::open(
            1,
            storage,
            &LogStreamConfig {
                max_fragment_size: 64,
                ..Default::default()
            },
            Arc::new(ControlledClock::new(0)),
        );
        let writer = stream.new_log_stream_writer();

        assert!(matches!(
            writer.try_write(WriteContext::UserCommand, &[], NO_POSITION),
            Err(WriteFailure::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.try_write(
                WriteContext::UserCommand,
                &[entry(1), entry(2)],
                NO_POSITION
            ),
            Err(WriteFailure::InvalidArgument(_))
        ));
        assert!(writer.can_write_events(1, 2));
        assert!(!writer.can_write_events(2, 2));
    }

    #[test]
    fn test_batch_over_rate_limit_is_invalid() {
        let stream = LogStream::open(
            1,
            Arc::new(InMemoryLogStorage::new()),
            &LogStreamConfig {
                flow_control: FlowControlConfig {
                    write_rate: RateLimitConfig {
                        enabled: true,
                        limit: 2,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
            Arc::new(ControlledClock::new(0)),
        );
        let writer = stream.new_log_stream_writer();
        let batch = [entry(1), entry(2), entry(3)];

        let failure = writer
            .try_write(WriteContext::InterPartition, &batch, NO_POSITION)
            .unwrap_err();
        assert!(matches!(failure, WriteFailure::InvalidArgument(_)));
        assert!(!failure.is_retryable());

        // Processing results are not rate limited.
        assert!(writer
            .try_write(WriteContext::ProcessingResult, &batch, NO_POSITION)
            .is_ok());
    }

    #[test]
    fn test_readers_are_independent() {
        let stream = open(Arc::new(InMemoryLogStorage::new()));
        stream
            .new_log_stream_writer()
            .try_write(WriteContext::Internal, &[entry(1), entry(2)], NO_POSITION)
            .unwrap();

        let mut a = stream.new_log_stream_reader().unwrap();
        let mut b = stream.new_log_stream_reader().unwrap();
        assert_eq!(a.next().unwrap().unwrap().position, 1);
        assert_eq!(a.next().unwrap().unwrap().position, 2);
        assert_eq!(b.next().unwrap().unwrap().position, 1);
        assert_eq!(a.last_read_position(), 2);
        assert_eq!(b.last_read_position(), 1);
    }

    #[test]
    fn test_seek_positions_reader() {
        let stream = open(Arc::new(InMemoryLogStorage::new()));
        let writer = stream.new_log_stream_writer();
        writer
            .try_write(WriteContext::Internal, &[entry(1), entry(2), entry(3)], NO_POSITION)
            .unwrap();
        writer
            .try_write(WriteContext::Internal, &[entry(4)], NO_POSITION)
            .unwrap();

        let mut reader = stream.new_log_stream_reader().unwrap();
        assert!(reader.seek(2));
        assert_eq!(reader.next().unwrap().unwrap().position, 2);
        assert!(!reader.seek(10));
        assert!(reader.next().is_none());

        reader.seek_to_first_event();
        assert_eq!(reader.next().unwrap().unwrap().position, 1);
        assert_eq!(reader.seek_to_end(), 4);
        assert!(!reader.has_next());
    }

    #[test]
    fn test_awaiters_woken_on_commit() {
        let stream = open(Arc::new(InMemoryLogStorage::new()));
        let awaiter = Arc::new(CountingAwaiter::default());
        stream.register_record_available_listener(awaiter.clone());

        stream
            .new_log_stream_writer()
            .try_write(WriteContext::Internal, &[entry(1)], NO_POSITION)
            .unwrap();
        assert_eq!(awaiter.0.load(Ordering::SeqCst), 1);

        let as_dyn: Arc<dyn LogRecordAwaiter> = awaiter.clone();
        stream.remove_record_available_listener(&as_dyn);
        stream
            .new_log_stream_writer()
            .try_write(WriteContext::Internal, &[entry(2)], NO_POSITION)
            .unwrap();
        assert_eq!(awaiter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_closes_readers() {
        let stream = open(Arc::new(InMemoryLogStorage::new()));
        let writer = stream.new_log_stream_writer();
        writer
            .try_write(WriteContext::Internal, &[entry(1)], NO_POSITION)
            .unwrap();
        let mut reader = stream.new_log_stream_reader().unwrap();

        stream.close();
        stream.close();

        assert!(reader.next().is_none());
        assert!(matches!(
            stream.new_log_stream_reader(),
            Err(LogStreamError::Closed)
        ));
        assert_eq!(
            writer.try_write(WriteContext::Internal, &[entry(2)], NO_POSITION),
            Err(WriteFailure::Closed)
        );
    }

    #[tokio::test]
    async fn test_record_available_signal_keeps_permit() {
        let stream = open(Arc::new(InMemoryLogStorage::new()));
        let signal = Arc::new(RecordAvailableSignal::new());
        stream.register_record_available_listener(signal.clone());

        stream
            .new_log_stream_writer()
            .try_write(WriteContext::Internal, &[entry(1)], NO_POSITION)
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), signal.notified())
            .await
            .expect("signal should already hold a permit");
    }
}
