//! The single writer of a partition's log.
//!
//! Position assignment and admission happen under one mutex, which also
//! queues the encoded batch. Whoever holds the append guard hands queued
//! batches to storage in order, outside that mutex. Storage therefore sees
//! batches in position order, and a commit callback that writes again only
//! queues its batch instead of blocking on the writer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, TryLockError};

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::record::codec::{self, ENTRY_HEADER_LENGTH};
use crate::record::{LogAppendEntry, PartitionId};
use crate::storage::{AppendListener, LogStorage};

use super::flow_control::{FlowControl, Rejection, WriteContext};
use super::metrics::LogStreamMetrics;

/// Why a write was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteFailure {
    #[error("Log stream writer is closed")]
    Closed,

    #[error("Write rejected: {0}")]
    Rejected(Rejection),

    #[error("Invalid write: {0}")]
    InvalidArgument(String),
}

impl WriteFailure {
    /// Rejections are transient; callers may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteFailure::Rejected(_))
    }
}

struct QueuedBatch {
    lowest: i64,
    highest: i64,
    data: Bytes,
    listener: Arc<dyn AppendListener>,
}

struct SequencerState {
    next_position: i64,
    closed: bool,
    queued: VecDeque<QueuedBatch>,
}

/// Assigns positions and forwards batches to storage.
pub struct Sequencer {
    partition_id: PartitionId,
    max_fragment_size: usize,
    storage: Arc<dyn LogStorage>,
    flow_control: Arc<FlowControl>,
    metrics: Arc<LogStreamMetrics>,
    state: Mutex<SequencerState>,
    /// Held while handing queued batches to storage.
    appending: Mutex<()>,
}

impl Sequencer {
    pub(crate) fn new(
        partition_id: PartitionId,
        initial_position: i64,
        max_fragment_size: usize,
        storage: Arc<dyn LogStorage>,
        flow_control: Arc<FlowControl>,
        metrics: Arc<LogStreamMetrics>,
    ) -> Self {
        info!(partition_id, initial_position, "Sequencer started");
        Self {
            partition_id,
            max_fragment_size,
            storage,
            flow_control,
            metrics,
            state: Mutex::new(SequencerState {
                next_position: initial_position,
                closed: false,
                queued: VecDeque::new(),
            }),
            appending: Mutex::new(()),
        }
    }

    /// Write a batch. Returns the position of the last entry.
    ///
    /// `source_position` is the position of the command these entries
    /// result from, or `NO_POSITION`.
    pub fn try_write(
        &self,
        context: WriteContext,
        entries: &[LogAppendEntry],
        source_position: i64,
    ) -> Result<i64, WriteFailure> {
        if entries.is_empty() {
            return Err(WriteFailure::InvalidArgument(
                "batch must contain at least one entry".to_string(),
            ));
        }
        let batch_size: usize = entries.iter().map(LogAppendEntry::approximate_length).sum();
        if batch_size > self.max_fragment_size {
            return Err(WriteFailure::InvalidArgument(format!(
                "batch of {} bytes exceeds max fragment size {}",
                batch_size, self.max_fragment_size
            )));
        }

        if let Some(max) = self.flow_control.max_batch_entries(context) {
            if entries.len() > max {
                return Err(WriteFailure::InvalidArgument(format!(
                    "batch of {} entries exceeds write rate limit {}",
                    entries.len(),
                    max
                )));
            }
        }

        let mut state = self.state.lock().map_err(|_| WriteFailure::Closed)?;
        if state.closed {
            return Err(WriteFailure::Closed);
        }

        let in_flight = self
            .flow_control
            .try_acquire(context, entries.len())
            .map_err(WriteFailure::Rejected)?;

        let lowest = state.next_position;
        let highest = lowest + entries.len() as i64 - 1;
        let data = match codec::encode_batch(lowest, source_position, entries) {
            Ok(data) => data,
            Err(e) => {
                in_flight.abandon();
                return Err(WriteFailure::InvalidArgument(e.to_string()));
            }
        };
        state.next_position = highest + 1;
        state.queued.push_back(QueuedBatch {
            lowest,
            highest,
            data,
            listener: in_flight,
        });
        drop(state);
        self.drain_queued();

        self.metrics.record_append(entries.len());
        trace!(
            partition_id = self.partition_id,
            ?context,
            lowest,
            highest,
            "Wrote batch"
        );
        Ok(highest)
    }

    /// Hand queued batches to storage until none are left. Returns at once
    /// if another caller, or an outer frame of this thread, is already
    /// draining; that caller picks up what was queued.
    fn drain_queued(&self) {
        loop {
            let guard = match self.appending.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            while let Some(batch) = self.pop_queued() {
                self.storage
                    .append(batch.lowest, batch.highest, batch.data, batch.listener);
            }
            drop(guard);

            // A batch queued after our last pop but before the guard was
            // released found it taken.
            let idle = self
                .state
                .lock()
                .map(|state| state.queued.is_empty())
                .unwrap_or(true);
            if idle {
                return;
            }
        }
    }

    fn pop_queued(&self) -> Option<QueuedBatch> {
        self.state.lock().ok()?.queued.pop_front()
    }

    /// Whether a batch of `count` entries with `batch_size` payload bytes
    /// fits in one fragment.
    pub fn can_write_events(&self, count: usize, batch_size: usize) -> bool {
        count > 0 && batch_size + count * ENTRY_HEADER_LENGTH <= self.max_fragment_size
    }

    /// Position the next accepted entry will get.
    pub fn next_position(&self) -> i64 {
        self.state
            .lock()
            .map(|state| state.next_position)
            .unwrap_or(crate::record::NO_POSITION)
    }

    pub fn flow_control(&self) -> &FlowControl {
        &self.flow_control
    }

    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            if !state.closed {
                state.closed = true;
                debug!(partition_id = self.partition_id, "Sequencer closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|state| state.closed).unwrap_or(true)
    }
}
