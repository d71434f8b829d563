//! Log stream readers.
//!
//! Each reader owns its own storage cursor; readers never affect each other
//! or the writer. Only committed entries are visible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::record::codec::decode_batch;
use crate::record::{LogEntry, NO_POSITION};
use crate::storage::LogStorageReader;

use super::LogStreamError;

/// Independent cursor over committed log entries.
pub struct LogStreamReader {
    storage_reader: Box<dyn LogStorageReader>,
    buffered: VecDeque<LogEntry>,
    closed: Arc<AtomicBool>,
    last_read_position: i64,
}

impl LogStreamReader {
    pub(crate) fn new(storage_reader: Box<dyn LogStorageReader>, closed: Arc<AtomicBool>) -> Self {
        Self {
            storage_reader,
            buffered: VecDeque::new(),
            closed,
            last_read_position: NO_POSITION,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether another committed entry is available.
    pub fn has_next(&mut self) -> bool {
        !self.is_closed() && matches!(self.fill(), Ok(true))
    }

    /// Position the reader so the next entry returned is the first one with
    /// `position >= target`. Returns whether an entry with exactly `target`
    /// exists.
    pub fn seek(&mut self, target: i64) -> bool {
        self.buffered.clear();
        self.storage_reader.seek(target);
        loop {
            match self.fill() {
                Ok(true) => {}
                _ => return false,
            }
            while let Some(entry) = self.buffered.front() {
                if entry.position >= target {
                    return entry.position == target;
                }
                self.buffered.pop_front();
            }
        }
    }

    /// Rewind to the start of the log.
    pub fn seek_to_first_event(&mut self) {
        self.buffered.clear();
        self.storage_reader.seek(i64::MIN);
        self.last_read_position = NO_POSITION;
    }

    /// Skip everything currently committed. Returns the last position, or
    /// `NO_POSITION` when the log is empty.
    pub fn seek_to_end(&mut self) -> i64 {
        let mut last = self
            .buffered
            .back()
            .map(|entry| entry.position)
            .unwrap_or(self.last_read_position);
        self.buffered.clear();

        while let Some(batch) = self.storage_reader.next_batch() {
            match decode_batch(&batch) {
                Ok(entries) => {
                    if let Some(entry) = entries.last() {
                        last = entry.position;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping undecodable batch while seeking to end"),
            }
        }

        self.last_read_position = last;
        last
    }

    /// Position of the last entry returned by `next`.
    pub fn last_read_position(&self) -> i64 {
        self.last_read_position
    }

    fn fill(&mut self) -> Result<bool, LogStreamError> {
        while self.buffered.is_empty() {
            let Some(batch) = self.storage_reader.next_batch() else {
                return Ok(false);
            };
            let entries =
                decode_batch(&batch).map_err(|e| LogStreamError::Corrupted(e.to_string()))?;
            self.buffered.extend(entries);
        }
        Ok(true)
    }
}

impl Iterator for LogStreamReader {
    type Item = Result<LogEntry, LogStreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_closed() {
            return None;
        }
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => return Some(Err(e)),
        }
        let entry = self.buffered.pop_front()?;
        self.last_read_position = entry.position;
        Some(Ok(entry))
    }
}
