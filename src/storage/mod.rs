//! Log storage contract.
//!
//! `LogStorage` is durable, append-ordered byte storage for one partition.
//! Replication and the on-disk format belong to the storage implementation;
//! the log stream only relies on this contract:
//!
//! - `append` takes an encoded batch plus the positions it spans and reports
//!   progress through an `AppendListener` (written, then committed)
//! - readers only ever observe committed batches
//! - commit listeners are told whenever new data becomes committed
//!
//! `InMemoryLogStorage` is the reference implementation used by the local
//! cluster and the tests.

use std::sync::Arc;

use bytes::Bytes;

pub mod memory;

pub use memory::InMemoryLogStorage;

/// Errors reported by a storage implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Storage is closed")]
    Closed,

    #[error("Append out of order: expected lowest position {expected}, got {actual}")]
    OutOfOrder { expected: i64, actual: i64 },

    #[error("Storage failure: {0}")]
    Io(String),
}

/// Progress callbacks for a single append.
///
/// `index` is the storage-local index of the appended batch.
pub trait AppendListener: Send + Sync {
    /// The batch was written (not necessarily committed).
    fn on_write(&self, _index: u64, _highest_position: i64) {}

    /// The batch could not be written.
    fn on_write_error(&self, _error: &StorageError) {}

    /// The batch is committed and visible to readers.
    fn on_commit(&self, _index: u64, _highest_position: i64) {}

    /// The batch was written but will never commit.
    fn on_commit_error(&self, _index: u64, _error: &StorageError) {}
}

/// Notified whenever new data is committed.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self);
}

/// Cursor over committed batches.
pub trait LogStorageReader: Send {
    /// Position the reader on the first committed batch whose highest
    /// position is `>= position`.
    fn seek(&mut self, position: i64);

    /// Next committed batch, if any.
    fn next_batch(&mut self) -> Option<Bytes>;
}

/// Durable, append-ordered storage for one partition's log.
pub trait LogStorage: Send + Sync {
    /// Append a batch spanning `[lowest_position, highest_position]`.
    ///
    /// Never blocks on commit; completion is reported through `listener`.
    fn append(
        &self,
        lowest_position: i64,
        highest_position: i64,
        data: Bytes,
        listener: Arc<dyn AppendListener>,
    );

    /// Open an independent reader positioned at the start of the log.
    fn new_reader(&self) -> Box<dyn LogStorageReader>;

    fn add_commit_listener(&self, listener: Arc<dyn CommitListener>);

    fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>);
}

/// Identity comparison for trait-object listeners.
pub(crate) fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
