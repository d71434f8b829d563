//! In-memory `LogStorage` for tests and the local cluster.
//!
//! Commits immediately by default. With `set_auto_commit(false)` appended
//! batches stay written-but-uncommitted until `commit()` is called, which
//! lets tests hold requests in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{
    same_listener, AppendListener, CommitListener, LogStorage, LogStorageReader, StorageError,
};

struct Batch {
    highest_position: i64,
    data: Bytes,
}

#[derive(Default)]
struct Inner {
    batches: Vec<Batch>,
    /// Number of committed batches (a prefix of `batches`).
    committed: usize,
    uncommitted: Vec<(u64, i64, Arc<dyn AppendListener>)>,
}

/// Log storage held in process memory.
pub struct InMemoryLogStorage {
    inner: Arc<RwLock<Inner>>,
    commit_listeners: RwLock<Arc<Vec<Arc<dyn CommitListener>>>>,
    auto_commit: AtomicBool,
    fail_on_append: AtomicBool,
}

impl Default for InMemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLogStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            commit_listeners: RwLock::new(Arc::new(Vec::new())),
            auto_commit: AtomicBool::new(true),
            fail_on_append: AtomicBool::new(false),
        }
    }

    /// When disabled, appends wait for an explicit `commit()`.
    pub fn set_auto_commit(&self, enabled: bool) {
        self.auto_commit.store(enabled, Ordering::SeqCst);
    }

    /// Make subsequent appends fail with a write error.
    pub fn set_fail_on_append(&self, fail: bool) {
        self.fail_on_append.store(fail, Ordering::SeqCst);
    }

    /// Commit every written batch. Returns how many batches became committed.
    pub fn commit(&self) -> usize {
        let uncommitted = {
            let Ok(mut inner) = self.inner.write() else {
                return 0;
            };
            inner.committed = inner.batches.len();
            std::mem::take(&mut inner.uncommitted)
        };

        let count = uncommitted.len();
        for (index, highest, listener) in uncommitted {
            listener.on_commit(index, highest);
        }
        if count > 0 {
            self.notify_commit();
        }
        count
    }

    /// Drop every written-but-uncommitted batch, failing its listener.
    pub fn fail_uncommitted(&self) -> usize {
        let uncommitted = {
            let Ok(mut inner) = self.inner.write() else {
                return 0;
            };
            let committed = inner.committed;
            inner.batches.truncate(committed);
            std::mem::take(&mut inner.uncommitted)
        };

        let error = StorageError::Io("uncommitted batch discarded".to_string());
        let count = uncommitted.len();
        for (index, _, listener) in uncommitted {
            listener.on_commit_error(index, &error);
        }
        count
    }

    /// Number of committed batches.
    pub fn committed_batches(&self) -> usize {
        self.inner.read().map(|inner| inner.committed).unwrap_or(0)
    }

    fn notify_commit(&self) {
        let listeners = match self.commit_listeners.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => return,
        };
        for listener in listeners.iter() {
            listener.on_commit();
        }
    }
}

impl LogStorage for InMemoryLogStorage {
    fn append(
        &self,
        lowest_position: i64,
        highest_position: i64,
        data: Bytes,
        listener: Arc<dyn AppendListener>,
    ) {
        if self.fail_on_append.load(Ordering::SeqCst) {
            listener.on_write_error(&StorageError::Io("injected append failure".to_string()));
            return;
        }

        let auto_commit = self.auto_commit.load(Ordering::SeqCst);
        let index = {
            let Ok(mut inner) = self.inner.write() else {
                listener.on_write_error(&StorageError::Closed);
                return;
            };
            if let Some(last) = inner.batches.last() {
                if lowest_position <= last.highest_position {
                    let error = StorageError::OutOfOrder {
                        expected: last.highest_position + 1,
                        actual: lowest_position,
                    };
                    warn!(error = %error, "Rejected out-of-order append");
                    drop(inner);
                    listener.on_write_error(&error);
                    return;
                }
            }

            inner.batches.push(Batch {
                highest_position,
                data,
            });
            let index = (inner.batches.len() - 1) as u64;
            if auto_commit {
                inner.committed = inner.batches.len();
            } else {
                inner
                    .uncommitted
                    .push((index, highest_position, Arc::clone(&listener)));
            }
            index
        };

        debug!(index, lowest_position, highest_position, "Appended batch");
        listener.on_write(index, highest_position);
        if auto_commit {
            listener.on_commit(index, highest_position);
            self.notify_commit();
        }
    }

    fn new_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(InMemoryStorageReader {
            inner: Arc::clone(&self.inner),
            next_index: 0,
        })
    }

    fn add_commit_listener(&self, listener: Arc<dyn CommitListener>) {
        if let Ok(mut guard) = self.commit_listeners.write() {
            let mut next = Vec::with_capacity(guard.len() + 1);
            next.extend(guard.iter().cloned());
            next.push(listener);
            *guard = Arc::new(next);
        }
    }

    fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>) {
        if let Ok(mut guard) = self.commit_listeners.write() {
            let next: Vec<_> = guard
                .iter()
                .filter(|l| !same_listener(*l, listener))
                .cloned()
                .collect();
            *guard = Arc::new(next);
        }
    }
}

struct InMemoryStorageReader {
    inner: Arc<RwLock<Inner>>,
    next_index: usize,
}

impl LogStorageReader for InMemoryStorageReader {
    fn seek(&mut self, position: i64) {
        if let Ok(inner) = self.inner.read() {
            let committed = &inner.batches[..inner.committed];
            self.next_index = committed.partition_point(|b| b.highest_position < position);
        }
    }

    fn next_batch(&mut self) -> Option<Bytes> {
        let inner = self.inner.read().ok()?;
        if self.next_index >= inner.committed {
            return None;
        }
        let data = inner.batches[self.next_index].data.clone();
        self.next_index += 1;
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        writes: AtomicUsize,
        commits: AtomicUsize,
        errors: AtomicUsize,
    }

    impl AppendListener for CountingListener {
        fn on_write(&self, _index: u64, _highest: i64) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_write_error(&self, _error: &StorageError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_commit(&self, _index: u64, _highest: i64) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        fn on_commit_error(&self, _index: u64, _error: &StorageError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingCommits(AtomicUsize);

    impl CommitListener for CountingCommits {
        fn on_commit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_auto_commit_notifies_listeners() {
        let storage = InMemoryLogStorage::new();
        let commits = Arc::new(CountingCommits::default());
        storage.add_commit_listener(commits.clone());
        let append = Arc::new(CountingListener::default());

        storage.append(1, 2, Bytes::from_static(b"ab"), append.clone());

        assert_eq!(append.writes.load(Ordering::SeqCst), 1);
        assert_eq!(append.commits.load(Ordering::SeqCst), 1);
        assert_eq!(commits.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_readers_only_see_committed_batches() {
        let storage = InMemoryLogStorage::new();
        storage.set_auto_commit(false);
        let append = Arc::new(CountingListener::default());
        storage.append(1, 1, Bytes::from_static(b"a"), append.clone());

        let mut reader = storage.new_reader();
        assert!(reader.next_batch().is_none());
        assert_eq!(append.commits.load(Ordering::SeqCst), 0);

        assert_eq!(storage.commit(), 1);
        assert_eq!(reader.next_batch(), Some(Bytes::from_static(b"a")));
        assert_eq!(append.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_seek_finds_batch_containing_position() {
        let storage = InMemoryLogStorage::new();
        let append = Arc::new(CountingListener::default());
        storage.append(1, 3, Bytes::from_static(b"first"), append.clone());
        storage.append(4, 6, Bytes::from_static(b"second"), append.clone());

        let mut reader = storage.new_reader();
        reader.seek(5);
        assert_eq!(reader.next_batch(), Some(Bytes::from_static(b"second")));
        reader.seek(100);
        assert!(reader.next_batch().is_none());
    }

    #[test]
    fn test_out_of_order_append_is_a_write_error() {
        let storage = InMemoryLogStorage::new();
        let append = Arc::new(CountingListener::default());
        storage.append(1, 3, Bytes::from_static(b"x"), append.clone());
        storage.append(2, 2, Bytes::from_static(b"y"), append.clone());

        assert_eq!(append.errors.load(Ordering::SeqCst), 1);
        assert_eq!(storage.committed_batches(), 1);
    }

    #[test]
    fn test_removed_commit_listener_is_not_notified() {
        let storage = InMemoryLogStorage::new();
        let commits = Arc::new(CountingCommits::default());
        let as_dyn: Arc<dyn CommitListener> = commits.clone();
        storage.add_commit_listener(as_dyn.clone());
        storage.remove_commit_listener(&as_dyn);

        storage.append(
            1,
            1,
            Bytes::from_static(b"a"),
            Arc::new(CountingListener::default()),
        );
        assert_eq!(commits.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fail_uncommitted_reports_commit_errors() {
        let storage = InMemoryLogStorage::new();
        storage.set_auto_commit(false);
        let append = Arc::new(CountingListener::default());
        storage.append(1, 1, Bytes::from_static(b"a"), append.clone());

        assert_eq!(storage.fail_uncommitted(), 1);
        assert_eq!(append.errors.load(Ordering::SeqCst), 1);
        assert!(storage.new_reader().next_batch().is_none());
    }

    #[test]
    fn test_injected_append_failure_is_a_write_error() {
        let storage = InMemoryLogStorage::new();
        let append = Arc::new(CountingListener::default());
        storage.set_fail_on_append(true);
        storage.append(1, 1, Bytes::from_static(b"a"), append.clone());
        assert_eq!(append.errors.load(Ordering::SeqCst), 1);
        assert_eq!(append.writes.load(Ordering::SeqCst), 0);

        storage.set_fail_on_append(false);
        storage.append(1, 1, Bytes::from_static(b"a"), append.clone());
        assert_eq!(append.commits.load(Ordering::SeqCst), 1);
    }
}
