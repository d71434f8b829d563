//! Receiver side of snapshot transfer.
//!
//! Chunks are applied in emission order into a pending directory. Every
//! chunk must agree with the first one on snapshot id, file count and
//! checksum, and must continue its file exactly where the previous chunk
//! ended. Chunks already written (redelivered after a `seek`) are ignored.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::checksum::compute_checksum;
use super::{validate_chunk_name, Result, SnapshotChunk, SnapshotError};

#[derive(Debug, Clone, PartialEq, Eq)]
struct SnapshotIdentity {
    snapshot_id: String,
    total_count: usize,
    checksum: u64,
}

/// A snapshot being reassembled from chunks.
#[derive(Debug)]
pub struct ReceivedSnapshot {
    pending_directory: PathBuf,
    identity: Option<SnapshotIdentity>,
    /// File currently being written and the next byte it expects.
    in_progress: Option<(String, u64)>,
    completed: BTreeSet<String>,
}

impl ReceivedSnapshot {
    /// Start receiving into `pending_directory`, creating it if needed.
    pub fn new(pending_directory: impl Into<PathBuf>) -> Result<Self> {
        let pending_directory = pending_directory.into();
        fs::create_dir_all(&pending_directory)
            .map_err(|e| SnapshotError::io(&pending_directory, e))?;
        Ok(Self {
            pending_directory,
            identity: None,
            in_progress: None,
            completed: BTreeSet::new(),
        })
    }

    pub fn pending_directory(&self) -> &Path {
        &self.pending_directory
    }

    /// Files fully received so far.
    pub fn completed_files(&self) -> usize {
        self.completed.len()
    }

    /// Apply a chunk. Returns `false` when the chunk was already applied.
    pub fn apply(&mut self, chunk: &SnapshotChunk) -> Result<bool> {
        self.check_identity(chunk)?;
        validate_chunk_name(&chunk.chunk_name)?;

        if self.completed.contains(&chunk.chunk_name) {
            debug!(chunk = %chunk.chunk_name, "Ignoring chunk of completed file");
            return Ok(false);
        }

        let expected = match &self.in_progress {
            Some((name, next)) if *name == chunk.chunk_name => *next,
            Some((name, next)) => {
                return Err(SnapshotError::OutOfOrder {
                    chunk_name: name.clone(),
                    expected: *next,
                    actual: 0,
                });
            }
            None => 0,
        };
        if chunk.file_block_position < expected {
            debug!(
                chunk = %chunk.chunk_name,
                position = chunk.file_block_position,
                "Ignoring redelivered chunk"
            );
            return Ok(false);
        }
        if chunk.file_block_position > expected {
            return Err(SnapshotError::OutOfOrder {
                chunk_name: chunk.chunk_name.clone(),
                expected,
                actual: chunk.file_block_position,
            });
        }

        let path = self.pending_directory.join(&chunk.chunk_name);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(expected > 0)
            .truncate(expected == 0)
            .open(&path)
            .map_err(|e| SnapshotError::io(&path, e))?;
        file.write_all(&chunk.content)
            .map_err(|e| SnapshotError::io(&path, e))?;

        let next = expected + chunk.content.len() as u64;
        if next >= chunk.total_file_size {
            self.in_progress = None;
            self.completed.insert(chunk.chunk_name.clone());
        } else {
            self.in_progress = Some((chunk.chunk_name.clone(), next));
        }
        Ok(true)
    }

    /// Verify completeness and checksum, then move the snapshot to `target`.
    pub fn persist(self, target: &Path) -> Result<PathBuf> {
        let Some(identity) = &self.identity else {
            return Err(SnapshotError::InvalidArgument(
                "no chunks received".to_string(),
            ));
        };
        if self.in_progress.is_some() || self.completed.len() != identity.total_count {
            return Err(SnapshotError::Incomplete {
                expected: identity.total_count,
                received: self.completed.len(),
            });
        }

        let actual = compute_checksum(&self.pending_directory)?;
        if actual != identity.checksum {
            warn!(
                snapshot_id = %identity.snapshot_id,
                expected = identity.checksum,
                actual,
                "Received snapshot failed checksum verification"
            );
            return Err(SnapshotError::ChecksumMismatch {
                expected: identity.checksum,
                actual,
            });
        }

        fs::rename(&self.pending_directory, target).map_err(|e| SnapshotError::io(target, e))?;
        info!(
            snapshot_id = %identity.snapshot_id,
            files = identity.total_count,
            target = %target.display(),
            "Persisted received snapshot"
        );
        Ok(target.to_path_buf())
    }

    /// Discard everything received.
    pub fn abort(self) -> Result<()> {
        fs::remove_dir_all(&self.pending_directory)
            .map_err(|e| SnapshotError::io(&self.pending_directory, e))
    }

    fn check_identity(&mut self, chunk: &SnapshotChunk) -> Result<()> {
        let Some(identity) = &self.identity else {
            self.identity = Some(SnapshotIdentity {
                snapshot_id: chunk.snapshot_id.clone(),
                total_count: chunk.total_count,
                checksum: chunk.snapshot_checksum,
            });
            return Ok(());
        };

        let mismatch = |field: &'static str, expected: String, actual: String| {
            SnapshotError::InconsistentChunk {
                chunk_name: chunk.chunk_name.clone(),
                field,
                expected,
                actual,
            }
        };
        if identity.snapshot_id != chunk.snapshot_id {
            return Err(mismatch(
                "snapshot_id",
                identity.snapshot_id.clone(),
                chunk.snapshot_id.clone(),
            ));
        }
        if identity.total_count != chunk.total_count {
            return Err(mismatch(
                "total_count",
                identity.total_count.to_string(),
                chunk.total_count.to_string(),
            ));
        }
        if identity.checksum != chunk.snapshot_checksum {
            return Err(mismatch(
                "snapshot_checksum",
                identity.checksum.to_string(),
                chunk.snapshot_checksum.to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(name: &str, position: u64, content: &'static [u8], size: u64) -> SnapshotChunk {
        SnapshotChunk {
            snapshot_id: "1-1-1".to_string(),
            total_count: 1,
            snapshot_checksum: 9,
            chunk_name: name.to_string(),
            file_part: 1,
            file_block_position: position,
            total_file_size: size,
            content: Bytes::from_static(content),
        }
    }

    #[test]
    fn test_chunks_reassemble_file() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();

        assert!(received.apply(&chunk("a", 0, b"hel", 5)).unwrap());
        assert!(received.apply(&chunk("a", 3, b"lo", 5)).unwrap());

        assert_eq!(received.completed_files(), 1);
        assert_eq!(
            fs::read(root.path().join("pending").join("a")).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_redelivered_chunk_is_ignored() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();

        received.apply(&chunk("a", 0, b"hel", 5)).unwrap();
        assert!(!received.apply(&chunk("a", 0, b"hel", 5)).unwrap());
        assert!(received.apply(&chunk("a", 3, b"lo", 5)).unwrap());
        assert!(!received.apply(&chunk("a", 3, b"lo", 5)).unwrap());
    }

    #[test]
    fn test_gap_is_out_of_order() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();

        assert!(matches!(
            received.apply(&chunk("a", 3, b"lo", 5)),
            Err(SnapshotError::OutOfOrder { expected: 0, .. })
        ));
    }

    #[test]
    fn test_inconsistent_checksum_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();
        received.apply(&chunk("a", 0, b"hel", 5)).unwrap();

        let mut other = chunk("a", 3, b"lo", 5);
        other.snapshot_checksum = 10;
        assert!(matches!(
            received.apply(&other),
            Err(SnapshotError::InconsistentChunk {
                field: "snapshot_checksum",
                ..
            })
        ));
    }

    #[test]
    fn test_persist_requires_all_files() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();
        received.apply(&chunk("a", 0, b"hel", 5)).unwrap();

        assert!(matches!(
            received.persist(&root.path().join("final")),
            Err(SnapshotError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_persist_verifies_checksum() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();
        received.apply(&chunk("a", 0, b"hello", 5)).unwrap();

        assert!(matches!(
            received.persist(&root.path().join("final")),
            Err(SnapshotError::ChecksumMismatch { expected: 9, .. })
        ));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mut received = ReceivedSnapshot::new(root.path().join("pending")).unwrap();

        assert!(matches!(
            received.apply(&chunk("../escape", 0, b"x", 1)),
            Err(SnapshotError::InvalidChunkId(_))
        ));
        assert!(matches!(
            received.apply(&chunk("..", 0, b"x", 1)),
            Err(SnapshotError::InvalidChunkId(_))
        ));
    }
}
