//! Snapshot transfer.
//!
//! A snapshot is an immutable directory of regular files. The sender walks
//! it with a `FileBasedSnapshotChunkReader`, emitting bounded chunks in a
//! deterministic order; the receiver feeds them to a `ReceivedSnapshot`,
//! which rebuilds the directory and verifies the snapshot checksum.
//!
//! Chunk ids are the ASCII bytes of a file name relative to the snapshot
//! directory. A receiver that lost its place can ask the sender to `seek`
//! to an id and resume from the start of that file.

pub mod checksum;
pub mod chunk_reader;
pub mod received;

use std::path::PathBuf;

use bytes::Bytes;

pub use checksum::compute_checksum;
pub use chunk_reader::FileBasedSnapshotChunkReader;
pub use received::ReceivedSnapshot;

/// Default chunk size when none is configured (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Errors from snapshot chunking or reassembly.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid chunk id: {0}")]
    InvalidChunkId(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Chunk {chunk_name} has {field} {actual}, snapshot expects {expected}")]
    InconsistentChunk {
        chunk_name: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Chunk {chunk_name} starts at byte {actual}, expected byte {expected}")]
    OutOfOrder {
        chunk_name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Snapshot checksum mismatch: expected {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    #[error("Snapshot incomplete: {received} of {expected} files received")]
    Incomplete { expected: usize, received: usize },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// One bounded piece of one snapshot file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    /// Name of the snapshot directory.
    pub snapshot_id: String,
    /// Number of files in the snapshot.
    pub total_count: usize,
    pub snapshot_checksum: u64,
    /// File name relative to the snapshot directory.
    pub chunk_name: String,
    /// `ceil(bytes of the file emitted so far / chunk_size)`.
    pub file_part: u64,
    /// Byte offset of `content` within the file.
    pub file_block_position: u64,
    pub total_file_size: u64,
    pub content: Bytes,
}

/// Encode a relative file name as a chunk id.
pub fn encode_chunk_id(name: &str) -> Result<Bytes> {
    validate_chunk_name(name)?;
    Ok(Bytes::copy_from_slice(name.as_bytes()))
}

/// Decode a chunk id back into a relative file name.
pub fn decode_chunk_id(id: &[u8]) -> Result<String> {
    if !id.is_ascii() {
        return Err(SnapshotError::InvalidChunkId(
            "chunk id must be ASCII".to_string(),
        ));
    }
    let name = String::from_utf8_lossy(id).into_owned();
    validate_chunk_name(&name)?;
    Ok(name)
}

/// A chunk name must be a plain file name inside the snapshot directory.
pub(crate) fn validate_chunk_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SnapshotError::InvalidChunkId(
            "chunk id must not be empty".to_string(),
        ));
    }
    if !name.is_ascii() {
        return Err(SnapshotError::InvalidChunkId(format!(
            "{:?} is not ASCII",
            name
        )));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(SnapshotError::InvalidChunkId(format!(
            "{:?} is not a plain file name",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_roundtrip() {
        let id = encode_chunk_id("000001.sst").unwrap();
        assert_eq!(&id[..], b"000001.sst");
        assert_eq!(decode_chunk_id(&id).unwrap(), "000001.sst");
    }

    #[test]
    fn test_invalid_chunk_ids() {
        assert!(matches!(
            decode_chunk_id(b""),
            Err(SnapshotError::InvalidChunkId(_))
        ));
        assert!(matches!(
            decode_chunk_id(&[0xC3, 0xA9]),
            Err(SnapshotError::InvalidChunkId(_))
        ));
        assert!(matches!(
            encode_chunk_id("caf\u{e9}"),
            Err(SnapshotError::InvalidChunkId(_))
        ));
        assert!(matches!(
            decode_chunk_id(b"db/000001.sst"),
            Err(SnapshotError::InvalidChunkId(_))
        ));
        assert!(decode_chunk_id(b"..").is_err());
        assert!(decode_chunk_id(b".").is_err());
    }

    #[test]
    fn test_hidden_file_names_are_valid() {
        assert_eq!(decode_chunk_id(b".checksum").unwrap(), ".checksum");
        assert!(encode_chunk_id("..meta").is_ok());
    }
}
