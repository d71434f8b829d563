//! Chunking of a snapshot directory.
//!
//! Files are emitted in sorted name order. A file larger than the chunk
//! size is emitted as several consecutive chunks; a chunk never spans two
//! files. The reader only advances after a successful read, so a failed
//! `next` can simply be retried.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, trace};

use super::checksum::list_files;
use super::{decode_chunk_id, encode_chunk_id, Result, SnapshotChunk, SnapshotError};

/// Reads a snapshot directory as a sequence of chunks.
#[derive(Debug)]
pub struct FileBasedSnapshotChunkReader {
    directory: PathBuf,
    snapshot_id: String,
    snapshot_checksum: u64,
    total_count: usize,
    chunk_size: u64,
    files: Vec<String>,
    /// Index of the first pending file in `files`.
    view_start: usize,
    /// Bytes of the first pending file already emitted.
    offset: u64,
}

impl FileBasedSnapshotChunkReader {
    /// Reader emitting each file as a single chunk.
    pub fn new(directory: impl Into<PathBuf>, checksum: u64) -> Result<Self> {
        Self::with_chunk_size(directory, checksum, u32::MAX as u64)
    }

    pub fn with_chunk_size(
        directory: impl Into<PathBuf>,
        checksum: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        validate_chunk_size(chunk_size)?;
        let directory = directory.into();
        let files = list_files(&directory)?;
        let snapshot_id = directory
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!(
            snapshot_id = %snapshot_id,
            files = files.len(),
            chunk_size,
            "Opened snapshot chunk reader"
        );
        Ok(Self {
            directory,
            snapshot_id,
            snapshot_checksum: checksum,
            total_count: files.len(),
            chunk_size,
            files,
            view_start: 0,
            offset: 0,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Number of files in the snapshot. Constant for the reader's lifetime.
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn snapshot_checksum(&self) -> u64 {
        self.snapshot_checksum
    }

    pub fn has_next(&self) -> bool {
        self.view_start < self.files.len()
    }

    /// Id of the file the next chunk comes from.
    pub fn next_id(&self) -> Option<Bytes> {
        self.files
            .get(self.view_start)
            .and_then(|name| encode_chunk_id(name).ok())
    }

    /// Resume from the start of the file named by `id`, or the first file
    /// sorting after it.
    pub fn seek(&mut self, id: &[u8]) -> Result<()> {
        let name = decode_chunk_id(id)?;
        self.view_start = self.files.partition_point(|file| file.as_str() < name.as_str());
        self.offset = 0;
        trace!(chunk = %name, view_start = self.view_start, "Seeked snapshot reader");
        Ok(())
    }

    /// Start over from the first file.
    pub fn reset(&mut self) {
        self.view_start = 0;
        self.offset = 0;
    }

    /// Change the chunk size for subsequent reads.
    pub fn set_chunk_size(&mut self, chunk_size: u64) -> Result<()> {
        validate_chunk_size(chunk_size)?;
        self.chunk_size = chunk_size;
        Ok(())
    }

    /// Release the file list. The reader yields nothing afterwards.
    pub fn close(&mut self) {
        self.files.clear();
        self.view_start = 0;
        self.offset = 0;
    }

    /// Read the next chunk, or `None` when every file has been emitted.
    pub fn next_chunk(&mut self) -> Result<Option<SnapshotChunk>> {
        let Some(name) = self.files.get(self.view_start) else {
            return Ok(None);
        };
        let path = self.directory.join(name);

        let mut file = File::open(&path).map_err(|e| SnapshotError::io(&path, e))?;
        let file_size = file
            .metadata()
            .map_err(|e| SnapshotError::io(&path, e))?
            .len();
        let to_read = self.chunk_size.min(file_size.saturating_sub(self.offset));
        let mut content = vec![0u8; to_read as usize];
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| SnapshotError::io(&path, e))?;
        file.read_exact(&mut content)
            .map_err(|e| SnapshotError::io(&path, e))?;

        let block_position = self.offset;
        let emitted = block_position + to_read;
        let chunk = SnapshotChunk {
            snapshot_id: self.snapshot_id.clone(),
            total_count: self.total_count,
            snapshot_checksum: self.snapshot_checksum,
            chunk_name: name.clone(),
            file_part: emitted.div_ceil(self.chunk_size),
            file_block_position: block_position,
            total_file_size: file_size,
            content: Bytes::from(content),
        };

        if emitted >= file_size {
            self.offset = 0;
            self.view_start += 1;
        } else {
            self.offset = emitted;
        }
        Ok(Some(chunk))
    }
}

impl Iterator for FileBasedSnapshotChunkReader {
    type Item = Result<SnapshotChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

fn validate_chunk_size(chunk_size: u64) -> Result<()> {
    if chunk_size == 0 {
        return Err(SnapshotError::InvalidArgument(
            "chunk size must be positive".to_string(),
        ));
    }
    Ok(())
}
