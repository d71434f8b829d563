//! Snapshot checksum.
//!
//! SHA-256 over every regular file in name order, each contributing its
//! name, a zero byte, its length (u64 little-endian) and its bytes. The
//! first eight bytes of the digest, big-endian, are the checksum.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::{validate_chunk_name, Result, SnapshotError};

/// Checksum of the snapshot directory at `directory`.
pub fn compute_checksum(directory: &Path) -> Result<u64> {
    let mut hasher = Sha256::new();
    for name in list_files(directory)? {
        let path = directory.join(&name);
        let content = fs::read(&path).map_err(|e| SnapshotError::io(&path, e))?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }

    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Ok(u64::from_be_bytes(head))
}

/// Sorted names of the regular files directly inside `directory`.
pub(crate) fn list_files(directory: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(directory).map_err(|e| SnapshotError::io(directory, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SnapshotError::io(directory, e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| SnapshotError::io(entry.path(), e))?;
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name().into_string().map_err(|raw| {
            SnapshotError::InvalidChunkId(format!("{:?} is not a valid file name", raw))
        })?;
        validate_chunk_name(&name)?;
        names.push(name);
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_depends_on_names_and_content() {
        let a = tempfile::tempdir().unwrap();
        fs::write(a.path().join("x"), b"hello").unwrap();
        fs::write(a.path().join("y"), b"world").unwrap();

        let b = tempfile::tempdir().unwrap();
        fs::write(b.path().join("y"), b"world").unwrap();
        fs::write(b.path().join("x"), b"hello").unwrap();

        let c = tempfile::tempdir().unwrap();
        fs::write(c.path().join("x"), b"hellow").unwrap();
        fs::write(c.path().join("y"), b"orld").unwrap();

        let checksum = compute_checksum(a.path()).unwrap();
        assert_eq!(checksum, compute_checksum(b.path()).unwrap());
        assert_ne!(checksum, compute_checksum(c.path()).unwrap());
    }

    #[test]
    fn test_list_files_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b"), b"").unwrap();
        fs::write(dir.path().join("a"), b"").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(list_files(dir.path()).unwrap(), vec!["a", "b"]);
    }
}
