//! Atomic file I/O primitives for persisted orchestrator state.
//!
//! Every durable file the orchestrator owns (group root maps, rollback
//! snapshots, deployment stage records) is written through
//! [`atomic_write`]: write to a temp file in the same directory, fsync the
//! data, rename to the final path, then fsync the parent directory. A crash
//! at any point leaves either the old complete file or the new complete
//! file, never a partial write.
//!
//! Reads go through [`bounded_read_json`], which checks the file size
//! against a cap before allocating.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

/// Default upper bound for any single state file read.
///
/// State files are small JSON documents; 16 MiB leaves wide headroom while
/// still bounding allocation on a corrupted file.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Errors from atomic filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsSafeError {
    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// The final path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    SerializeFailed(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    DeserializeFailed(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl FsSafeError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Atomically write `bytes` to `path`.
///
/// The parent directory must exist. The scratch file is a randomly named
/// temp file in the same directory, so a crash before the rename leaves
/// nothing behind (the temp file is removed on drop).
///
/// # Errors
///
/// Returns [`FsSafeError`] if the path has no parent or any I/O step fails.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), FsSafeError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsSafeError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| FsSafeError::io(format!("creating temp file in {}", parent.display()), e))?;
    tmp.write_all(bytes)
        .map_err(|e| FsSafeError::io(format!("writing {}", tmp.path().display()), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsSafeError::io(format!("syncing {}", tmp.path().display()), e))?;

    tmp.persist(path)
        .map_err(|e| FsSafeError::io(format!("renaming to {}", path.display()), e.error))?;

    // fsync the parent so the rename itself is durable
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Atomically write `value` to `path` as pretty-printed JSON.
///
/// # Errors
///
/// Returns [`FsSafeError`] on serialization or I/O failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsSafeError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(FsSafeError::SerializeFailed)?;
    atomic_write(path, &bytes)
}

/// Read and deserialize a JSON file, capping the read at `max_size` bytes.
///
/// The size check runs on file metadata before any allocation.
///
/// # Errors
///
/// Returns [`FsSafeError`] if the file is oversized, unreadable, or not
/// valid JSON for `T`.
pub fn bounded_read_json<T: DeserializeOwned>(path: &Path, max_size: u64) -> Result<T, FsSafeError> {
    let metadata = fs::metadata(path)
        .map_err(|e| FsSafeError::io(format!("reading metadata of {}", path.display()), e))?;

    if metadata.len() > max_size {
        return Err(FsSafeError::FileTooLarge {
            size: metadata.len(),
            max: max_size,
        });
    }

    let bytes = fs::read(path)
        .map_err(|e| FsSafeError::io(format!("reading {}", path.display()), e))?;
    serde_json::from_slice(&bytes).map_err(FsSafeError::DeserializeFailed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_atomic_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut value = BTreeMap::new();
        value.insert("alpha".to_string(), 1u32);
        atomic_write_json(&path, &value).unwrap();

        let loaded: BTreeMap<String, u32> =
            bounded_read_json(&path, DEFAULT_MAX_FILE_SIZE).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != "state.json")
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_bounded_read_rejects_oversized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        fs::write(&path, vec![b' '; 64]).unwrap();

        let result: Result<serde_json::Value, _> = bounded_read_json(&path, 16);
        assert!(matches!(result, Err(FsSafeError::FileTooLarge { .. })));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let result = atomic_write(Path::new("/"), b"x");
        assert!(matches!(result, Err(FsSafeError::NoParentDirectory { .. })));
    }
}
