//! Working-directory layout and persisted assembly state for layerpack.
//!
//! `WorkLayout` names every directory an assembly touches, `CacheStore`
//! persists the resumable `AssemblyCache` (stage flags, verified blobs and
//! active mounts) atomically, and `unpack_archive` extracts runtime archives.

pub mod archive;
pub mod cache;
pub mod layout;

pub use archive::unpack_archive;
pub use cache::{AssemblyCache, CacheStore, Stage, StageFlags, CACHE_FORMAT_VERSION};
pub use layout::WorkLayout;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `value` as pretty JSON via temp file, rename and directory fsync.
pub fn write_json_atomic(path: &Path, value: &impl Serialize) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value)?;
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Read a JSON file written by [`write_json_atomic`]; `None` when absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workdir I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cache format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("archive error in {path}: {message}")]
    Archive { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_helpers_roundtrip_and_tolerate_absence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/value.json");
        assert_eq!(read_json::<Vec<String>>(&path).unwrap(), None);
        write_json_atomic(&path, &vec!["a".to_owned()]).unwrap();
        assert_eq!(
            read_json::<Vec<String>>(&path).unwrap(),
            Some(vec!["a".to_owned()])
        );
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn version_mismatch_display() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        assert_eq!(
            e.to_string(),
            "cache format version mismatch: expected 1, found 7"
        );
    }
}
