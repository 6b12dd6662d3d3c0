use crate::FetchError;
use layerpack_schema::RemoteBlob;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const CHUNK: usize = 64 * 1024;

/// Hex SHA-256 of a file's content.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// True when `path` already holds content matching the blob's checksum.
/// A mismatching file is removed.
pub(crate) fn reuse_existing(path: &Path, blob: &RemoteBlob) -> Result<bool, FetchError> {
    if !path.is_file() {
        return Ok(false);
    }
    if blob.checksum.matches(&sha256_file(path)?) {
        debug!("reusing verified {}", path.display());
        return Ok(true);
    }
    debug!("removing stale {}", path.display());
    fs::remove_file(path)?;
    Ok(false)
}

/// Stream `reader` into `dest`, hashing on the way.
///
/// The data goes to a temporary file next to `dest` that is persisted only
/// when the digest matches; on mismatch it is deleted and
/// [`FetchError::IntegrityFailure`] is returned.
pub fn write_verified(
    mut reader: impl Read,
    dest: &Path,
    blob: &RemoteBlob,
) -> Result<PathBuf, FetchError> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tmp.write_all(&buf[..n])?;
    }
    let actual = hex::encode(hasher.finalize());
    if !blob.checksum.matches(&actual) {
        return Err(FetchError::IntegrityFailure {
            name: blob.name.clone(),
            expected: blob.checksum.to_string(),
            actual,
        });
    }
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| FetchError::Io(e.error))?;
    Ok(dest.to_path_buf())
}
