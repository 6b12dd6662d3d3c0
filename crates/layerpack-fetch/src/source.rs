use crate::digest::{reuse_existing, write_verified};
use crate::http::HttpFetcher;
use crate::{FetchError, Fetcher};
use layerpack_schema::{BlobSource, RemoteBlob};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Copies `BlobSource::Local` blobs from the host filesystem, with the
/// same checksum gate as downloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl Fetcher for LocalFetcher {
    fn fetch(&self, blob: &RemoteBlob, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let BlobSource::Local { path } = &blob.source else {
            return Err(FetchError::MissingSource(PathBuf::from(&blob.name)));
        };
        if !path.is_file() {
            return Err(FetchError::MissingSource(path.clone()));
        }
        let dest = dest_dir.join(blob.stored_name());
        if reuse_existing(&dest, blob)? {
            return Ok(dest);
        }
        let dest = write_verified(File::open(path)?, &dest, blob)?;
        info!("copied {} from {}", blob.name, path.display());
        Ok(dest)
    }
}

/// Picks the fetcher matching each blob's source kind.
pub struct BlobFetcher {
    http: HttpFetcher,
    local: LocalFetcher,
}

impl BlobFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpFetcher::new(timeout),
            local: LocalFetcher,
        }
    }
}

impl Fetcher for BlobFetcher {
    fn fetch(&self, blob: &RemoteBlob, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        match blob.source {
            BlobSource::Remote { .. } => self.http.fetch(blob, dest_dir),
            BlobSource::Local { .. } => self.local.fetch(blob, dest_dir),
        }
    }
}
