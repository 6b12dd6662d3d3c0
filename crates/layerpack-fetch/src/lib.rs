//! Package retrieval for layerpack assemblies.
//!
//! Blobs are fetched by a fixed pool of workers. Every byte is hashed as it
//! is written, and a file only lands at its final path once its SHA-256
//! matches the declared checksum, so a corrupt download is never visible.

pub mod digest;
pub mod http;
pub mod index;
pub mod pipeline;
pub mod source;

pub use digest::{sha256_file, write_verified};
pub use http::HttpFetcher;
pub use index::{blobs_from_refs, JsonIndex, PackageIndex};
pub use pipeline::{fetch_all, CancelToken};
pub use source::{BlobFetcher, LocalFetcher};

use layerpack_schema::RemoteBlob;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error for {url}: {message}")]
    Http { url: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity failure for '{name}': expected {expected}, got {actual}")]
    IntegrityFailure {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("fetch of '{name}' cancelled before it started")]
    Cancelled { name: String },
    #[error("source file missing: {}", .0.display())]
    MissingSource(PathBuf),
    #[error("package index error: {0}")]
    Index(String),
}

impl FetchError {
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::IntegrityFailure { .. })
    }
}

/// Retrieves one blob into a directory.
///
/// Implementations return the local path only after the content matched
/// the blob's checksum.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, blob: &RemoteBlob, dest_dir: &Path) -> Result<PathBuf, FetchError>;
}
