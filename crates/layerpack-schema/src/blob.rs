use crate::types::Sha256Digest;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STORED_PREFIX_LEN: usize = 16;

/// Where a blob comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobSource {
    /// Downloaded from a package repository or mirror.
    Remote { url: String },
    /// Already present on the host filesystem.
    Local { path: PathBuf },
}

/// A package blob declared before retrieval.
///
/// Verified local paths are recorded by the caller, never on the blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteBlob {
    pub name: String,
    pub source: BlobSource,
    pub checksum: Sha256Digest,
}

impl RemoteBlob {
    pub fn remote(name: &str, url: &str, checksum: Sha256Digest) -> Self {
        Self {
            name: name.to_owned(),
            source: BlobSource::Remote {
                url: url.to_owned(),
            },
            checksum,
        }
    }

    pub fn local(name: &str, path: impl Into<PathBuf>, checksum: Sha256Digest) -> Self {
        Self {
            name: name.to_owned(),
            source: BlobSource::Local { path: path.into() },
            checksum,
        }
    }

    /// File name taken from the blob's source.
    ///
    /// Uses the last URL/path segment when it looks like a file name,
    /// otherwise the declared name. Path separators never survive.
    pub fn file_name(&self) -> String {
        let from_source = match &self.source {
            BlobSource::Remote { url } => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .map(str::to_owned),
            BlobSource::Local { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        };
        let candidate = from_source
            .filter(|s| !s.is_empty() && s.contains('.'))
            .unwrap_or_else(|| self.name.clone());
        candidate.replace(['/', '\\'], "_")
    }

    /// Name the blob is stored under once fetched: the file name prefixed
    /// with the start of the checksum.
    ///
    /// Two mirrors may publish different content under the same file name;
    /// the prefix keeps them apart in a shared download directory.
    pub fn stored_name(&self) -> String {
        let digest = self.checksum.as_str();
        let prefix = digest.get(..STORED_PREFIX_LEN).unwrap_or(digest);
        format!("{prefix}-{}", self.file_name())
    }

    /// True when the blob is an AppImage rather than a `.deb` archive.
    pub fn is_appimage(&self) -> bool {
        let name = self.file_name().to_ascii_lowercase();
        Path::new(&name)
            .extension()
            .is_some_and(|ext| ext == "appimage")
    }
}

/// One entry returned by the package index service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub url: String,
    pub sha256: String,
}

impl PackageRef {
    /// Turn an index entry into a blob declaration. Returns `None` when the
    /// index published a malformed checksum.
    pub fn to_blob(&self) -> Option<RemoteBlob> {
        let checksum = Sha256Digest::parse(&self.sha256)?;
        Some(RemoteBlob::remote(&self.name, &self.url, checksum))
    }
}
