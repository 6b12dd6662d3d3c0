use crate::FetchError;
use layerpack_schema::{PackageRef, RemoteBlob};
use std::path::Path;

/// Source of `(name, url, sha256)` entries for the packages to install.
pub trait PackageIndex {
    /// Entries whose names are in `names`, or every entry when `names` is
    /// empty. Asking for a name the index does not know is an error.
    fn packages(&self, names: &[String]) -> Result<Vec<PackageRef>, FetchError>;
}

/// An index exported to a JSON file: `[{"name", "url", "sha256"}, ...]`.
#[derive(Debug, Clone, Default)]
pub struct JsonIndex {
    entries: Vec<PackageRef>,
}

impl JsonIndex {
    pub fn load(path: &Path) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
            .map_err(|e| FetchError::Index(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, FetchError> {
        let entries: Vec<PackageRef> =
            serde_json::from_str(content).map_err(|e| FetchError::Index(e.to_string()))?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PackageIndex for JsonIndex {
    fn packages(&self, names: &[String]) -> Result<Vec<PackageRef>, FetchError> {
        if names.is_empty() {
            return Ok(self.entries.clone());
        }
        names
            .iter()
            .map(|name| {
                self.entries
                    .iter()
                    .find(|e| &e.name == name)
                    .cloned()
                    .ok_or_else(|| FetchError::Index(format!("package '{name}' not in index")))
            })
            .collect()
    }
}

/// Turn index entries into blob declarations, rejecting malformed checksums.
pub fn blobs_from_refs(refs: &[PackageRef]) -> Result<Vec<RemoteBlob>, FetchError> {
    refs.iter()
        .map(|r| {
            r.to_blob().ok_or_else(|| {
                FetchError::Index(format!("'{}' has a malformed sha256: {}", r.name, r.sha256))
            })
        })
        .collect()
}
