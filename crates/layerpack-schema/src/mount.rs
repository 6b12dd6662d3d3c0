use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One active mount, keyed by its target path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRecord {
    pub target: PathBuf,
    pub source: String,
    pub fstype: String,
    pub bind: bool,
}

impl MountRecord {
    pub fn bind(source: &Path, target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            source: source.to_string_lossy().into_owned(),
            fstype: "none".to_owned(),
            bind: true,
        }
    }

    pub fn filesystem(fstype: &str, source: &str, target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            source: source.to_owned(),
            fstype: fstype.to_owned(),
            bind: false,
        }
    }

    /// True when this mount lives strictly below `root`.
    pub fn is_under(&self, root: &Path) -> bool {
        self.target != root && self.target.starts_with(root)
    }
}
