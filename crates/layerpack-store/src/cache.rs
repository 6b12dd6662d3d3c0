use crate::layout::WorkLayout;
use crate::{write_json_atomic, StoreError};
use layerpack_schema::MountRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Current `cache.json` format version.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Assembly stages whose completion is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BaseReady,
    RuntimeFetched,
    RuntimeReady,
    PackagesFetched,
    Installed,
    Resolved,
    Materialized,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::BaseReady,
        Stage::RuntimeFetched,
        Stage::RuntimeReady,
        Stage::PackagesFetched,
        Stage::Installed,
        Stage::Resolved,
        Stage::Materialized,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::BaseReady => "base_ready",
            Stage::RuntimeFetched => "runtime_fetched",
            Stage::RuntimeReady => "runtime_ready",
            Stage::PackagesFetched => "packages_fetched",
            Stage::Installed => "installed",
            Stage::Resolved => "resolved",
            Stage::Materialized => "materialized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct StageFlags {
    #[serde(default)]
    pub base_ready: bool,
    #[serde(default)]
    pub runtime_fetched: bool,
    #[serde(default)]
    pub runtime_ready: bool,
    #[serde(default)]
    pub packages_fetched: bool,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub materialized: bool,
}

impl StageFlags {
    fn slot(&mut self, stage: Stage) -> &mut bool {
        match stage {
            Stage::BaseReady => &mut self.base_ready,
            Stage::RuntimeFetched => &mut self.runtime_fetched,
            Stage::RuntimeReady => &mut self.runtime_ready,
            Stage::PackagesFetched => &mut self.packages_fetched,
            Stage::Installed => &mut self.installed,
            Stage::Resolved => &mut self.resolved,
            Stage::Materialized => &mut self.materialized,
        }
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        match stage {
            Stage::BaseReady => self.base_ready,
            Stage::RuntimeFetched => self.runtime_fetched,
            Stage::RuntimeReady => self.runtime_ready,
            Stage::PackagesFetched => self.packages_fetched,
            Stage::Installed => self.installed,
            Stage::Resolved => self.resolved,
            Stage::Materialized => self.materialized,
        }
    }

    pub fn set(&mut self, stage: Stage, done: bool) {
        *self.slot(stage) = done;
    }
}

/// Persisted snapshot of assembly progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyCache {
    pub format_version: u32,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub flags: StageFlags,
    /// Blob name to verified local path.
    #[serde(default)]
    pub fetched: BTreeMap<String, PathBuf>,
    /// Mounts that were active when the cache was last written.
    #[serde(default)]
    pub mounts: Vec<MountRecord>,
    /// Closure size recorded by the last successful resolve.
    #[serde(default)]
    pub closure_len: Option<usize>,
    pub created_at: String,
    pub updated_at: String,
}

impl Default for AssemblyCache {
    fn default() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            format_version: CACHE_FORMAT_VERSION,
            app_id: None,
            flags: StageFlags::default(),
            fetched: BTreeMap::new(),
            mounts: Vec::new(),
            closure_len: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

impl AssemblyCache {
    pub fn is_done(&self, stage: Stage) -> bool {
        self.flags.is_done(stage)
    }

    pub fn mark(&mut self, stage: Stage) {
        self.flags.set(stage, true);
    }

    /// Clear `stage` and every stage after it.
    pub fn invalidate_from(&mut self, stage: Stage) {
        let mut clearing = false;
        for s in Stage::ALL {
            if s == stage {
                clearing = true;
            }
            if clearing {
                self.flags.set(s, false);
            }
        }
    }

    pub fn completed(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.flags.is_done(*s))
            .collect()
    }
}

/// Reads and atomically writes `cache.json`.
#[derive(Debug, Clone)]
pub struct CacheStore {
    layout: WorkLayout,
}

impl CacheStore {
    pub fn new(layout: WorkLayout) -> Self {
        Self { layout }
    }

    /// Load the cache, returning a fresh one when none has been written yet.
    pub fn load(&self) -> Result<AssemblyCache, StoreError> {
        let path = self.layout.cache_path();
        if !path.exists() {
            debug!("no cache at {}, starting fresh", path.display());
            return Ok(AssemblyCache::default());
        }
        let content = fs::read_to_string(&path)?;
        let cache: AssemblyCache = serde_json::from_str(&content)?;
        if cache.format_version != CACHE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: CACHE_FORMAT_VERSION,
                found: cache.format_version,
            });
        }
        Ok(cache)
    }

    /// Write the cache atomically.
    pub fn save(&self, cache: &mut AssemblyCache) -> Result<(), StoreError> {
        cache.updated_at = chrono::Utc::now().to_rfc3339();
        write_json_atomic(&self.layout.cache_path(), cache)
    }

    pub fn remove(&self) -> Result<(), StoreError> {
        let path = self.layout.cache_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
