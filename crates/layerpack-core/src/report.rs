use layerpack_elf::{MaterializeReport, Resolution};
use layerpack_runtime::Ignored;
use layerpack_schema::MountRecord;
use serde::Serialize;
use std::path::PathBuf;

/// Outcome of the package retrieval stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchSummary {
    /// Blob name and verified local path, in declaration order.
    pub fetched: Vec<(String, PathBuf)>,
    /// Blobs whose first download failed the checksum and were fetched again.
    pub refetched: Vec<String>,
}

/// What one [`crate::Engine::build`] call did.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub app_id: String,
    /// Stages run by this call, in order.
    pub ran: Vec<String>,
    /// Stages already complete from an earlier run.
    pub skipped: Vec<String>,
    pub fetch: FetchSummary,
    /// `None` when the closure was loaded from an earlier run.
    pub resolution: Option<Resolution>,
    pub closure_len: usize,
    pub materialized: Option<MaterializeReport>,
    /// Teardown failures that did not stop the build.
    pub ignored: Vec<Ignored>,
    pub bundle_dir: PathBuf,
}

impl BuildReport {
    pub(crate) fn new(app_id: &str, bundle_dir: PathBuf) -> Self {
        Self {
            app_id: app_id.to_owned(),
            ran: Vec::new(),
            skipped: Vec::new(),
            fetch: FetchSummary::default(),
            resolution: None,
            closure_len: 0,
            materialized: None,
            ignored: Vec::new(),
            bundle_dir,
        }
    }
}

/// Persisted progress of a working directory.
#[derive(Debug, Clone, Serialize)]
pub struct WorkdirStatus {
    pub workdir: PathBuf,
    pub app_id: Option<String>,
    pub completed: Vec<String>,
    pub pending: Vec<String>,
    pub fetched: usize,
    pub closure_len: Option<usize>,
    pub mounts: Vec<MountRecord>,
    pub locked: bool,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanReport {
    pub unmounted: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub ignored: Vec<Ignored>,
}
