//! Host-level plumbing for layerpack assemblies.
//!
//! This crate implements everything that touches processes and mounts: the
//! `Cmd` executor with hard timeouts, the `MountTable` and `Mounter` seam,
//! overlay composition of up to three lower layers, auxiliary mounts for a
//! usable chroot, the `SandboxSession` that binds host data into a root and
//! runs generated scripts inside it, base-layer preparation from an ISO or
//! AppImage, and host prerequisite checks.

pub mod exec;
pub mod image;
pub mod mock;
pub mod mounts;
pub mod overlay;
pub mod prereq;
pub mod sandbox;
pub mod script;

pub use exec::{which, Cmd, CommandOutput};
pub use mock::RecordingMounter;
pub use mounts::{MountTable, Mounter, SystemMounter, UnmountMode};
pub use overlay::{ComposeOptions, ComposedRoot, Layer, MAX_LOWER_LAYERS};
pub use prereq::{check_host_prereqs, format_missing, running_as_root, HostNeeds, MissingPrereq};
pub use sandbox::{run_in_chroot, Sandbox, SandboxSession};

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{program}' exited with code {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },
    #[error("'{program}' timed out after {}s", after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("mount failed at {}: {message}", target.display())]
    MountFailed { target: PathBuf, message: String },
    #[error("mount target busy: {}", .0.display())]
    Busy(PathBuf),
    #[error("already mounted: {}", .0.display())]
    AlreadyMounted(PathBuf),
    #[error("cannot unmount {}: {} child mount(s) still active", mountpoint.display(), children.len())]
    ChildMountsActive {
        mountpoint: PathBuf,
        children: Vec<PathBuf>,
    },
    #[error("invalid layer: {0}")]
    InvalidLayer(String),
    #[error("sandbox script failed with code {code}: {stderr}")]
    ScriptFailed { code: i32, stderr: String },
}

/// A failure that was deliberately not propagated.
///
/// Teardown and best-effort steps return these instead of logging and
/// forgetting, so callers can surface them in reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ignored {
    pub path: PathBuf,
    pub message: String,
}

impl Ignored {
    pub fn new(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Ignored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_uses_seconds() {
        let e = RuntimeError::Timeout {
            program: "ldd".to_owned(),
            after: Duration::from_secs(30),
        };
        assert_eq!(e.to_string(), "'ldd' timed out after 30s");
    }

    #[test]
    fn ignored_display() {
        let i = Ignored::new("/w/rootfs/sys", "target is busy");
        assert_eq!(i.to_string(), "/w/rootfs/sys: target is busy");
    }
}
