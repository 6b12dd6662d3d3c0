use crate::mounts::{Mounter, UnmountMode};
use crate::RuntimeError;
use layerpack_schema::MountRecord;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        record: MountRecord,
        options: Vec<String>,
    },
    Unmount {
        target: PathBuf,
        mode: UnmountMode,
    },
}

#[derive(Debug, Default)]
struct State {
    active: BTreeSet<PathBuf>,
    calls: Vec<MountCall>,
    fail_mount: BTreeSet<PathBuf>,
    busy_once: BTreeSet<PathBuf>,
}

/// In-memory mounter that records every call instead of touching the host.
#[derive(Debug, Default)]
pub struct RecordingMounter {
    state: Mutex<State>,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every mount at `target` fail.
    pub fn fail_mount_at(&self, target: &Path) {
        self.lock().fail_mount.insert(target.to_path_buf());
    }

    /// Make the next normal unmount of `target` report busy.
    pub fn busy_once(&self, target: &Path) {
        self.lock().busy_once.insert(target.to_path_buf());
    }

    /// Pretend `target` is mounted, as if left over from an earlier run.
    pub fn mark_active(&self, target: &Path) {
        self.lock().active.insert(target.to_path_buf());
    }

    pub fn active(&self) -> Vec<PathBuf> {
        self.lock().active.iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.lock().calls.clone()
    }

    pub fn mount_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MountCall::Mount { .. }))
            .count()
    }

    pub fn unmount_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, MountCall::Unmount { .. }))
            .count()
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, record: &MountRecord, options: &[String]) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.push(MountCall::Mount {
            record: record.clone(),
            options: options.to_vec(),
        });
        if state.fail_mount.contains(&record.target) {
            return Err(RuntimeError::MountFailed {
                target: record.target.clone(),
                message: "mock failure".to_owned(),
            });
        }
        if !state.active.insert(record.target.clone()) {
            return Err(RuntimeError::AlreadyMounted(record.target.clone()));
        }
        Ok(())
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.calls.push(MountCall::Unmount {
            target: target.to_path_buf(),
            mode,
        });
        if mode == UnmountMode::Normal && state.busy_once.remove(target) {
            return Err(RuntimeError::Busy(target.to_path_buf()));
        }
        if mode == UnmountMode::Lazy {
            state.active.retain(|p| !p.starts_with(target));
            return Ok(());
        }
        if !state.active.remove(target) {
            return Err(RuntimeError::MountFailed {
                target: target.to_path_buf(),
                message: "not mounted".to_owned(),
            });
        }
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> bool {
        self.lock().active.contains(target)
    }
}
