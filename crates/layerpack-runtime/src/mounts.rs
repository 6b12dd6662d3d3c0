use crate::exec::Cmd;
use crate::RuntimeError;
use layerpack_schema::{MountRecord, OverlayDriver};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Normal,
    /// Detach now, clean up once no longer busy. Also releases submounts.
    Lazy,
}

/// Performs mounts on behalf of the composer and sandbox.
pub trait Mounter: Send + Sync {
    fn mount(&self, record: &MountRecord, options: &[String]) -> Result<(), RuntimeError>;

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<(), RuntimeError>;

    fn is_mounted(&self, target: &Path) -> bool;
}

/// The set of mounts created by this process, keyed by target path.
///
/// Only the mount lifecycle functions mutate it. Its snapshot is persisted
/// so an interrupted run can adopt mounts that are still active.
#[derive(Debug, Default)]
pub struct MountTable {
    inner: Mutex<BTreeMap<PathBuf, MountRecord>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, MountRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: MountRecord) -> Result<(), RuntimeError> {
        let mut map = self.lock();
        if map.contains_key(&record.target) {
            return Err(RuntimeError::AlreadyMounted(record.target));
        }
        map.insert(record.target.clone(), record);
        Ok(())
    }

    pub fn remove(&self, target: &Path) -> Option<MountRecord> {
        self.lock().remove(target)
    }

    pub fn contains(&self, target: &Path) -> bool {
        self.lock().contains_key(target)
    }

    /// Records strictly below `prefix`, parents before children.
    pub fn under(&self, prefix: &Path) -> Vec<MountRecord> {
        self.lock()
            .values()
            .filter(|r| r.is_under(prefix))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<MountRecord> {
        self.lock().values().cloned().collect()
    }

    /// Replace the table contents with previously persisted records.
    pub fn restore(&self, records: impl IntoIterator<Item = MountRecord>) {
        let mut map = self.lock();
        map.clear();
        for r in records {
            map.insert(r.target.clone(), r);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Mount through `mounter` and record the mount in `table`.
pub fn mount_tracked(
    mounter: &dyn Mounter,
    table: &MountTable,
    record: MountRecord,
    options: &[String],
) -> Result<(), RuntimeError> {
    if table.contains(&record.target) {
        return Err(RuntimeError::AlreadyMounted(record.target));
    }
    mounter.mount(&record, options)?;
    table.insert(record)
}

/// Unmount `target` and drop its record.
pub fn unmount_tracked(
    mounter: &dyn Mounter,
    table: &MountTable,
    target: &Path,
    mode: UnmountMode,
) -> Result<(), RuntimeError> {
    mounter.unmount(target, mode)?;
    table.remove(target);
    Ok(())
}

/// Drives mount(8), umount(8) and fuse-overlayfs.
#[derive(Debug, Clone)]
pub struct SystemMounter {
    driver: OverlayDriver,
    timeout: Duration,
}

impl SystemMounter {
    pub fn new(driver: OverlayDriver, timeout: Duration) -> Self {
        Self { driver, timeout }
    }

    fn mount_command(&self, record: &MountRecord, options: &[String]) -> Cmd {
        let target = record.target.as_os_str().to_owned();
        if record.fstype == "overlay" && self.driver == OverlayDriver::Fuse {
            return Cmd::new("fuse-overlayfs")
                .arg("-o")
                .arg(options.join(","))
                .arg(target);
        }

        let mut cmd = Cmd::new("mount");
        if record.bind {
            cmd = cmd.arg("--bind");
        } else {
            cmd = cmd.arg("-t").arg(&record.fstype);
        }
        if !options.is_empty() {
            cmd = cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(&record.source).arg(target)
    }
}

impl Mounter for SystemMounter {
    fn mount(&self, record: &MountRecord, options: &[String]) -> Result<(), RuntimeError> {
        let out = self
            .mount_command(record, options)
            .timeout(self.timeout)
            .allow_fail()
            .run()?;
        if out.success() {
            debug!(
                "mounted {} ({}) at {}",
                record.source,
                record.fstype,
                record.target.display()
            );
            return Ok(());
        }
        let message = out.stderr.trim().to_owned();
        if message.contains("only root") || message.contains("Operation not permitted") {
            return Err(RuntimeError::PermissionDenied(message));
        }
        Err(RuntimeError::MountFailed {
            target: record.target.clone(),
            message,
        })
    }

    fn unmount(&self, target: &Path, mode: UnmountMode) -> Result<(), RuntimeError> {
        let fuse = mount_fstype(target).is_some_and(|t| t.starts_with("fuse"));
        let cmd = match (fuse, mode) {
            (true, UnmountMode::Normal) => Cmd::new("fusermount3").arg("-u"),
            (true, UnmountMode::Lazy) => Cmd::new("fusermount3").arg("-uz"),
            (false, UnmountMode::Normal) => Cmd::new("umount"),
            (false, UnmountMode::Lazy) => Cmd::new("umount").args(["-R", "-l"]),
        };
        let out = cmd
            .arg(target.as_os_str())
            .timeout(self.timeout)
            .allow_fail()
            .run()?;
        if out.success() {
            debug!("unmounted {}", target.display());
            return Ok(());
        }
        let message = out.stderr.trim().to_owned();
        if message.contains("busy") {
            return Err(RuntimeError::Busy(target.to_path_buf()));
        }
        if message.contains("not mounted") {
            warn!("{} was not mounted", target.display());
            return Ok(());
        }
        Err(RuntimeError::MountFailed {
            target: target.to_path_buf(),
            message,
        })
    }

    fn is_mounted(&self, target: &Path) -> bool {
        mount_fstype(target).is_some()
    }
}

/// Filesystem type of the mount at `path` according to /proc/mounts.
pub fn mount_fstype(path: &Path) -> Option<String> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;
    find_mount(&mounts, &canonical)
}

/// Find `target` in /proc/mounts content; the last matching entry wins
/// because later mounts shadow earlier ones.
fn find_mount(mounts: &str, target: &Path) -> Option<String> {
    let wanted = target.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let mountpoint = unescape_mount_field(fields.next()?);
            let fstype = fields.next()?;
            (mountpoint == wanted).then(|| fstype.to_owned())
        })
        .last()
}

/// /proc/mounts escapes space, tab, newline and backslash as octal.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
