//! Overlay composition of the assembly root.
//!
//! A [`Layer`] stacks up to three read-only lower directories (base, runtime,
//! init) under one writable upper directory. [`compose`] validates the layer
//! and mounts it, [`mount_auxiliary`] adds the pseudo filesystems a chroot
//! needs, and [`ComposedRoot`] ties both to a scope so teardown happens on
//! every exit path.

use crate::mounts::{mount_tracked, unmount_tracked, MountTable, Mounter, UnmountMode};
use crate::{Ignored, RuntimeError};
use layerpack_schema::MountRecord;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MAX_LOWER_LAYERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Read-only layers, bottom to top.
    pub lowers: Vec<PathBuf>,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub mountpoint: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComposeOptions {
    /// Accept a non-empty upper directory, as left by an interrupted run.
    pub reuse_upper: bool,
}

impl Layer {
    /// `lowerdir=` value: overlayfs expects the topmost layer first.
    pub fn lowerdir(&self) -> String {
        self.lowers
            .iter()
            .rev()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn mount_options(&self) -> Vec<String> {
        vec![
            format!("lowerdir={}", self.lowerdir()),
            format!("upperdir={}", self.upper.display()),
            format!("workdir={}", self.work.display()),
        ]
    }

    fn validate(&self, opts: ComposeOptions) -> Result<(), RuntimeError> {
        for path in self
            .lowers
            .iter()
            .chain([&self.upper, &self.work, &self.mountpoint])
        {
            let s = path.to_string_lossy();
            if s.contains(':') || s.contains(',') {
                return Err(RuntimeError::InvalidLayer(format!(
                    "overlay paths must not contain ':' or ',': {s}"
                )));
            }
        }
        for lower in &self.lowers {
            if !lower.is_dir() {
                return Err(RuntimeError::InvalidLayer(format!(
                    "lower layer does not exist: {}",
                    lower.display()
                )));
            }
        }

        if !is_empty_dir(&self.work)? {
            return Err(RuntimeError::InvalidLayer(format!(
                "overlay workdir is not empty: {}",
                self.work.display()
            )));
        }
        if !opts.reuse_upper && !is_empty_dir(&self.upper)? {
            return Err(RuntimeError::InvalidLayer(format!(
                "upper layer is not empty: {}",
                self.upper.display()
            )));
        }

        let upper_dev = fs::metadata(&self.upper)?.dev();
        let work_dev = fs::metadata(&self.work)?.dev();
        if upper_dev != work_dev {
            return Err(RuntimeError::InvalidLayer(format!(
                "upper {} and workdir {} are on different filesystems",
                self.upper.display(),
                self.work.display()
            )));
        }
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> Result<bool, RuntimeError> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Mount `layer` at its mountpoint and record it in `table`.
pub fn compose(
    layer: &Layer,
    opts: ComposeOptions,
    mounter: &dyn Mounter,
    table: &MountTable,
) -> Result<MountRecord, RuntimeError> {
    if layer.lowers.is_empty() || layer.lowers.len() > MAX_LOWER_LAYERS {
        return Err(RuntimeError::InvalidLayer(format!(
            "expected 1 to {MAX_LOWER_LAYERS} lower layers, got {}",
            layer.lowers.len()
        )));
    }
    if table.contains(&layer.mountpoint) || mounter.is_mounted(&layer.mountpoint) {
        return Err(RuntimeError::AlreadyMounted(layer.mountpoint.clone()));
    }
    for dir in [&layer.upper, &layer.work, &layer.mountpoint] {
        fs::create_dir_all(dir)?;
    }
    layer.validate(opts)?;

    let record = MountRecord::filesystem("overlay", "overlay", &layer.mountpoint);
    mount_tracked(mounter, table, record.clone(), &layer.mount_options())?;
    info!(
        "composed {} from {} lower layer(s)",
        layer.mountpoint.display(),
        layer.lowers.len()
    );
    Ok(record)
}

/// Unmount the overlay at `mountpoint`.
///
/// Refuses while any tracked mount lives below it. A busy mount is retried
/// exactly once, lazily.
pub fn decompose(
    mountpoint: &Path,
    mounter: &dyn Mounter,
    table: &MountTable,
) -> Result<(), RuntimeError> {
    let children = table.under(mountpoint);
    if !children.is_empty() {
        return Err(RuntimeError::ChildMountsActive {
            mountpoint: mountpoint.to_path_buf(),
            children: children.into_iter().map(|r| r.target).collect(),
        });
    }
    release_one(mounter, table, mountpoint)?;
    debug!("decomposed {}", mountpoint.display());
    Ok(())
}

fn release_one(
    mounter: &dyn Mounter,
    table: &MountTable,
    target: &Path,
) -> Result<(), RuntimeError> {
    match unmount_tracked(mounter, table, target, UnmountMode::Normal) {
        Err(RuntimeError::Busy(_)) => {
            warn!("{} is busy, detaching lazily", target.display());
            unmount_tracked(mounter, table, target, UnmountMode::Lazy)
        }
        other => other,
    }
}

#[derive(Debug, Clone, Copy)]
enum AuxKind {
    Bind,
    BindFile,
    Filesystem(&'static str),
}

struct AuxMount {
    host: &'static str,
    target: &'static str,
    kind: AuxKind,
    options: &'static [&'static str],
}

const AUX_MOUNTS: &[AuxMount] = &[
    AuxMount {
        host: "/dev",
        target: "dev",
        kind: AuxKind::Bind,
        options: &[],
    },
    AuxMount {
        host: "/dev/pts",
        target: "dev/pts",
        kind: AuxKind::Bind,
        options: &[],
    },
    AuxMount {
        host: "proc",
        target: "proc",
        kind: AuxKind::Filesystem("proc"),
        options: &[],
    },
    AuxMount {
        host: "/sys",
        target: "sys",
        kind: AuxKind::Bind,
        options: &[],
    },
    AuxMount {
        host: "tmpfs",
        target: "tmp",
        kind: AuxKind::Filesystem("tmpfs"),
        options: &["mode=1777", "nosuid", "nodev"],
    },
    AuxMount {
        host: "/etc/resolv.conf",
        target: "etc/resolv.conf",
        kind: AuxKind::BindFile,
        options: &[],
    },
];

/// Mount the pseudo filesystems a chroot under `root` needs.
///
/// On failure every auxiliary mount made so far is released again before the
/// error is returned.
pub fn mount_auxiliary(
    root: &Path,
    mounter: &dyn Mounter,
    table: &MountTable,
) -> Result<Vec<MountRecord>, RuntimeError> {
    let mut mounted = Vec::new();
    for aux in AUX_MOUNTS {
        let target = root.join(aux.target);
        let record = match aux.kind {
            AuxKind::Bind => {
                if !Path::new(aux.host).is_dir() {
                    debug!("host {} missing, not binding", aux.host);
                    continue;
                }
                fs::create_dir_all(&target)?;
                MountRecord::bind(Path::new(aux.host), &target)
            }
            AuxKind::BindFile => {
                if !Path::new(aux.host).is_file() {
                    continue;
                }
                // A symlink here may point outside the root once followed by
                // the host's mount(8).
                if target.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                    debug!("{} is a symlink, not binding", target.display());
                    continue;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if !target.exists() {
                    fs::write(&target, b"")?;
                }
                MountRecord::bind(Path::new(aux.host), &target)
            }
            AuxKind::Filesystem(fstype) => {
                fs::create_dir_all(&target)?;
                MountRecord::filesystem(fstype, aux.host, &target)
            }
        };
        let options: Vec<String> = aux.options.iter().map(|o| (*o).to_owned()).collect();
        if let Err(e) = mount_tracked(mounter, table, record.clone(), &options) {
            for ignored in unmount_auxiliary(root, mounter, table) {
                warn!("rollback: {ignored}");
            }
            return Err(e);
        }
        mounted.push(record);
    }
    Ok(mounted)
}

/// Release every tracked mount strictly below `root`, deepest first.
///
/// Best effort: failures are returned as [`Ignored`] and the record stays in
/// the table, so a later [`decompose`] refuses to pull the overlay out from
/// under a live mount.
pub fn unmount_auxiliary(root: &Path, mounter: &dyn Mounter, table: &MountTable) -> Vec<Ignored> {
    let mut ignored = Vec::new();
    for record in table.under(root).into_iter().rev() {
        if !table.contains(&record.target) {
            // Released together with a parent by a lazy unmount.
            continue;
        }
        match release_one(mounter, table, &record.target) {
            Ok(()) => {
                // A lazy unmount also detached everything below.
                for child in table.under(&record.target) {
                    table.remove(&child.target);
                }
            }
            Err(e) => ignored.push(Ignored::new(&record.target, e)),
        }
    }
    ignored
}

/// Scoped ownership of a composed root and its auxiliary mounts.
///
/// Dropping the guard releases auxiliary mounts, then the overlay.
pub struct ComposedRoot<'a> {
    mountpoint: PathBuf,
    mounter: &'a dyn Mounter,
    table: &'a MountTable,
    released: bool,
}

impl<'a> ComposedRoot<'a> {
    /// Compose `layer` and mount the auxiliary filesystems inside it.
    pub fn compose(
        layer: &Layer,
        opts: ComposeOptions,
        mounter: &'a dyn Mounter,
        table: &'a MountTable,
    ) -> Result<Self, RuntimeError> {
        compose(layer, opts, mounter, table)?;
        let guard = Self {
            mountpoint: layer.mountpoint.clone(),
            mounter,
            table,
            released: false,
        };
        mount_auxiliary(&guard.mountpoint, mounter, table)?;
        Ok(guard)
    }

    /// Take ownership of mounts an earlier run left active. The table must
    /// already hold their records.
    pub fn adopt(mountpoint: &Path, mounter: &'a dyn Mounter, table: &'a MountTable) -> Self {
        info!("adopting active root at {}", mountpoint.display());
        Self {
            mountpoint: mountpoint.to_path_buf(),
            mounter,
            table,
            released: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.mountpoint
    }

    /// Tear down explicitly, surfacing the overlay unmount error.
    pub fn release(mut self) -> Result<Vec<Ignored>, RuntimeError> {
        self.released = true;
        let ignored = unmount_auxiliary(&self.mountpoint, self.mounter, self.table);
        decompose(&self.mountpoint, self.mounter, self.table)?;
        Ok(ignored)
    }
}

impl Drop for ComposedRoot<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for ignored in unmount_auxiliary(&self.mountpoint, self.mounter, self.table) {
            warn!("teardown: {ignored}");
        }
        if let Err(e) = decompose(&self.mountpoint, self.mounter, self.table) {
            warn!("teardown of {}: {e}", self.mountpoint.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MountCall, RecordingMounter};

    struct Fixture {
        _dir: tempfile::TempDir,
        layer: Layer,
    }

    fn fixture(lowers: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let names = ["a", "b", "c", "d"];
        let lowers: Vec<PathBuf> = names[..lowers]
            .iter()
            .map(|n| {
                let p = dir.path().join(n);
                fs::create_dir_all(&p).unwrap();
                p
            })
            .collect();
        let layer = Layer {
            lowers,
            upper: dir.path().join("upper"),
            work: dir.path().join("work"),
            mountpoint: dir.path().join("mnt"),
        };
        Fixture { _dir: dir, layer }
    }

    fn mounted_options(m: &RecordingMounter) -> Vec<String> {
        m.calls()
            .into_iter()
            .find_map(|c| match c {
                MountCall::Mount { options, .. } => Some(options),
                MountCall::Unmount { .. } => None,
            })
            .unwrap()
    }

    #[test]
    fn lowerdir_lists_topmost_first() {
        let layer = Layer {
            lowers: vec!["/a".into(), "/b".into(), "/c".into()],
            upper: "/u".into(),
            work: "/w".into(),
            mountpoint: "/m".into(),
        };
        assert_eq!(layer.lowerdir(), "/c:/b:/a");
    }

    #[test]
    fn compose_then_decompose_restores_state() {
        let f = fixture(3);
        let m = RecordingMounter::new();
        let table = MountTable::new();

        compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap();
        assert!(m.is_mounted(&f.layer.mountpoint));
        assert_eq!(table.len(), 1);
        let opts = mounted_options(&m);
        let l = &f.layer.lowers;
        assert_eq!(
            opts[0],
            format!(
                "lowerdir={}:{}:{}",
                l[2].display(),
                l[1].display(),
                l[0].display()
            )
        );

        decompose(&f.layer.mountpoint, &m, &table).unwrap();
        assert!(table.is_empty());
        assert!(m.active().is_empty());
        assert!(f.layer.upper.is_dir());
        assert!(f.layer.work.is_dir());
        assert!(f.layer.mountpoint.is_dir());
    }

    #[test]
    fn rejects_too_many_or_no_lowers() {
        let m = RecordingMounter::new();
        let table = MountTable::new();
        let f = fixture(4);
        let err = compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLayer(_)));

        let mut f = fixture(1);
        f.layer.lowers.clear();
        let err = compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidLayer(_)));
        assert_eq!(m.mount_count(), 0);
    }

    #[test]
    fn rejects_missing_lower() {
        let mut f = fixture(1);
        f.layer.lowers.push(PathBuf::from("/nonexistent/layerpack/lower"));
        let err = compose(
            &f.layer,
            ComposeOptions::default(),
            &RecordingMounter::new(),
            &MountTable::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn non_empty_upper_requires_reuse() {
        let f = fixture(1);
        fs::create_dir_all(f.layer.upper.join("usr")).unwrap();
        let m = RecordingMounter::new();
        let table = MountTable::new();
        assert!(compose(&f.layer, ComposeOptions::default(), &m, &table).is_err());
        compose(&f.layer, ComposeOptions { reuse_upper: true }, &m, &table).unwrap();
    }

    #[test]
    fn non_empty_workdir_is_rejected() {
        let f = fixture(1);
        fs::create_dir_all(f.layer.work.join("work")).unwrap();
        let err = compose(
            &f.layer,
            ComposeOptions { reuse_upper: true },
            &RecordingMounter::new(),
            &MountTable::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("workdir"));
    }

    #[test]
    fn refuses_second_compose_on_same_mountpoint() {
        let f = fixture(2);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap();
        let err = compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyMounted(_)));
    }

    #[test]
    fn decompose_refuses_with_child_mounts() {
        let f = fixture(1);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap();
        mount_auxiliary(&f.layer.mountpoint, &m, &table).unwrap();

        let err = decompose(&f.layer.mountpoint, &m, &table).unwrap_err();
        assert!(matches!(err, RuntimeError::ChildMountsActive { .. }));

        assert!(unmount_auxiliary(&f.layer.mountpoint, &m, &table).is_empty());
        decompose(&f.layer.mountpoint, &m, &table).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn busy_unmount_retries_lazily_once() {
        let f = fixture(1);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap();
        m.busy_once(&f.layer.mountpoint);

        decompose(&f.layer.mountpoint, &m, &table).unwrap();
        let unmounts: Vec<_> = m
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::Unmount { mode, .. } => Some(mode),
                MountCall::Mount { .. } => None,
            })
            .collect();
        assert_eq!(unmounts, vec![UnmountMode::Normal, UnmountMode::Lazy]);
        assert!(table.is_empty());
    }

    #[test]
    fn auxiliary_failure_rolls_back() {
        let f = fixture(1);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap();
        m.fail_mount_at(&f.layer.mountpoint.join("tmp"));

        let err = mount_auxiliary(&f.layer.mountpoint, &m, &table).unwrap_err();
        assert!(matches!(err, RuntimeError::MountFailed { .. }));
        assert!(table.under(&f.layer.mountpoint).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn composed_root_drop_releases_everything() {
        let f = fixture(2);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        {
            let root = ComposedRoot::compose(&f.layer, ComposeOptions::default(), &m, &table)
                .unwrap();
            assert!(root.root().join("proc").is_dir());
            assert!(table.len() > 1);
        }
        assert!(table.is_empty());
        assert!(m.active().is_empty());
        assert_eq!(m.mount_count(), m.unmount_count());
    }

    #[test]
    fn composed_root_release_reports() {
        let f = fixture(1);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        let root =
            ComposedRoot::compose(&f.layer, ComposeOptions::default(), &m, &table).unwrap();
        let ignored = root.release().unwrap();
        assert!(ignored.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn symlinked_resolv_conf_is_not_bound() {
        let f = fixture(1);
        let m = RecordingMounter::new();
        let table = MountTable::new();
        let etc = f.layer.mountpoint.join("etc");
        fs::create_dir_all(&etc).unwrap();
        std::os::unix::fs::symlink("/run/elsewhere", etc.join("resolv.conf")).unwrap();

        mount_auxiliary(&f.layer.mountpoint, &m, &table).unwrap();
        assert!(!table.contains(&etc.join("resolv.conf")));
        unmount_auxiliary(&f.layer.mountpoint, &m, &table);
    }
}
