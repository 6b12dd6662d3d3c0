use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of an assembly working directory.
///
/// ```text
/// <root>/
///   iso/            base ISO staging
///   iso/mount/      loop mount of the ISO
///   iso/live/       copied squashfs image
///   runtime/        downloaded runtime archive
///   runtimedir/     unpacked runtime layer
///   basedir/        base layer
///   initdir/        writable overlay upper layer
///   work/           overlay workdir
///   rootfs/         overlay mountpoint
///   debdir/         fetched packages
///   scripts/        generated sandbox scripts
///   bundle/         materialized dependency closure
///   cache.json
///   .lock
/// ```
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn iso_dir(&self) -> PathBuf {
        self.root.join("iso")
    }

    #[inline]
    pub fn iso_mount_dir(&self) -> PathBuf {
        self.iso_dir().join("mount")
    }

    #[inline]
    pub fn iso_live_dir(&self) -> PathBuf {
        self.iso_dir().join("live")
    }

    #[inline]
    pub fn runtime_download_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    #[inline]
    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtimedir")
    }

    #[inline]
    pub fn base_dir(&self) -> PathBuf {
        self.root.join("basedir")
    }

    /// The writable upper layer. Everything the install step writes lands here.
    #[inline]
    pub fn init_dir(&self) -> PathBuf {
        self.root.join("initdir")
    }

    #[inline]
    pub fn overlay_work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    #[inline]
    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    #[inline]
    pub fn deb_dir(&self) -> PathBuf {
        self.root.join("debdir")
    }

    #[inline]
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    #[inline]
    pub fn bundle_dir(&self) -> PathBuf {
        self.root.join("bundle")
    }

    #[inline]
    pub fn cache_path(&self) -> PathBuf {
        self.root.join("cache.json")
    }

    /// Resolved closure of the last resolve stage.
    #[inline]
    pub fn closure_path(&self) -> PathBuf {
        self.root.join("closure.json")
    }

    #[inline]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Create every directory that must exist before an assembly starts.
    ///
    /// `work/` and `rootfs/` are left to the overlay composer, which checks
    /// their state itself.
    pub fn initialize(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.iso_mount_dir(),
            self.iso_live_dir(),
            self.runtime_download_dir(),
            self.runtime_dir(),
            self.base_dir(),
            self.init_dir(),
            self.deb_dir(),
            self.scripts_dir(),
            self.bundle_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Directories that only hold state of an in-progress assembly.
    pub fn transient_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.rootfs_dir(),
            self.overlay_work_dir(),
            self.init_dir(),
            self.scripts_dir(),
            self.bundle_dir(),
        ]
    }

    /// Directories holding downloaded or unpacked inputs that survive `clean`
    /// unless everything is removed.
    pub fn input_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.iso_dir(),
            self.runtime_download_dir(),
            self.runtime_dir(),
            self.base_dir(),
            self.deb_dir(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_under_root() {
        let layout = WorkLayout::new("/work");
        assert_eq!(layout.iso_mount_dir(), PathBuf::from("/work/iso/mount"));
        assert_eq!(layout.iso_live_dir(), PathBuf::from("/work/iso/live"));
        assert_eq!(layout.runtime_dir(), PathBuf::from("/work/runtimedir"));
        assert_eq!(layout.init_dir(), PathBuf::from("/work/initdir"));
        assert_eq!(layout.cache_path(), PathBuf::from("/work/cache.json"));
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkLayout::new(dir.path().join("w"));
        layout.initialize().unwrap();
        assert!(layout.iso_mount_dir().is_dir());
        assert!(layout.deb_dir().is_dir());
        assert!(layout.init_dir().is_dir());
        assert!(!layout.rootfs_dir().exists());
        assert!(!layout.overlay_work_dir().exists());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(layout.deb_dir().join("a.deb"), b"x").unwrap();
        layout.initialize().unwrap();
        assert!(layout.deb_dir().join("a.deb").exists());
    }

    #[test]
    fn transient_and_input_dirs_are_disjoint() {
        let layout = WorkLayout::new("/w");
        let transient = layout.transient_dirs();
        for input in layout.input_dirs() {
            assert!(!transient.contains(&input));
        }
    }
}
