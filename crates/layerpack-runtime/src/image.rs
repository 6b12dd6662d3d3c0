//! Preparation of the read-only lower layers and AppImage payloads.

use crate::exec::Cmd;
use crate::mounts::{mount_tracked, unmount_tracked, MountTable, Mounter, UnmountMode};
use crate::RuntimeError;
use layerpack_schema::MountRecord;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where live ISOs keep their root filesystem image, in lookup order.
const SQUASHFS_CANDIDATES: &[&str] = &[
    "live/filesystem.squashfs",
    "casper/filesystem.squashfs",
    "LiveOS/squashfs.img",
];

pub const SQUASHFS_NAME: &str = "filesystem.squashfs";

/// Directories involved in turning a live ISO into a base layer.
#[derive(Debug, Clone)]
pub struct IsoPaths {
    pub iso: PathBuf,
    pub mount_dir: PathBuf,
    pub live_dir: PathBuf,
    pub base_dir: PathBuf,
}

/// Loop-mount the ISO, copy its squashfs image out, unmount, and unpack the
/// image into the base directory.
///
/// The ISO is unmounted on every path once the copy is done or has failed.
pub fn prepare_base_from_iso(
    paths: &IsoPaths,
    mounter: &dyn Mounter,
    table: &MountTable,
    timeout: Duration,
) -> Result<(), RuntimeError> {
    if !paths.iso.is_file() {
        return Err(RuntimeError::InvalidLayer(format!(
            "base ISO not found: {}",
            paths.iso.display()
        )));
    }
    fs::create_dir_all(&paths.mount_dir)?;
    fs::create_dir_all(&paths.live_dir)?;
    let squashfs = paths.live_dir.join(SQUASHFS_NAME);

    if squashfs.is_file() {
        debug!("reusing {}", squashfs.display());
    } else {
        let record = MountRecord::filesystem(
            "iso9660",
            &paths.iso.to_string_lossy(),
            &paths.mount_dir,
        );
        mount_tracked(
            mounter,
            table,
            record,
            &["loop".to_owned(), "ro".to_owned()],
        )?;
        let copied = copy_squashfs(&paths.mount_dir, &squashfs);
        let unmounted = unmount_tracked(mounter, table, &paths.mount_dir, UnmountMode::Normal);
        copied?;
        unmounted?;
    }

    fs::create_dir_all(&paths.base_dir)?;
    info!(
        "unpacking {} into {}",
        squashfs.display(),
        paths.base_dir.display()
    );
    Cmd::new("unsquashfs")
        .args(["-f", "-n", "-d"])
        .arg(paths.base_dir.as_os_str())
        .arg(squashfs.as_os_str())
        .timeout(timeout)
        .run()?;
    Ok(())
}

fn copy_squashfs(mount_dir: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let source = SQUASHFS_CANDIDATES
        .iter()
        .map(|c| mount_dir.join(c))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            RuntimeError::InvalidLayer(format!(
                "no squashfs image found in {}",
                mount_dir.display()
            ))
        })?;
    let partial = dest.with_extension("partial");
    fs::copy(&source, &partial)?;
    fs::rename(&partial, dest)?;
    debug!("copied {} to {}", source.display(), dest.display());
    Ok(())
}

/// Check that a directory given as a ready-made layer can be used.
pub fn validate_layer_dir(dir: &Path) -> Result<(), RuntimeError> {
    if !dir.is_dir() {
        return Err(RuntimeError::InvalidLayer(format!(
            "layer directory not found: {}",
            dir.display()
        )));
    }
    if fs::read_dir(dir)?.next().is_none() {
        warn!("layer directory {} is empty", dir.display());
    }
    Ok(())
}

/// Extract an AppImage with its own `--appimage-extract` and move the
/// resulting `squashfs-root` to `dest`.
///
/// `scratch` must be on the same filesystem as `dest`.
pub fn extract_appimage(
    appimage: &Path,
    scratch: &Path,
    dest: &Path,
    timeout: Duration,
) -> Result<(), RuntimeError> {
    fs::create_dir_all(scratch)?;
    let extracted = scratch.join("squashfs-root");
    if extracted.exists() {
        fs::remove_dir_all(&extracted)?;
    }

    let mut perms = fs::metadata(appimage)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(appimage, perms)?;

    let program = fs::canonicalize(appimage)?;
    Cmd::new(program.to_string_lossy())
        .arg("--appimage-extract")
        .dir(scratch)
        .env("APPIMAGE_EXTRACT_AND_RUN", "0")
        .timeout(timeout)
        .run()?;

    if !extracted.is_dir() {
        return Err(RuntimeError::InvalidLayer(format!(
            "{} produced no squashfs-root",
            appimage.display()
        )));
    }
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&extracted, dest)?;
    info!("extracted {} to {}", appimage.display(), dest.display());
    Ok(())
}
