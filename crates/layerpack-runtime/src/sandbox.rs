//! Running generated scripts inside a composed root.

use crate::exec::Cmd;
use crate::mounts::{mount_tracked, unmount_tracked, MountTable, Mounter, UnmountMode};
use crate::{Ignored, RuntimeError};
use layerpack_schema::MountRecord;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Mount machinery a sandbox session works through.
#[derive(Clone, Copy)]
pub struct Sandbox<'a> {
    pub mounter: &'a dyn Mounter,
    pub table: &'a MountTable,
}

impl<'a> Sandbox<'a> {
    pub fn new(mounter: &'a dyn Mounter, table: &'a MountTable) -> Self {
        Self { mounter, table }
    }
}

/// Map a host path to where it appears inside `root`.
///
/// `..` is resolved lexically and never climbs above `root`.
pub fn in_root_target(root: &Path, host: &Path) -> PathBuf {
    let mut rel = PathBuf::new();
    for component in host.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::ParentDir => {
                rel.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    root.join(rel)
}

/// The path a process chrooted into `root` sees for `host_path`, which
/// must lie under `root`.
pub fn path_inside(root: &Path, host_path: &Path) -> Option<PathBuf> {
    host_path
        .strip_prefix(root)
        .ok()
        .map(|rel| Path::new("/").join(rel))
}

/// Bind mounts made for one script run.
///
/// Binds are released in reverse order when the session is closed or
/// dropped, including on error and timeout paths.
pub struct SandboxSession<'a> {
    root: PathBuf,
    sandbox: Sandbox<'a>,
    bound: Vec<Bound>,
}

struct Bound {
    target: PathBuf,
    /// Topmost directory created for the bind, removed again once empty.
    created: Option<PathBuf>,
}

impl<'a> SandboxSession<'a> {
    pub fn open(root: &Path, sandbox: Sandbox<'a>) -> Result<Self, RuntimeError> {
        if !root.is_dir() {
            return Err(RuntimeError::InvalidLayer(format!(
                "sandbox root does not exist: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            sandbox,
            bound: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Expose `host_dir` at the same path inside the root and return that
    /// in-root path. Directories already under the root need no bind.
    pub fn bind(&mut self, host_dir: &Path) -> Result<PathBuf, RuntimeError> {
        if let Some(inside) = path_inside(&self.root, host_dir) {
            return Ok(inside);
        }
        let target = in_root_target(&self.root, host_dir);
        if self.sandbox.table.contains(&target) {
            debug!("{} already bound", target.display());
            return Ok(path_inside(&self.root, &target).unwrap_or(target));
        }
        let created = first_missing_ancestor(&self.root, &target);
        fs::create_dir_all(&target)?;
        let record = MountRecord::bind(host_dir, &target);
        if let Err(e) = mount_tracked(self.sandbox.mounter, self.sandbox.table, record, &[]) {
            remove_created(&target, created.as_deref());
            return Err(e);
        }
        self.bound.push(Bound {
            target: target.clone(),
            created,
        });

        let mut perms = fs::metadata(&target)?.permissions();
        perms.set_mode(perms.mode() | 0o100);
        if let Err(e) = fs::set_permissions(&target, perms) {
            warn!("cannot mark {} executable: {e}", target.display());
        }
        Ok(path_inside(&self.root, &target).unwrap_or(target))
    }

    /// Execute `script` (an in-root path) chrooted into the root and return
    /// its stdout.
    pub fn run(&self, script: &Path, timeout: Duration) -> Result<String, RuntimeError> {
        let host_script = in_root_target(&self.root, script);
        let mut perms = fs::metadata(&host_script)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&host_script, perms)?;

        info!("running {} in {}", script.display(), self.root.display());
        let out = Cmd::new(script.to_string_lossy())
            .chroot(&self.root)
            .env("LC_ALL", "C")
            .timeout(timeout)
            .run();
        match out {
            Ok(out) => Ok(out.stdout),
            Err(RuntimeError::CommandFailed { code, stderr, .. }) => {
                Err(RuntimeError::ScriptFailed { code, stderr })
            }
            Err(e) => Err(e),
        }
    }

    /// Release all binds, newest first.
    pub fn close(mut self) -> Vec<Ignored> {
        self.release()
    }

    fn release(&mut self) -> Vec<Ignored> {
        let mut ignored = Vec::new();
        let Sandbox { mounter, table } = self.sandbox;
        while let Some(Bound { target, created }) = self.bound.pop() {
            let result = match unmount_tracked(mounter, table, &target, UnmountMode::Normal) {
                Err(RuntimeError::Busy(_)) => {
                    unmount_tracked(mounter, table, &target, UnmountMode::Lazy)
                }
                other => other,
            };
            match result {
                Ok(()) => remove_created(&target, created.as_deref()),
                Err(e) => ignored.push(Ignored::new(&target, e)),
            }
        }
        ignored
    }
}

impl Drop for SandboxSession<'_> {
    fn drop(&mut self) {
        for ignored in self.release() {
            warn!("sandbox teardown: {ignored}");
        }
    }
}

fn first_missing_ancestor(root: &Path, target: &Path) -> Option<PathBuf> {
    target
        .ancestors()
        .take_while(|p| *p != root)
        .filter(|p| !p.exists())
        .last()
        .map(Path::to_path_buf)
}

/// Remove the empty directories from `target` up to `created`.
fn remove_created(target: &Path, created: Option<&Path>) {
    let Some(top) = created else { return };
    for dir in target.ancestors() {
        if fs::remove_dir(dir).is_err() || dir == top {
            break;
        }
    }
}

/// Run `script` inside `root` with each of `data_dirs` bound in.
///
/// When the script lives outside the root its parent directory is bound as
/// well. All binds are released before returning, whatever the outcome.
pub fn run_in_chroot(
    root: &Path,
    script: &Path,
    data_dirs: &[PathBuf],
    timeout: Duration,
    sandbox: Sandbox<'_>,
) -> Result<String, RuntimeError> {
    let mut session = SandboxSession::open(root, sandbox)?;
    for dir in data_dirs {
        session.bind(dir)?;
    }

    let in_root_script = match path_inside(root, script) {
        Some(p) => p,
        None => {
            let parent = script.parent().ok_or_else(|| {
                RuntimeError::InvalidLayer(format!("script has no parent: {}", script.display()))
            })?;
            let bound = session.bind(parent)?;
            let name = script.file_name().ok_or_else(|| {
                RuntimeError::InvalidLayer(format!("script has no name: {}", script.display()))
            })?;
            bound.join(name)
        }
    };

    let result = session.run(&in_root_script, timeout);
    for ignored in session.close() {
        warn!("sandbox teardown: {ignored}");
    }
    result
}
