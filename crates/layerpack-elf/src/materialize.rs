//! Copying a resolved closure out of the assembled root into the bundle.

use crate::objects::Markers;
use crate::ElfError;
use layerpack_runtime::Ignored;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{chown, lchown, symlink, MetadataExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// What [`materialize`] did, by destination in-root path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializeReport {
    pub copied: Vec<PathBuf>,
    pub linked: Vec<PathBuf>,
    /// Closure entries absent from the source root.
    pub skipped: Vec<PathBuf>,
    /// Ownership that could not be carried over.
    pub ignored: Vec<Ignored>,
}

/// Map `/usr/lib/...` to `/lib/...`. No other path is touched.
pub fn remap(path: &Path) -> PathBuf {
    match path.strip_prefix("/usr/lib") {
        Ok(rest) => Path::new("/lib").join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Copy every closure entry found under `source_root` into `dest_root`.
///
/// Regular files keep their mode and, where permitted, their owner.
/// Symlinks are recreated with a target relative to the link and the
/// target itself is materialized too, so no link in the bundle dangles.
pub fn materialize(
    closure: &BTreeMap<PathBuf, Markers>,
    source_root: &Path,
    dest_root: &Path,
) -> Result<MaterializeReport, ElfError> {
    let mut report = MaterializeReport::default();
    let mut queue: VecDeque<PathBuf> = closure.keys().cloned().collect();
    let mut seen: BTreeSet<PathBuf> = queue.iter().cloned().collect();

    while let Some(path) = queue.pop_front() {
        let src = in_root(source_root, &path);
        let meta = match src.symlink_metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not in source root, skipping", path.display());
                report.skipped.push(path);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let dest_path = remap(&path);
        let dest = in_root(dest_root, &dest_path);
        if dest.symlink_metadata().is_ok() {
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(&src)?;
            let link_dir = path.parent().unwrap_or(Path::new("/"));
            let absolute = normalize(&link_dir.join(&target));
            let dest_dir = dest_path.parent().unwrap_or(Path::new("/"));
            let relative = relativize(&remap(&absolute), dest_dir);
            symlink(&relative, &dest)?;
            if let Err(e) = lchown(&dest, Some(meta.uid()), Some(meta.gid())) {
                report.ignored.push(Ignored::new(&dest_path, e));
            }
            debug!("linked {} -> {}", dest_path.display(), relative.display());
            report.linked.push(dest_path);
            if seen.insert(absolute.clone()) {
                queue.push_back(absolute);
            }
        } else if file_type.is_file() {
            fs::copy(&src, &dest)?;
            if let Err(e) = chown(&dest, Some(meta.uid()), Some(meta.gid())) {
                report.ignored.push(Ignored::new(&dest_path, e));
            }
            report.copied.push(dest_path);
        } else {
            warn!("{} is neither a file nor a symlink, skipping", path.display());
            report.skipped.push(path);
        }
    }

    info!(
        "materialized {} file(s) and {} link(s) into {}",
        report.copied.len(),
        report.linked.len(),
        dest_root.display()
    );
    if !report.ignored.is_empty() {
        warn!(
            "ownership not preserved for {} entr(ies)",
            report.ignored.len()
        );
    }
    Ok(report)
}

fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

/// Lexically resolve `.` and `..` in an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// `target` as seen from directory `from`; both absolute and normalized.
fn relativize(target: &Path, from: &Path) -> PathBuf {
    let t: Vec<Component> = target.components().collect();
    let f: Vec<Component> = from.components().collect();
    let common = t.iter().zip(&f).take_while(|(a, b)| a == b).count();
    let mut rel = PathBuf::new();
    for _ in common..f.len() {
        rel.push("..");
    }
    for c in &t[common..] {
        rel.push(c);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}
