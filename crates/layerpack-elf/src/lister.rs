//! Asking the dynamic linker what an object needs.

use crate::{DiscoveryGap, ElfError};
use layerpack_runtime::sandbox::path_inside;
use layerpack_runtime::script::{ldd_script, write_script, MISSING_PREFIX};
use layerpack_runtime::{run_in_chroot, Cmd, RuntimeError, Sandbox};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Libraries reported for a batch of objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Resolved libraries, as paths inside the root.
    pub libraries: BTreeSet<PathBuf>,
    pub gaps: Vec<DiscoveryGap>,
}

impl Listing {
    pub fn merge(&mut self, other: Listing) {
        self.libraries.extend(other.libraries);
        self.gaps.extend(other.gaps);
    }
}

/// Transitive shared-library lookup for objects named by in-root path.
pub trait DependencyLister {
    fn list(&self, objects: &[PathBuf]) -> Result<Listing, ElfError>;
}

/// The path a chrooted process sees for `host`. Paths outside `root` are
/// bound at the same location, so they map to themselves.
pub(crate) fn chroot_view(root: &Path, host: &Path) -> PathBuf {
    path_inside(root, host).unwrap_or_else(|| host.to_path_buf())
}

/// Parse `ldd` output for `object`.
///
/// `name => /path (addr)` and `/path (addr)` lines yield libraries,
/// `name => not found` yields a gap, and everything else (the vDSO,
/// "statically linked") is ignored.
pub fn parse_ldd_output(text: &str, object: &Path) -> Listing {
    let mut listing = Listing::default();
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [name, "=>", "not", "found", ..] => listing.gaps.push(DiscoveryGap {
                object: Some(object.to_path_buf()),
                library: (*name).to_owned(),
            }),
            [_, "=>", path, ..] | [path, ..] if path.starts_with('/') => {
                listing.libraries.insert(PathBuf::from(path));
            }
            _ => {}
        }
    }
    listing
}

/// Parse the output file of the generated ldd script.
pub fn parse_script_output(text: &str) -> Listing {
    let mut listing = Listing::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix(MISSING_PREFIX) {
            let (library, object) = rest.split_once(':').unwrap_or((rest, ""));
            listing.gaps.push(DiscoveryGap {
                object: (!object.is_empty()).then(|| PathBuf::from(object)),
                library: library.to_owned(),
            });
        } else if line.starts_with('/') {
            listing.libraries.insert(PathBuf::from(line));
        }
    }
    listing
}

/// Runs the host's `ldd` on each object under `root`.
///
/// Libraries that resolve under `root` are reported by their in-root path;
/// anything else is what the host linker would load and keeps its path.
#[derive(Debug, Clone)]
pub struct HostLister {
    root: PathBuf,
    timeout: Duration,
}

impl HostLister {
    pub fn new(root: &Path, timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            timeout,
        }
    }

    fn host_path(&self, object: &Path) -> PathBuf {
        match object.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(object),
        }
    }

    fn list_one(&self, object: &Path) -> Result<Listing, ElfError> {
        let host = self.host_path(object);
        let out = Cmd::new("ldd")
            .arg(host.as_os_str())
            .timeout(self.timeout)
            .allow_fail()
            .run()?;
        if !out.success() {
            if out.stdout.contains("not a dynamic executable")
                || out.stderr.contains("not a dynamic executable")
            {
                debug!("{} is not dynamically linked", object.display());
            } else {
                warn!(
                    "ldd failed for {} (code {}), skipping: {}",
                    object.display(),
                    out.code(),
                    out.stderr.trim()
                );
            }
            return Ok(Listing::default());
        }
        let mut listing = parse_ldd_output(&out.stdout, object);
        listing.libraries = listing
            .libraries
            .into_iter()
            .map(|lib| path_inside(&self.root, &lib).unwrap_or(lib))
            .collect();
        Ok(listing)
    }
}

impl DependencyLister for HostLister {
    fn list(&self, objects: &[PathBuf]) -> Result<Listing, ElfError> {
        let mut listing = Listing::default();
        for object in objects {
            match self.list_one(object) {
                Ok(l) => listing.merge(l),
                Err(ElfError::Runtime(e @ (RuntimeError::Spawn { .. } | RuntimeError::Timeout { .. }))) => {
                    return Err(e.into())
                }
                Err(e) => warn!("cannot list {}: {e}", object.display()),
            }
        }
        Ok(listing)
    }
}

/// Runs one generated ldd script for the whole batch inside the root, so
/// the root's own linker and cache decide what resolves.
pub struct SandboxLister<'a> {
    root: PathBuf,
    scripts_dir: PathBuf,
    sandbox: Sandbox<'a>,
    timeout: Duration,
    trace: bool,
}

impl<'a> SandboxLister<'a> {
    pub fn new(
        root: &Path,
        scripts_dir: &Path,
        sandbox: Sandbox<'a>,
        timeout: Duration,
        trace: bool,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            scripts_dir: scripts_dir.to_path_buf(),
            sandbox,
            timeout,
            trace,
        }
    }
}

impl DependencyLister for SandboxLister<'_> {
    fn list(&self, objects: &[PathBuf]) -> Result<Listing, ElfError> {
        if objects.is_empty() {
            return Ok(Listing::default());
        }
        let script = self.scripts_dir.join("ldd.sh");
        let output = self.scripts_dir.join("ldd.out");
        let names: Vec<String> = objects
            .iter()
            .map(|o| o.to_string_lossy().into_owned())
            .collect();
        write_script(
            &script,
            &ldd_script(&names, &chroot_view(&self.root, &output), self.trace),
        )?;
        run_in_chroot(&self.root, &script, &[], self.timeout, self.sandbox)?;
        let listing = parse_script_output(&fs::read_to_string(&output)?);
        debug!(
            "{} object(s) need {} librar(ies), {} gap(s)",
            objects.len(),
            listing.libraries.len(),
            listing.gaps.len()
        );
        Ok(listing)
    }
}
