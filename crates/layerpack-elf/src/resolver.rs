use crate::discover::discover;
use crate::dlopen::{scan_entry_point, LibraryNamePattern};
use crate::exclude::ExclusionPolicy;
use crate::libcache::LibraryCache;
use crate::lister::DependencyLister;
use crate::objects::{ElfObjectSet, Markers};
use crate::{DiscoveryGap, ElfError};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of one resolver run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolution {
    /// Libraries to materialize, by in-root path.
    pub closure: BTreeMap<PathBuf, Markers>,
    /// Number of ELF objects found by discovery.
    pub discovered: usize,
    /// Discovered programs that call `dlopen`.
    pub entry_points: Vec<PathBuf>,
    pub dlopen_tokens: BTreeSet<String>,
    pub excluded: Vec<PathBuf>,
    pub gaps: Vec<DiscoveryGap>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.closure.is_empty()
    }
}

/// Discover, then mark needed and dlopen-referenced libraries, then apply
/// the exclusion policy.
///
/// Needed libraries are unioned across every discovered object rather than
/// tracked per binary: the bundle ships a single library directory that has
/// to satisfy all of them.
pub struct Resolver<'a> {
    lister: &'a dyn DependencyLister,
    cache: &'a dyn LibraryCache,
    policy: ExclusionPolicy,
    pattern: LibraryNamePattern,
}

impl<'a> Resolver<'a> {
    pub fn new(
        lister: &'a dyn DependencyLister,
        cache: &'a dyn LibraryCache,
        policy: ExclusionPolicy,
        pattern: LibraryNamePattern,
    ) -> Self {
        Self {
            lister,
            cache,
            policy,
            pattern,
        }
    }

    /// Resolve the closure of the ELF objects found under `scan` in
    /// `scan_root`. The lister decides which root libraries resolve in.
    pub fn resolve(&self, scan_root: &Path, scan: &[String]) -> Result<Resolution, ElfError> {
        let set = discover(scan_root, scan)?;
        self.resolve_set(scan_root, set)
    }

    /// Run the marking and exclusion steps on an already discovered set.
    pub fn resolve_set(
        &self,
        scan_root: &Path,
        mut set: ElfObjectSet,
    ) -> Result<Resolution, ElfError> {
        let mut resolution = Resolution {
            discovered: set.len(),
            ..Resolution::default()
        };
        if set.is_empty() {
            info!("no ELF objects under {}, nothing to resolve", scan_root.display());
            return Ok(resolution);
        }
        let objects: Vec<PathBuf> = set.paths().cloned().collect();

        let listing = self.lister.list(&objects)?;
        debug!("mark-needed: {} librar(ies)", listing.libraries.len());
        for lib in listing.libraries {
            set.mark_needed(lib);
        }
        resolution.gaps.extend(listing.gaps);

        let mut loaded = Vec::new();
        for object in &objects {
            let bytes = match fs::read(in_root(scan_root, object)) {
                Ok(b) => b,
                Err(e) => {
                    warn!("cannot read {}: {e}", object.display());
                    continue;
                }
            };
            let Some(tokens) = scan_entry_point(&bytes, &self.pattern) else {
                continue;
            };
            resolution.entry_points.push(object.clone());
            for token in tokens {
                match self.cache.lookup(&token) {
                    Some(path) => {
                        debug!("{} loads {token} ({})", object.display(), path.display());
                        if set.mark_dlopen(path.clone()) {
                            loaded.push(path);
                        }
                    }
                    None => resolution.gaps.push(DiscoveryGap {
                        object: Some(object.clone()),
                        library: token.clone(),
                    }),
                }
                resolution.dlopen_tokens.insert(token);
            }
        }
        loaded.sort();
        loaded.dedup();
        if !loaded.is_empty() {
            let listing = self.lister.list(&loaded)?;
            for lib in listing.libraries {
                set.mark_needed(lib);
            }
            resolution.gaps.extend(listing.gaps);
        }

        resolution.excluded = set.apply_exclusion(&self.policy);
        resolution.closure = set.closure();

        resolution.gaps.sort();
        resolution.gaps.dedup();
        for gap in &resolution.gaps {
            warn!("unresolved library: {gap}");
        }
        info!(
            "closure: {} librar(ies) from {} object(s), {} excluded, {} gap(s)",
            resolution.closure.len(),
            resolution.discovered,
            resolution.excluded.len(),
            resolution.gaps.len()
        );
        Ok(resolution)
    }
}

fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}
