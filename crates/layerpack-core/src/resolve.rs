//! Resolver wiring shared by the build pipeline and `layerpack deps`.

use crate::CoreError;
use layerpack_elf::{
    discover, ExclusionPolicy, HostLister, LdconfigCache, LibraryNamePattern, OnDemandCache,
    Resolution, Resolver, SandboxLister,
};
use layerpack_runtime::Sandbox;
use layerpack_schema::{ResolveSettings, ResolveStrategy};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Where a resolver run looks.
#[derive(Debug, Clone, Copy)]
pub struct ResolveTarget<'a> {
    /// Tree scanned for ELF objects. Discovered paths are relative to it.
    pub scan_root: &'a Path,
    /// Root whose linker decides where libraries resolve.
    pub lister_root: &'a Path,
    /// Where generated scripts and their output go.
    pub scripts_dir: &'a Path,
}

/// Discover the ELF objects of `target` and compute their closure with
/// the lister and linker cache `settings.strategy` selects.
///
/// `sandbox` is only used by the sandbox strategy.
pub fn resolve_tree(
    target: ResolveTarget<'_>,
    settings: &ResolveSettings,
    sandbox: Sandbox<'_>,
    timeout: Duration,
    trace: bool,
) -> Result<Resolution, CoreError> {
    let policy = ExclusionPolicy::new(settings.exclude.clone());
    let pattern = LibraryNamePattern::new(&settings.dlopen_pattern)?;
    let set = discover(target.scan_root, &settings.scan)?;
    info!(
        "resolving {} ELF object(s) under {} ({:?} strategy)",
        set.len(),
        target.scan_root.display(),
        settings.strategy
    );

    let resolution = match settings.strategy {
        ResolveStrategy::Host => {
            let lister = HostLister::new(target.lister_root, timeout);
            let cache = OnDemandCache::new(|| LdconfigCache::load_host(timeout));
            Resolver::new(&lister, &cache, policy, pattern).resolve_set(target.scan_root, set)?
        }
        ResolveStrategy::Sandbox => {
            let lister = SandboxLister::new(
                target.lister_root,
                target.scripts_dir,
                sandbox,
                timeout,
                trace,
            );
            let cache = OnDemandCache::new(|| {
                LdconfigCache::load_in_root(
                    target.lister_root,
                    target.scripts_dir,
                    sandbox,
                    timeout,
                    trace,
                )
            });
            Resolver::new(&lister, &cache, policy, pattern).resolve_set(target.scan_root, set)?
        }
    };
    Ok(resolution)
}
