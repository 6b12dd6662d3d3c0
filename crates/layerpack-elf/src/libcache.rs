use crate::lister::chroot_view;
use crate::ElfError;
use layerpack_runtime::script::{ldconfig_script, write_script};
use layerpack_runtime::{run_in_chroot, Cmd, RuntimeError, Sandbox};
use std::cell::OnceCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Maps a library basename token to the path the linker would load.
pub trait LibraryCache {
    fn lookup(&self, token: &str) -> Option<PathBuf>;
}

/// Entries parsed from `ldconfig -p`, in cache order.
#[derive(Debug, Clone, Default)]
pub struct LdconfigCache {
    entries: Vec<(String, PathBuf)>,
}

impl LdconfigCache {
    /// Parse `ldconfig -p` output:
    ///
    /// ```text
    /// 1234 libs found in cache `/etc/ld.so.cache'
    ///     libz.so.1 (libc6,x86-64) => /lib/x86_64-linux-gnu/libz.so.1
    /// ```
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let (left, path) = line.split_once(" => ")?;
                let name = left.split_whitespace().next()?;
                let path = path.trim();
                path.starts_with('/')
                    .then(|| (name.to_owned(), PathBuf::from(path)))
            })
            .collect();
        Self { entries }
    }

    /// Cache of the host linker.
    pub fn load_host(timeout: Duration) -> Result<Self, ElfError> {
        let out = match Cmd::new("ldconfig").arg("-p").timeout(timeout).run() {
            Err(RuntimeError::Spawn { .. }) => {
                Cmd::new("/sbin/ldconfig").arg("-p").timeout(timeout).run()?
            }
            other => other?,
        };
        let cache = Self::parse(&out.stdout);
        debug!("host linker cache has {} entries", cache.len());
        Ok(cache)
    }

    /// Cache of the linker inside `root`, dumped by a script run in the
    /// sandbox. `scripts_dir` holds the script and its output.
    pub fn load_in_root(
        root: &Path,
        scripts_dir: &Path,
        sandbox: Sandbox<'_>,
        timeout: Duration,
        trace: bool,
    ) -> Result<Self, ElfError> {
        let script = scripts_dir.join("ldconfig.sh");
        let output = scripts_dir.join("ldconfig.out");
        write_script(&script, &ldconfig_script(&chroot_view(root, &output), trace))?;
        run_in_chroot(root, &script, &[], timeout, sandbox)?;
        let cache = Self::parse(&fs::read_to_string(&output)?);
        debug!("linker cache in {} has {} entries", root.display(), cache.len());
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LibraryCache for LdconfigCache {
    /// Exact name first, then the first entry that is a versioned form of
    /// the token (`libfoo.so` finds `libfoo.so.1`).
    fn lookup(&self, token: &str) -> Option<PathBuf> {
        self.entries
            .iter()
            .find(|(name, _)| name == token)
            .or_else(|| {
                self.entries.iter().find(|(name, _)| {
                    name.strip_prefix(token)
                        .is_some_and(|rest| rest.starts_with('.'))
                })
            })
            .map(|(_, path)| path.clone())
    }
}

/// Loads its cache on the first lookup. A failed load is logged once and
/// behaves as an empty cache, so every token becomes a discovery gap.
pub struct OnDemandCache<F> {
    load: F,
    cache: OnceCell<LdconfigCache>,
}

impl<F> OnDemandCache<F>
where
    F: Fn() -> Result<LdconfigCache, ElfError>,
{
    pub fn new(load: F) -> Self {
        Self {
            load,
            cache: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.get().is_some()
    }

    fn get(&self) -> &LdconfigCache {
        self.cache.get_or_init(|| {
            (self.load)().unwrap_or_else(|e| {
                warn!("linker cache unavailable: {e}");
                LdconfigCache::default()
            })
        })
    }
}

impl<F> LibraryCache for OnDemandCache<F>
where
    F: Fn() -> Result<LdconfigCache, ElfError>,
{
    fn lookup(&self, token: &str) -> Option<PathBuf> {
        self.get().lookup(token)
    }
}
