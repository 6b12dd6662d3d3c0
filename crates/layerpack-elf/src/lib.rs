//! Shared-library closure resolution for layerpack bundles.
//!
//! Discovery classifies ELF objects under a tree, listers ask the dynamic
//! linker what each object needs, string scanning recovers libraries an
//! entry point loads with `dlopen`, and an exclusion policy drops libraries
//! the target runtime already ships. The resulting closure is copied into
//! the bundle by [`materialize`].

pub mod discover;
pub mod dlopen;
pub mod exclude;
pub mod libcache;
pub mod lister;
pub mod materialize;
pub mod objects;
pub mod resolver;

pub use discover::{discover, is_elf, ELF_MAGIC, MIN_ELF_SIZE};
pub use dlopen::{
    is_entry_point, printable_strings, references_dlopen, scan_entry_point, LibraryNamePattern,
};
pub use exclude::ExclusionPolicy;
pub use libcache::{LdconfigCache, LibraryCache, OnDemandCache};
pub use lister::{
    parse_ldd_output, parse_script_output, DependencyLister, HostLister, Listing, SandboxLister,
};
pub use materialize::{materialize, remap, MaterializeReport};
pub use objects::{ElfObjectSet, Markers};
pub use resolver::{Resolution, Resolver};

use layerpack_runtime::RuntimeError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walking {path}: {message}")]
    Walk { path: String, message: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("invalid library name pattern: {0}")]
    InvalidPattern(String),
}

/// A library that could not be resolved. Not an error: the closure is
/// still produced without it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DiscoveryGap {
    /// The object that asked for the library, when known.
    pub object: Option<PathBuf>,
    pub library: String,
}

impl fmt::Display for DiscoveryGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(o) => write!(f, "{} (needed by {})", self.library, o.display()),
            None => f.write_str(&self.library),
        }
    }
}
