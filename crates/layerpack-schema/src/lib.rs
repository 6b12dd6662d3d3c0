//! Build configuration and shared data model for layerpack.
//!
//! This crate defines the schema layer: TOML build configuration parsing
//! (`ConfigV1`), its validated form (`BuildConfig`) that is threaded through
//! every component, the `RemoteBlob` declaration consumed by the retrieval
//! pipeline, and the `MountRecord` entry tracked by the mount lifecycle.

pub mod blob;
pub mod config;
pub mod mount;
pub mod normalize;
pub mod types;

pub use blob::{BlobSource, PackageRef, RemoteBlob};
pub use config::{
    parse_config_file, parse_config_str, AppSection, BaseSection, ConfigError, ConfigV1,
    FetchSection, IndexSection, OverlaySection, PackageEntry, ResolveSection, RuntimeSection,
    SandboxSection,
};
pub use mount::MountRecord;
pub use normalize::{
    load_build_config, BaseSource, BuildConfig, FetchSettings, OverlayDriver, ResolveSettings,
    ResolveStrategy, RuntimeSource, SandboxSettings, DEFAULT_DLOPEN_PATTERN, DEFAULT_EXCLUDES,
};
pub use types::{AppId, Sha256Digest};
