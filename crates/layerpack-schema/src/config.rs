use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported config_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("app.id must not be empty")]
    EmptyAppId,
    #[error("base layer must set exactly one of base.dir or base.iso")]
    AmbiguousBase,
    #[error("runtime layer must set exactly one of runtime.dir or runtime.url")]
    AmbiguousRuntime,
    #[error("runtime.url requires runtime.sha256")]
    MissingRuntimeChecksum,
    #[error("package '{0}' must set exactly one of url or path")]
    AmbiguousPackageSource(String),
    #[error("package '{0}' is declared more than once")]
    DuplicatePackage(String),
    #[error("invalid sha256 for '{name}': '{value}'")]
    InvalidChecksum { name: String, value: String },
    #[error("fetch.concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("invalid resolve.dlopen_pattern: {0}")]
    InvalidPattern(String),
    #[error("unknown {field} '{value}'")]
    UnknownVariant { field: &'static str, value: String },
}

/// On-disk build configuration, `layerpack.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigV1 {
    pub config_version: u32,
    pub app: AppSection,
    pub base: BaseSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default, rename = "package")]
    pub packages: Vec<PackageEntry>,
    #[serde(default)]
    pub index: IndexSection,
    #[serde(default)]
    pub resolve: ResolveSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub overlay: OverlaySection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppSection {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BaseSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub iso: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageEntry {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IndexSection {
    /// JSON file holding `[{name, url, sha256}]` entries from the package index.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Only index entries whose name is listed here are fetched. Empty means all.
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResolveSection {
    /// Directories, relative to the assembled root, scanned for ELF objects.
    #[serde(default)]
    pub scan: Vec<String>,
    /// Replaces the built-in exclusion policy when non-empty.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Appended to the (built-in or replaced) exclusion policy.
    #[serde(default)]
    pub extra_exclude: Vec<String>,
    #[serde(default)]
    pub dlopen_pattern: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FetchSection {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SandboxSection {
    #[serde(default)]
    pub data_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub install_timeout_secs: Option<u64>,
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OverlaySection {
    #[serde(default)]
    pub driver: Option<String>,
}

pub fn parse_config_str(input: &str) -> Result<ConfigV1, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ConfigV1, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
