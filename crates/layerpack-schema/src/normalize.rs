use crate::blob::RemoteBlob;
use crate::config::{ConfigError, ConfigV1};
use crate::types::{AppId, Sha256Digest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Library basenames assumed to ship with every target runtime.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "ld-linux*",
    "ld64.so",
    "linux-vdso*",
    "linux-gate*",
    "libc.so",
    "libm.so",
    "libdl.so",
    "libpthread.so",
    "librt.so",
    "libutil.so",
    "libresolv.so",
    "libnsl.so",
    "libanl.so",
    "libcrypt.so",
    "libmvec.so",
    "libstdc++.so",
    "libgcc_s.so",
];

/// Matches `<token>.so[.<digits>]*` library names inside printable strings.
pub const DEFAULT_DLOPEN_PATTERN: &str = r"[A-Za-z0-9_+\-]+(?:\.[A-Za-z0-9_+\-]+)*\.so(?:\.[0-9]+)*";

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 600;
const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BaseSource {
    Dir(PathBuf),
    Iso(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeSource {
    None,
    Dir(PathBuf),
    Archive(RemoteBlob),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResolveStrategy {
    /// Run `ldd`/`ldconfig` on the host against host paths.
    Host,
    /// Run them inside the assembled root through a generated script.
    Sandbox,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverlayDriver {
    Kernel,
    Fuse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveSettings {
    pub scan: Vec<String>,
    pub exclude: Vec<String>,
    pub dlopen_pattern: String,
    pub strategy: ResolveStrategy,
}

impl Default for ResolveSettings {
    fn default() -> Self {
        Self {
            scan: Vec::new(),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| (*s).to_owned()).collect(),
            dlopen_pattern: DEFAULT_DLOPEN_PATTERN.to_owned(),
            strategy: ResolveStrategy::Sandbox,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxSettings {
    pub data_dirs: Vec<PathBuf>,
    pub trace: bool,
    pub install_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            data_dirs: Vec::new(),
            trace: false,
            install_timeout: Duration::from_secs(DEFAULT_INSTALL_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }
}

/// Validated build configuration.
///
/// Every relative path is resolved against the directory holding the
/// configuration file. This value is passed explicitly into each component;
/// nothing reads configuration from ambient state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildConfig {
    pub app_id: AppId,
    pub app_version: Option<String>,
    pub base: BaseSource,
    pub runtime: RuntimeSource,
    pub packages: Vec<RemoteBlob>,
    pub index_file: Option<PathBuf>,
    pub index_names: Vec<String>,
    pub resolve: ResolveSettings,
    pub fetch: FetchSettings,
    pub sandbox: SandboxSettings,
    pub overlay_driver: OverlayDriver,
}

impl ConfigV1 {
    /// Validate the configuration and resolve defaults.
    pub fn normalize(&self, config_dir: &Path) -> Result<BuildConfig, ConfigError> {
        if self.config_version != 1 {
            return Err(ConfigError::UnsupportedVersion(self.config_version));
        }

        let app_id = self.app.id.trim();
        if app_id.is_empty() {
            return Err(ConfigError::EmptyAppId);
        }

        let base = match (&self.base.dir, &self.base.iso) {
            (Some(dir), None) => BaseSource::Dir(absolutize(config_dir, dir)),
            (None, Some(iso)) => BaseSource::Iso(absolutize(config_dir, iso)),
            _ => return Err(ConfigError::AmbiguousBase),
        };

        let runtime = match (&self.runtime.dir, &self.runtime.url) {
            (None, None) => RuntimeSource::None,
            (Some(dir), None) => RuntimeSource::Dir(absolutize(config_dir, dir)),
            (None, Some(url)) => {
                let raw = self
                    .runtime
                    .sha256
                    .as_deref()
                    .ok_or(ConfigError::MissingRuntimeChecksum)?;
                let checksum = parse_checksum("runtime", raw)?;
                RuntimeSource::Archive(RemoteBlob::remote("runtime", url, checksum))
            }
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousRuntime),
        };

        let mut packages = Vec::with_capacity(self.packages.len());
        for entry in &self.packages {
            let runtime_clash =
                matches!(&runtime, RuntimeSource::Archive(rt) if rt.name == entry.name);
            if runtime_clash || packages.iter().any(|p: &RemoteBlob| p.name == entry.name) {
                return Err(ConfigError::DuplicatePackage(entry.name.clone()));
            }
            let checksum = parse_checksum(&entry.name, &entry.sha256)?;
            let blob = match (&entry.url, &entry.path) {
                (Some(url), None) => RemoteBlob::remote(&entry.name, url, checksum),
                (None, Some(path)) => {
                    RemoteBlob::local(&entry.name, absolutize(config_dir, path), checksum)
                }
                _ => return Err(ConfigError::AmbiguousPackageSource(entry.name.clone())),
            };
            packages.push(blob);
        }

        let resolve = self.normalize_resolve()?;

        let concurrency = self.fetch.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        let fetch = FetchSettings {
            concurrency,
            timeout: Duration::from_secs(
                self.fetch
                    .timeout_secs
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
        };

        let sandbox = SandboxSettings {
            data_dirs: self
                .sandbox
                .data_dirs
                .iter()
                .map(|d| absolutize(config_dir, d))
                .collect(),
            trace: self.sandbox.trace,
            install_timeout: Duration::from_secs(
                self.sandbox
                    .install_timeout_secs
                    .unwrap_or(DEFAULT_INSTALL_TIMEOUT_SECS),
            ),
            command_timeout: Duration::from_secs(
                self.sandbox
                    .command_timeout_secs
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
        };

        let overlay_driver = match self.overlay.driver.as_deref().map(str::trim) {
            None | Some("kernel") => OverlayDriver::Kernel,
            Some("fuse") => OverlayDriver::Fuse,
            Some(other) => {
                return Err(ConfigError::UnknownVariant {
                    field: "overlay.driver",
                    value: other.to_owned(),
                })
            }
        };

        Ok(BuildConfig {
            app_id: AppId::new(app_id),
            app_version: self.app.version.clone(),
            base,
            runtime,
            packages,
            index_file: self.index.file.as_ref().map(|f| absolutize(config_dir, f)),
            index_names: normalize_string_list(&self.index.names),
            resolve,
            fetch,
            sandbox,
            overlay_driver,
        })
    }

    fn normalize_resolve(&self) -> Result<ResolveSettings, ConfigError> {
        let defaults = ResolveSettings::default();

        let mut exclude = if self.resolve.exclude.is_empty() {
            defaults.exclude
        } else {
            trimmed_in_order(&self.resolve.exclude)
        };
        for extra in trimmed_in_order(&self.resolve.extra_exclude) {
            if !exclude.contains(&extra) {
                exclude.push(extra);
            }
        }

        let dlopen_pattern = self
            .resolve
            .dlopen_pattern
            .clone()
            .unwrap_or(defaults.dlopen_pattern);
        regex::Regex::new(&dlopen_pattern)
            .map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;

        let strategy = match self.resolve.strategy.as_deref().map(str::trim) {
            None | Some("sandbox") => ResolveStrategy::Sandbox,
            Some("host") => ResolveStrategy::Host,
            Some(other) => {
                return Err(ConfigError::UnknownVariant {
                    field: "resolve.strategy",
                    value: other.to_owned(),
                })
            }
        };

        let scan = self
            .resolve
            .scan
            .iter()
            .map(|s| s.trim().trim_start_matches('/').to_owned())
            .collect::<Vec<_>>();

        Ok(ResolveSettings {
            scan: normalize_string_list(&scan),
            exclude,
            dlopen_pattern,
            strategy,
        })
    }
}

/// Parse and normalize a configuration file in one step.
pub fn load_build_config(path: &Path) -> Result<BuildConfig, ConfigError> {
    let raw = crate::config::parse_config_file(path)?;
    let dir = path.parent().unwrap_or(Path::new("."));
    raw.normalize(dir)
}

fn parse_checksum(name: &str, raw: &str) -> Result<Sha256Digest, ConfigError> {
    Sha256Digest::parse(raw).ok_or_else(|| ConfigError::InvalidChecksum {
        name: name.to_owned(),
        value: raw.to_owned(),
    })
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

// Exclusion order is meaningful, so it is deduplicated without sorting.
fn trimmed_in_order(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for v in values {
        let t = v.trim();
        if !t.is_empty() && !out.iter().any(|o| o == t) {
            out.push(t.to_owned());
        }
    }
    out
}

fn normalize_string_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn minimal(extra: &str) -> String {
        format!(
            r#"
config_version = 1
[app]
id = "org.example.app"
[base]
dir = "base"
{extra}
"#
        )
    }

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let config = parse_config_str(&minimal(""))
            .unwrap()
            .normalize(Path::new("/etc/layerpack"))
            .unwrap();
        assert_eq!(
            config.base,
            BaseSource::Dir(PathBuf::from("/etc/layerpack/base"))
        );
        assert_eq!(config.runtime, RuntimeSource::None);
    }

    #[test]
    fn applies_defaults() {
        let config = parse_config_str(&minimal(""))
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap();
        assert_eq!(config.fetch.concurrency, 4);
        assert_eq!(config.resolve.strategy, ResolveStrategy::Sandbox);
        assert_eq!(config.overlay_driver, OverlayDriver::Kernel);
        assert!(config.resolve.exclude.iter().any(|e| e == "libc.so"));
        assert!(config.resolve.scan.is_empty());
    }

    #[test]
    fn extra_excludes_append_in_order() {
        let config = parse_config_str(&minimal(
            "[resolve]\nexclude = [\"libc.so\", \"libm.so\"]\nextra_exclude = [\"libGL.so\", \"libc.so\"]",
        ))
        .unwrap()
        .normalize(Path::new("/"))
        .unwrap();
        assert_eq!(config.resolve.exclude, vec!["libc.so", "libm.so", "libGL.so"]);
    }

    #[test]
    fn rejects_empty_app_id() {
        let input = r#"
config_version = 1
[app]
id = "  "
[base]
dir = "/base"
"#;
        let err = parse_config_str(input)
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAppId));
    }

    #[test]
    fn rejects_both_base_sources() {
        let input = r#"
config_version = 1
[app]
id = "x"
[base]
dir = "/base"
iso = "/base.iso"
"#;
        let err = parse_config_str(input)
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousBase));
    }

    #[test]
    fn runtime_url_requires_checksum() {
        let err = parse_config_str(&minimal("[runtime]\nurl = \"https://e/rt.tar\""))
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRuntimeChecksum));
    }

    #[test]
    fn runtime_archive_becomes_blob() {
        let config = parse_config_str(&minimal(&format!(
            "[runtime]\nurl = \"https://e/rt.tar\"\nsha256 = \"{SHA_A}\""
        )))
        .unwrap()
        .normalize(Path::new("/"))
        .unwrap();
        match config.runtime {
            RuntimeSource::Archive(blob) => {
                assert_eq!(blob.file_name(), "rt.tar");
                assert_eq!(blob.checksum.as_str(), SHA_A);
            }
            other => panic!("expected archive runtime, got {other:?}"),
        }
    }

    #[test]
    fn package_needs_exactly_one_source() {
        let err = parse_config_str(&minimal(&format!(
            "[[package]]\nname = \"p\"\nsha256 = \"{SHA_A}\""
        )))
        .unwrap()
        .normalize(Path::new("/"))
        .unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousPackageSource(_)));
    }

    #[test]
    fn rejects_duplicate_package_names() {
        let err = parse_config_str(&minimal(&format!(
            "[[package]]\nname = \"tool\"\nurl = \"https://m1/tool.deb\"\nsha256 = \"{SHA_A}\"\n\
             [[package]]\nname = \"tool\"\nurl = \"https://m2/tool.deb\"\nsha256 = \"{SHA_A}\""
        )))
        .unwrap()
        .normalize(Path::new("/"))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePackage(ref n) if n == "tool"));
    }

    #[test]
    fn rejects_malformed_checksum() {
        let err = parse_config_str(&minimal(
            "[[package]]\nname = \"p\"\nurl = \"https://e/p.deb\"\nsha256 = \"xyz\"",
        ))
        .unwrap()
        .normalize(Path::new("/"))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidChecksum { .. }));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = parse_config_str(&minimal("[fetch]\nconcurrency = 0"))
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroConcurrency));
    }

    #[test]
    fn rejects_invalid_dlopen_pattern() {
        let err = parse_config_str(&minimal("[resolve]\ndlopen_pattern = \"(unclosed\""))
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern(_)));
    }

    #[test]
    fn rejects_unknown_strategy() {
        let err = parse_config_str(&minimal("[resolve]\nstrategy = \"magic\""))
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVariant { .. }));
    }

    #[test]
    fn scan_paths_are_made_relative() {
        let config = parse_config_str(&minimal("[resolve]\nscan = [\"/opt/apps\", \"usr/bin\"]"))
            .unwrap()
            .normalize(Path::new("/"))
            .unwrap();
        assert_eq!(config.resolve.scan, vec!["opt/apps", "usr/bin"]);
    }

    #[test]
    fn load_build_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layerpack.toml");
        std::fs::write(&path, minimal("")).unwrap();
        let config = load_build_config(&path).unwrap();
        assert_eq!(config.base, BaseSource::Dir(dir.path().join("base")));
    }
}
