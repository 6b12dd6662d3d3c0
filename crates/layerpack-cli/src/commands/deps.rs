use super::{json_pretty, EXIT_SUCCESS};
use layerpack_core::{resolve_tree, ResolveTarget};
use layerpack_runtime::exec::DEFAULT_TIMEOUT;
use layerpack_runtime::{MountTable, Sandbox, SystemMounter};
use layerpack_schema::{OverlayDriver, ResolveSettings, ResolveStrategy};
use std::path::Path;

pub struct DepsOptions {
    pub scan: Vec<String>,
    pub exclude: Vec<String>,
    pub sandbox: bool,
    pub trace: bool,
}

impl DepsOptions {
    fn settings(self) -> ResolveSettings {
        let mut settings = ResolveSettings {
            scan: self.scan,
            strategy: if self.sandbox {
                ResolveStrategy::Sandbox
            } else {
                ResolveStrategy::Host
            },
            ..ResolveSettings::default()
        };
        settings.exclude.extend(self.exclude);
        settings
    }
}

pub fn run(root: &Path, options: DepsOptions, json: bool) -> Result<u8, String> {
    if !root.is_dir() {
        return Err(format!("{} is not a directory", root.display()));
    }
    let trace = options.trace;
    let settings = options.settings();
    let scripts = tempfile::tempdir().map_err(|e| format!("failed to create temp dir: {e}"))?;

    let mounter = SystemMounter::new(OverlayDriver::Kernel, DEFAULT_TIMEOUT);
    let table = MountTable::new();
    let target = ResolveTarget {
        scan_root: root,
        lister_root: root,
        scripts_dir: scripts.path(),
    };
    let resolution = resolve_tree(
        target,
        &settings,
        Sandbox::new(&mounter, &table),
        DEFAULT_TIMEOUT,
        trace,
    )
    .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&resolution)?);
        return Ok(EXIT_SUCCESS);
    }
    for (path, markers) in &resolution.closure {
        let why = match (markers.needed, markers.dlopen) {
            (true, true) => "needed, dlopen",
            (false, true) => "dlopen",
            _ => "needed",
        };
        println!("{}  [{why}]", path.display());
    }
    for gap in &resolution.gaps {
        println!("unresolved: {gap}");
    }
    println!(
        "{} librar{} from {} ELF object(s), {} excluded",
        resolution.closure.len(),
        if resolution.closure.len() == 1 { "y" } else { "ies" },
        resolution.discovered,
        resolution.excluded.len()
    );
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerpack_schema::DEFAULT_EXCLUDES;

    #[test]
    fn extra_excludes_extend_the_defaults() {
        let settings = DepsOptions {
            scan: vec!["usr/bin".to_owned()],
            exclude: vec!["libfoo.so".to_owned()],
            sandbox: false,
            trace: false,
        }
        .settings();
        assert_eq!(settings.strategy, ResolveStrategy::Host);
        assert_eq!(settings.scan, vec!["usr/bin"]);
        assert_eq!(settings.exclude.len(), DEFAULT_EXCLUDES.len() + 1);
        assert_eq!(settings.exclude.last().map(String::as_str), Some("libfoo.so"));
    }

    #[test]
    fn sandbox_flag_selects_sandbox_strategy() {
        let settings = DepsOptions {
            scan: Vec::new(),
            exclude: Vec::new(),
            sandbox: true,
            trace: false,
        }
        .settings();
        assert_eq!(settings.strategy, ResolveStrategy::Sandbox);
    }
}
