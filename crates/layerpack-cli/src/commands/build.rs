use super::{json_pretty, load_config, maybe_spinner, spin_fail, spin_ok, EXIT_SUCCESS};
use layerpack_core::{install_signal_handler, Engine};
use std::path::Path;

pub fn run(workdir: &Path, config_path: &Path, trace: bool, json: bool) -> Result<u8, String> {
    let mut config = load_config(config_path)?;
    config.sandbox.trace |= trace;
    let engine = Engine::new(workdir, config);
    install_signal_handler(engine.cancel_token());

    let pb = maybe_spinner(json, "assembling bundle...");
    let report = match engine.build() {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "bundle assembled");
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("app: {}", report.app_id);
    if !report.ran.is_empty() {
        println!("ran: {}", report.ran.join(", "));
    }
    if !report.skipped.is_empty() {
        println!("skipped: {}", report.skipped.join(", "));
    }
    for name in &report.fetch.refetched {
        println!("re-fetched after checksum mismatch: {name}");
    }
    println!("libraries in closure: {}", report.closure_len);
    if let Some(resolution) = &report.resolution {
        for gap in &resolution.gaps {
            println!("unresolved: {gap}");
        }
    }
    for ignored in &report.ignored {
        println!("warning: {}: {}", ignored.path.display(), ignored.message);
    }
    println!("bundle: {}", report.bundle_dir.display());
    Ok(EXIT_SUCCESS)
}
