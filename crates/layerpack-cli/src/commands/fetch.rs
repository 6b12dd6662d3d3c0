use super::{json_pretty, load_config, maybe_spinner, spin_fail, spin_ok, EXIT_SUCCESS};
use layerpack_core::{install_signal_handler, Engine};
use std::path::Path;

pub fn run(workdir: &Path, config_path: &Path, json: bool) -> Result<u8, String> {
    let config = load_config(config_path)?;
    let engine = Engine::new(workdir, config);
    install_signal_handler(engine.cancel_token());

    let pb = maybe_spinner(json, "fetching packages...");
    let summary = match engine.fetch() {
        Ok(s) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("{} package(s) verified", s.fetched.len()));
            }
            s
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "fetch failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&summary)?);
    } else {
        for (name, path) in &summary.fetched {
            let note = if summary.refetched.contains(name) {
                " (re-fetched)"
            } else {
                ""
            };
            println!("{name}: {}{note}", path.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
