pub mod build;
pub mod clean;
pub mod completions;
pub mod deps;
pub mod doctor;
pub mod fetch;
pub mod man_pages;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use layerpack_schema::{load_build_config, BuildConfig};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_WORKDIR_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn load_config(path: &Path) -> Result<BuildConfig, String> {
    let config =
        load_build_config(path).map_err(|e| format!("config error: {}: {e}", path.display()))?;
    tracing::debug!(
        "loaded {} for {} ({} package(s))",
        path.display(),
        config.app_id,
        config.packages.len()
    );
    Ok(config)
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// A spinner only when a human is reading the output.
pub fn maybe_spinner(json: bool, msg: &str) -> Option<ProgressBar> {
    if json {
        None
    } else {
        Some(spinner(msg))
    }
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_stage(stage: &str, done: bool) -> String {
    use console::Style;
    if done {
        Style::new().green().apply_to(stage).to_string()
    } else {
        Style::new().yellow().apply_to(stage).to_string()
    }
}
