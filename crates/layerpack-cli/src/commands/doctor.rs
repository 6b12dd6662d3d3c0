use super::{EXIT_FAILURE, EXIT_SUCCESS};
use layerpack_core::{workdir_status, WorkdirLock};
use layerpack_runtime::{check_host_prereqs, format_missing, running_as_root, HostNeeds};
use layerpack_schema::OverlayDriver;
use layerpack_store::WorkLayout;
use std::path::Path;

pub fn run(workdir: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);

    if workdir.exists() {
        checks.push(Check::pass("workdir_exists", "Working directory exists"));
        check_workdir(workdir, &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "workdir_exists",
            "Working directory not initialized (will be created on first build)",
        ));
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = check_host_prereqs(HostNeeds::default());
    if missing.is_empty() {
        checks.push(Check::pass("host_tools", "Host tools available"));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "host_tools",
            &format!("Missing prerequisites: {}", format_missing(&missing)),
        ));
    }

    let optional = |needs: HostNeeds| -> Vec<_> {
        check_host_prereqs(needs)
            .into_iter()
            .filter(|m| !missing.iter().any(|k| k.name == m.name))
            .collect()
    };
    let fuse_missing = optional(HostNeeds {
        driver: OverlayDriver::Fuse,
        ..HostNeeds::default()
    });
    if fuse_missing.is_empty() {
        checks.push(Check::pass("fuse_tools", "fuse-overlayfs driver available"));
    } else {
        checks.push(Check::info(
            "fuse_tools",
            &format!(
                "fuse-overlayfs driver unavailable: {}",
                format_missing(&fuse_missing)
            ),
        ));
    }

    let iso_missing = optional(HostNeeds {
        iso_base: true,
        ..HostNeeds::default()
    });
    if iso_missing.is_empty() {
        checks.push(Check::pass("iso_tools", "Live ISO base layers supported"));
    } else {
        checks.push(Check::info(
            "iso_tools",
            &format!(
                "live ISO base layers unavailable: {}",
                format_missing(&iso_missing)
            ),
        ));
    }

    if running_as_root() {
        checks.push(Check::pass("root", "Running as root"));
    } else {
        checks.push(Check::warn(
            "root",
            "Not running as root (build needs root for mounts and chroot)",
        ));
    }
}

fn check_workdir(workdir: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let layout = WorkLayout::new(workdir);
    match WorkdirLock::try_acquire(&layout.lock_path()) {
        Ok(Some(_)) => checks.push(Check::pass("workdir_lock", "Workdir lock is free")),
        Ok(None) => checks.push(Check::warn(
            "workdir_lock",
            "Workdir lock is held by another assembly",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "workdir_lock",
                &format!("Cannot check workdir lock: {e}"),
            ));
        }
    }

    match workdir_status(workdir) {
        Ok(status) => {
            checks.push(Check::info(
                "progress",
                &format!(
                    "{} of {} stages complete",
                    status.completed.len(),
                    status.completed.len() + status.pending.len()
                ),
            ));
            if status.mounts.is_empty() {
                checks.push(Check::pass("mounts", "No mounts recorded"));
            } else {
                checks.push(Check::warn(
                    "mounts",
                    &format!(
                        "{} mount(s) recorded from an interrupted run (run `layerpack clean`)",
                        status.mounts.len()
                    ),
                ));
            }
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "progress",
                &format!("Cannot read progress cache: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("layerpack doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
