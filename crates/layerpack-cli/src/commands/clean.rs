use super::{json_pretty, EXIT_SUCCESS};
use layerpack_core::clean_workdir;
use layerpack_runtime::exec::DEFAULT_TIMEOUT;
use layerpack_runtime::SystemMounter;
use layerpack_schema::OverlayDriver;
use std::path::Path;

pub fn run(workdir: &Path, all: bool, json: bool) -> Result<u8, String> {
    // Unmounting picks umount or fusermount3 from /proc/mounts, so the
    // driver only matters for mounting.
    let mounter = SystemMounter::new(OverlayDriver::Kernel, DEFAULT_TIMEOUT);
    let report = clean_workdir(workdir, &mounter, all).map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        for target in &report.unmounted {
            println!("unmounted {}", target.display());
        }
        for dir in &report.removed {
            println!("removed {}", dir.display());
        }
        for ignored in &report.ignored {
            println!("warning: {}: {}", ignored.path.display(), ignored.message);
        }
        if report.unmounted.is_empty() && report.removed.is_empty() {
            println!("nothing to clean");
        }
    }
    Ok(EXIT_SUCCESS)
}
