use super::{colorize_stage, json_pretty, EXIT_SUCCESS};
use layerpack_core::workdir_status;
use std::path::Path;

pub fn run(workdir: &Path, json: bool) -> Result<u8, String> {
    let status = workdir_status(workdir).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&status)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("workdir: {}", status.workdir.display());
    println!("app:     {}", status.app_id.as_deref().unwrap_or("-"));
    if let Some(at) = &status.updated_at {
        println!("updated: {at}");
    }
    for stage in &status.completed {
        println!("  {}", colorize_stage(stage, true));
    }
    for stage in &status.pending {
        println!("  {} (pending)", colorize_stage(stage, false));
    }
    println!("packages fetched: {}", status.fetched);
    if let Some(n) = status.closure_len {
        println!("libraries in closure: {n}");
    }
    if !status.mounts.is_empty() {
        println!("recorded mounts:");
        for record in &status.mounts {
            println!("  {} ({})", record.target.display(), record.fstype);
        }
    }
    if status.locked {
        println!("an assembly is currently running in this workdir");
    }
    Ok(EXIT_SUCCESS)
}
