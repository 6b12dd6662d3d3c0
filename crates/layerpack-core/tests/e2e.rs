//! End-to-end tests against the host's real mount and chroot tools.
//!
//! These tests are `#[ignore]` by default because they require:
//! - root (overlay mounts and chroot)
//! - `mount`, `umount`, `ldd` and `ldconfig` on the host
//!
//! Run with: `sudo -E cargo test -p layerpack-core --test e2e -- --ignored`

use layerpack_core::{clean_workdir, Engine};
use layerpack_runtime::{
    check_host_prereqs, format_missing, running_as_root, HostNeeds, SystemMounter,
};
use layerpack_schema::{parse_config_str, OverlayDriver};
use layerpack_store::WorkLayout;
use std::fs;
use std::path::Path;
use std::time::Duration;

fn prereqs_available() -> bool {
    if !running_as_root() {
        eprintln!("skipping E2E: not running as root");
        return false;
    }
    let missing = check_host_prereqs(HostNeeds::default());
    if !missing.is_empty() {
        eprintln!("skipping E2E: {}", format_missing(&missing));
        return false;
    }
    true
}

/// A base layer made of the host's own library directories, which is enough
/// for `ldd` to resolve a host binary inside the chroot.
fn host_base(dir: &Path) {
    for sub in ["lib", "lib64", "usr/lib", "usr/lib64", "etc"] {
        let host = Path::new("/").join(sub);
        if host.is_dir() {
            fs::create_dir_all(dir.join(sub)).unwrap();
        }
    }
}

#[test]
#[ignore = "requires root, overlayfs and host ldd/ldconfig"]
fn e2e_host_binary_closure_is_materialized() {
    if !prereqs_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let project = tmp.path().join("project");
    host_base(&project.join("base"));

    // Ship a dynamically linked host binary inside the AppImage payload.
    let payload = project.join("payload");
    fs::create_dir_all(payload.join("usr/bin")).unwrap();
    fs::copy("/bin/ls", payload.join("usr/bin/ls")).unwrap();
    let appimage = project.join("Ls.AppImage");
    fs::write(
        &appimage,
        format!(
            "#!/bin/sh\ncp -a {} squashfs-root\n",
            payload.display()
        ),
    )
    .unwrap();
    let sha = layerpack_fetch::sha256_file(&appimage).unwrap();

    let toml = format!(
        r#"
config_version = 1
[app]
id = "org.example.ls"
[base]
dir = "base"
[[package]]
name = "ls"
path = "Ls.AppImage"
sha256 = "{sha}"
[resolve]
strategy = "host"
exclude = ["ld-linux*"]
"#
    );
    let config = parse_config_str(&toml).unwrap().normalize(&project).unwrap();
    let workdir = tmp.path().join("work");
    let engine = Engine::new(&workdir, config);

    let report = engine.build().unwrap();

    assert!(report.ignored.is_empty(), "{:?}", report.ignored);
    let layout = WorkLayout::new(&workdir);
    assert!(
        fs::read_to_string("/proc/mounts")
            .unwrap()
            .lines()
            .all(|l| !l.contains(&*workdir.to_string_lossy())),
        "no mount under the workdir survives the build"
    );
    assert!(layout.bundle_dir().is_dir());

    let mounter = SystemMounter::new(OverlayDriver::Kernel, Duration::from_secs(30));
    clean_workdir(&workdir, &mounter, true).unwrap();
    assert!(!layout.rootfs_dir().exists());
}
