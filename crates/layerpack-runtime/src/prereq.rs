use crate::exec::which;
use layerpack_schema::{BaseSource, BuildConfig, OverlayDriver};
use std::fmt;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

struct Tool {
    name: &'static str,
    purpose: &'static str,
    install_hint: &'static str,
}

const TOOLS: &[Tool] = &[
    Tool {
        name: "mount",
        purpose: "overlay, bind and loop mounts",
        install_hint: "part of util-linux (usually pre-installed)",
    },
    Tool {
        name: "umount",
        purpose: "releasing mounts",
        install_hint: "part of util-linux (usually pre-installed)",
    },
    Tool {
        name: "ldd",
        purpose: "listing shared-library dependencies",
        install_hint: "part of glibc (apt install libc-bin | dnf install glibc-common)",
    },
    Tool {
        name: "ldconfig",
        purpose: "looking up dlopen-referenced libraries",
        install_hint: "part of glibc (apt install libc-bin | dnf install glibc)",
    },
];

const ISO_TOOLS: &[Tool] = &[Tool {
    name: "unsquashfs",
    purpose: "unpacking the base layer from a live ISO",
    install_hint: "apt install squashfs-tools | dnf install squashfs-tools",
}];

const FUSE_TOOLS: &[Tool] = &[
    Tool {
        name: "fuse-overlayfs",
        purpose: "overlay mounts with the fuse driver",
        install_hint: "apt install fuse-overlayfs | dnf install fuse-overlayfs | zypper install fuse-overlayfs",
    },
    Tool {
        name: "fusermount3",
        purpose: "releasing fuse-overlayfs mounts",
        install_hint: "apt install fuse3 | dnf install fuse3",
    },
];

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments, has no side effects and cannot fail.
    unsafe { libc::geteuid() }
}

pub fn running_as_root() -> bool {
    effective_uid() == 0
}

/// What a build asks of the host beyond the always-required tools.
///
/// `.deb` archives are unpacked by the dpkg inside the composed root, so the
/// host never needs its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostNeeds {
    pub driver: OverlayDriver,
    pub iso_base: bool,
}

impl HostNeeds {
    pub fn for_config(config: &BuildConfig) -> Self {
        Self {
            driver: config.overlay_driver,
            iso_base: matches!(config.base, BaseSource::Iso(_)),
        }
    }
}

impl Default for HostNeeds {
    fn default() -> Self {
        Self {
            driver: OverlayDriver::Kernel,
            iso_base: false,
        }
    }
}

/// Check host tools needed for `needs`. Empty means ready.
///
/// Tools are also looked up in the sbin directories, which are often not
/// on an unprivileged user's PATH.
pub fn check_host_prereqs(needs: HostNeeds) -> Vec<MissingPrereq> {
    let fuse: &[Tool] = if needs.driver == OverlayDriver::Fuse {
        FUSE_TOOLS
    } else {
        &[]
    };
    let iso: &[Tool] = if needs.iso_base { ISO_TOOLS } else { &[] };
    TOOLS
        .iter()
        .chain(fuse)
        .chain(iso)
        .filter(|t| !tool_exists(t.name))
        .map(|t| MissingPrereq {
            name: t.name,
            purpose: t.purpose,
            install_hint: t.install_hint,
        })
        .collect()
}

fn tool_exists(name: &str) -> bool {
    which(name).is_some()
        || ["/sbin", "/usr/sbin", "/usr/local/sbin"]
            .iter()
            .any(|dir| std::path::Path::new(dir).join(name).is_file())
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nlayerpack requires these tools to assemble application bundles.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "dpkg",
            purpose: "installing packages",
            install_hint: "apt install dpkg",
        };
        let s = format!("{m}");
        assert!(s.contains("dpkg"));
        assert!(s.contains("installing packages"));
        assert!(s.contains("apt install dpkg"));
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = vec![
            MissingPrereq {
                name: "unsquashfs",
                purpose: "base layer",
                install_hint: "apt install squashfs-tools",
            },
            MissingPrereq {
                name: "fuse-overlayfs",
                purpose: "overlay",
                install_hint: "apt install fuse-overlayfs",
            },
        ];
        let output = format_missing(&items);
        assert!(output.starts_with("missing prerequisites:"));
        assert!(output.contains("unsquashfs"));
        assert!(output.contains("fuse-overlayfs"));
    }

    #[test]
    fn fuse_tools_only_checked_for_fuse_driver() {
        let kernel = check_host_prereqs(HostNeeds::default());
        assert!(kernel.iter().all(|m| m.name != "fuse-overlayfs"));
    }

    #[test]
    fn dpkg_is_never_a_host_requirement() {
        let everything = HostNeeds {
            driver: OverlayDriver::Fuse,
            iso_base: true,
        };
        assert!(check_host_prereqs(everything).iter().all(|m| m.name != "dpkg"));
        assert!(TOOLS.iter().chain(ISO_TOOLS).chain(FUSE_TOOLS).all(|t| t.name != "dpkg"));
    }

    #[test]
    fn unsquashfs_only_checked_for_iso_base() {
        assert!(check_host_prereqs(HostNeeds::default())
            .iter()
            .all(|m| m.name != "unsquashfs"));
        assert!(TOOLS.iter().all(|t| t.name != "unsquashfs"));
        assert!(ISO_TOOLS.iter().any(|t| t.name == "unsquashfs"));
    }

    #[test]
    fn needs_follow_the_config() {
        let toml = "config_version = 1\n[app]\nid = \"a\"\n[base]\niso = \"live.iso\"\n[overlay]\ndriver = \"fuse\"\n";
        let config = layerpack_schema::parse_config_str(toml)
            .unwrap()
            .normalize(std::path::Path::new("/p"))
            .unwrap();
        assert_eq!(
            HostNeeds::for_config(&config),
            HostNeeds {
                driver: OverlayDriver::Fuse,
                iso_base: true,
            }
        );
    }
}
