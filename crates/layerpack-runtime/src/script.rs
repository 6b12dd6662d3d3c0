//! Generated POSIX shell scripts run inside the sandbox.

use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Prefix of lines in `ldd_script` output that report an unresolved library.
pub const MISSING_PREFIX: &str = "missing:";

/// Single-quote `s` for POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn shell_quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

fn header(trace: bool) -> String {
    let mut s = String::from("#!/bin/sh\n");
    if trace {
        s.push_str("set -x\n");
    }
    s
}

/// Install `.deb` archives with dpkg, ignoring unmet dependencies that the
/// base and runtime layers are expected to provide.
pub fn install_script(debs: &[&Path], trace: bool) -> String {
    let mut s = header(trace);
    s.push_str("set -e\n");
    s.push_str("export DEBIAN_FRONTEND=noninteractive\n");
    s.push_str("export LC_ALL=C\n");
    if debs.is_empty() {
        s.push_str("exit 0\n");
        return s;
    }
    s.push_str("dpkg -i --force-depends");
    for deb in debs {
        s.push(' ');
        s.push_str(&shell_quote_path(deb));
    }
    s.push('\n');
    s
}

/// Resolve shared-library dependencies of `objects` (in-root paths) and
/// write one library path per line, sorted and deduplicated, to `output`.
///
/// Libraries the dynamic linker cannot find are written as
/// `missing:<name>:<requester>` so they survive as discovery gaps.
pub fn ldd_script(objects: &[String], output: &Path, trace: bool) -> String {
    let mut s = header(trace);
    let _ = writeln!(s, "out={}", shell_quote_path(output));
    s.push_str("tmp=\"$out.tmp\"\n");
    s.push_str(": > \"$tmp\"\n");
    s.push_str(
        r#"list() {
  ldd "$1" 2>/dev/null | awk -v o="$1" '
    $2 == "=>" && $3 == "not" { print "missing:" $1 ":" o; next }
    $2 == "=>" && substr($3, 1, 1) == "/" { print $3; next }
    substr($1, 1, 1) == "/" { print $1 }
  ' >> "$tmp" || true
}
"#,
    );
    for object in objects {
        let _ = writeln!(s, "list {}", shell_quote(object));
    }
    s.push_str("sort -u \"$tmp\" > \"$out\"\n");
    s.push_str("rm -f \"$tmp\"\n");
    s
}

/// Dump the linker cache of the root to `output`.
pub fn ldconfig_script(output: &Path, trace: bool) -> String {
    let mut s = header(trace);
    let _ = writeln!(s, "ldconfig -p > {}", shell_quote_path(output));
    s
}

/// Write `content` to `path` with mode 0755.
pub fn write_script(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn quote_handles_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn install_script_quotes_every_deb() {
        let a = PathBuf::from("/debs/a b.deb");
        let b = PathBuf::from("/debs/c.deb");
        let s = install_script(&[&a, &b], false);
        assert!(s.starts_with("#!/bin/sh\nset -e\n"));
        assert!(s.contains("dpkg -i --force-depends '/debs/a b.deb' '/debs/c.deb'\n"));
        assert!(!s.contains("set -x"));
    }

    #[test]
    fn install_script_trace() {
        let s = install_script(&[], true);
        assert!(s.contains("set -x\n"));
        assert!(s.contains("exit 0"));
    }

    #[test]
    fn ldd_script_templates_objects() {
        let s = ldd_script(
            &["/usr/bin/app".to_owned(), "/opt/it's/lib.so".to_owned()],
            Path::new("/tmp/out.txt"),
            false,
        );
        assert!(s.contains("out='/tmp/out.txt'"));
        assert!(s.contains("list '/usr/bin/app'\n"));
        assert!(s.contains("list '/opt/it'\\''s/lib.so'\n"));
        assert!(s.contains("sort -u \"$tmp\" > \"$out\""));
    }

    #[test]
    fn ldd_script_runs_on_host_sh() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("libs.txt");
        let script = dir.path().join("ldd.sh");
        let missing = dir.path().join("no-such-object");
        write_script(
            &script,
            &ldd_script(&[missing.to_string_lossy().into_owned()], &out, false),
        )
        .unwrap();
        let status = std::process::Command::new("sh").arg(&script).status().unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(&out).unwrap(), "");
        assert!(!dir.path().join("libs.txt.tmp").exists());
    }

    #[test]
    fn write_script_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("s/x.sh");
        write_script(&p, "#!/bin/sh\n").unwrap();
        let mode = fs::metadata(&p).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
