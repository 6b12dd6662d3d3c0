use crate::objects::ElfObjectSet;
use crate::ElfError;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Files shorter than this are never classified as ELF.
pub const MIN_ELF_SIZE: u64 = 32;

/// True when `path` is a regular file of at least [`MIN_ELF_SIZE`] bytes
/// that starts with the ELF magic. Unreadable files are not ELF.
pub fn is_elf(path: &Path) -> bool {
    let Ok(meta) = path.symlink_metadata() else {
        return false;
    };
    if !meta.file_type().is_file() || meta.len() < MIN_ELF_SIZE {
        return false;
    }
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok_and(|()| magic == ELF_MAGIC)
}

/// Walk `scan` directories (relative to `root`; empty means all of `root`)
/// and collect ELF objects, keyed by their path inside `root`.
///
/// Symlinks are not followed. Missing scan directories and unreadable
/// entries are skipped with a warning.
pub fn discover(root: &Path, scan: &[String]) -> Result<ElfObjectSet, ElfError> {
    let dirs: Vec<PathBuf> = if scan.is_empty() {
        vec![root.to_path_buf()]
    } else {
        scan.iter()
            .map(|s| root.join(s.trim_start_matches('/')))
            .collect()
    };

    let mut set = ElfObjectSet::new();
    for dir in dirs {
        if !dir.is_dir() {
            warn!("scan directory {} does not exist", dir.display());
            continue;
        }
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if e.io_error().is_some_and(|io| {
                    io.kind() == std::io::ErrorKind::PermissionDenied
                }) =>
                {
                    warn!("skipping unreadable entry: {e}");
                    continue;
                }
                Err(e) => {
                    return Err(ElfError::Walk {
                        path: dir.display().to_string(),
                        message: e.to_string(),
                    })
                }
            };
            if !entry.file_type().is_file() || !is_elf(entry.path()) {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            set.insert(Path::new("/").join(rel));
        }
    }
    debug!("discovered {} ELF object(s) under {}", set.len(), root.display());
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn elf_bytes(len: usize) -> Vec<u8> {
        let mut v = ELF_MAGIC.to_vec();
        v.resize(len, 0);
        v
    }

    #[test]
    fn classifies_by_magic_and_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big"), elf_bytes(40)).unwrap();
        fs::write(dir.path().join("small"), elf_bytes(20)).unwrap();
        fs::write(dir.path().join("text"), vec![b'a'; 64]).unwrap();
        assert!(is_elf(&dir.path().join("big")));
        assert!(!is_elf(&dir.path().join("small")));
        assert!(!is_elf(&dir.path().join("text")));
        assert!(!is_elf(&dir.path().join("missing")));
    }

    #[test]
    fn discover_keys_by_in_root_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("usr/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("app"), elf_bytes(64)).unwrap();
        fs::write(bin.join("script"), b"#!/bin/sh\necho hello world, this is long\n").unwrap();

        let set = discover(dir.path(), &[]).unwrap();
        let paths: Vec<_> = set.paths().cloned().collect();
        assert_eq!(paths, vec![PathBuf::from("/usr/bin/app")]);
    }

    #[test]
    fn symlinks_are_not_candidates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("libfoo.so.1.0"), elf_bytes(64)).unwrap();
        std::os::unix::fs::symlink("libfoo.so.1.0", dir.path().join("libfoo.so.1")).unwrap();
        let set = discover(dir.path(), &[]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get(Path::new("/libfoo.so.1.0")).is_some());
    }

    #[test]
    fn scan_limits_and_tolerates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("opt/app")).unwrap();
        fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        fs::write(dir.path().join("opt/app/run"), elf_bytes(64)).unwrap();
        fs::write(dir.path().join("usr/bin/other"), elf_bytes(64)).unwrap();

        let set = discover(dir.path(), &["/opt".to_owned(), "nope".to_owned()]).unwrap();
        let paths: Vec<_> = set.paths().cloned().collect();
        assert_eq!(paths, vec![PathBuf::from("/opt/app/run")]);
    }

    #[test]
    fn empty_tree_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path(), &[]).unwrap().is_empty());
    }
}
