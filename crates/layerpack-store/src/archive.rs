use crate::StoreError;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Unpack an uncompressed tar archive into `target_dir`.
///
/// Permissions are preserved so executables in the runtime layer stay
/// executable; mtimes and xattrs are not restored.
pub fn unpack_archive(archive: &Path, target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let file = File::open(archive)?;
    let mut ar = tar::Archive::new(BufReader::new(file));
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(target_dir).map_err(|e| StoreError::Archive {
        path: archive.display().to_string(),
        message: e.to_string(),
    })?;
    debug!(
        "unpacked {} into {}",
        archive.display(),
        target_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn build_archive(path: &Path) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_data(&mut header, "usr/bin/", &[] as &[u8])
            .unwrap();

        let data = b"#!/bin/sh\necho hi\n";
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o755);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, "usr/bin/hello", data.as_slice())
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "usr/bin/hi", "hello")
            .unwrap();

        builder.finish().unwrap();
    }

    #[test]
    fn unpacks_files_links_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("runtime.tar");
        build_archive(&archive);
        let target = dir.path().join("runtimedir");

        unpack_archive(&archive, &target).unwrap();

        let hello = target.join("usr/bin/hello");
        assert_eq!(fs::read_to_string(&hello).unwrap(), "#!/bin/sh\necho hi\n");
        let mode = fs::metadata(&hello).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(
            fs::read_link(target.join("usr/bin/hi")).unwrap(),
            Path::new("hello")
        );
    }

    #[test]
    fn corrupt_archive_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.tar");
        fs::write(&archive, vec![0xffu8; 1024]).unwrap();
        let err = unpack_archive(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, StoreError::Archive { .. }));
    }
}
