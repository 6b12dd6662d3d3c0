use crate::CoreError;
use fs2::FileExt;
use layerpack_fetch::CancelToken;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive lock on a working directory, released on drop.
pub struct WorkdirLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl WorkdirLock {
    /// Block until the lock is ours.
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    /// `None` when another process holds the lock.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Take the lock or fail at once with [`CoreError::Locked`].
    pub fn acquire_or_fail(lock_path: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(lock_path)?.ok_or_else(|| CoreError::Locked(lock_path.to_path_buf()))
    }
}

impl Drop for WorkdirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C to `token`.
///
/// The first signal cancels the token so no further download is started and
/// the running stage unwinds through mount teardown. A second one exits.
pub fn install_signal_handler(token: CancelToken) {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        token.cancel();
        eprintln!("\ninterrupt received, releasing mounts before exit...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("w/.lock");
        {
            let _lock = WorkdirLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(WorkdirLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn second_holder_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".lock");
        let _lock = WorkdirLock::acquire(&lock_path).unwrap();
        assert!(WorkdirLock::try_acquire(&lock_path).unwrap().is_none());
        let err = WorkdirLock::acquire_or_fail(&lock_path).err().unwrap();
        assert!(matches!(err, CoreError::Locked(_)));
        assert!(err.to_string().starts_with("workdir lock:"));
    }
}
