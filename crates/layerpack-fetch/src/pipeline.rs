use crate::{FetchError, Fetcher};
use layerpack_schema::RemoteBlob;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

/// Shared flag that stops a pipeline from dispatching more work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fetch every blob into `dest_dir` with `concurrency` workers.
///
/// Returns exactly one result per blob, in input order. A failure never
/// stops the other downloads. Once `cancel` fires no further blob is
/// handed out; the ones already running finish, and every blob that never
/// started yields [`FetchError::Cancelled`].
pub fn fetch_all(
    blobs: &[RemoteBlob],
    concurrency: usize,
    dest_dir: &Path,
    fetcher: &dyn Fetcher,
    cancel: &CancelToken,
) -> Vec<Result<PathBuf, FetchError>> {
    let workers = concurrency.clamp(1, blobs.len().max(1));
    let (tx, rx) = mpsc::sync_channel::<usize>(workers);
    let rx = Mutex::new(rx);
    let results: Mutex<Vec<Option<Result<PathBuf, FetchError>>>> =
        Mutex::new(blobs.iter().map(|_| None).collect());

    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
                let Ok(i) = next else { break };
                let blob = &blobs[i];
                debug!("fetching {}", blob.name);
                let result = fetcher.fetch(blob, dest_dir);
                if let Err(e) = &result {
                    warn!("{}: {e}", blob.name);
                }
                results.lock().unwrap_or_else(PoisonError::into_inner)[i] = Some(result);
            });
        }
        for i in 0..blobs.len() {
            if cancel.is_cancelled() {
                info!("retrieval cancelled, {} blob(s) not started", blobs.len() - i);
                break;
            }
            if tx.send(i).is_err() {
                break;
            }
        }
        drop(tx);
    });

    results
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .into_iter()
        .zip(blobs)
        .map(|(result, blob)| {
            result.unwrap_or_else(|| {
                Err(FetchError::Cancelled {
                    name: blob.name.clone(),
                })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LocalFetcher;
    use layerpack_schema::Sha256Digest;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn sha256_hex(data: &[u8]) -> String {
        crate::http::tests::sha256_hex(data)
    }

    fn local_blobs(dir: &Path, count: usize, corrupt: Option<usize>) -> Vec<RemoteBlob> {
        (0..count)
            .map(|i| {
                let content = format!("package {i}");
                let path = dir.join(format!("pkg{i}.deb"));
                std::fs::write(&path, &content).unwrap();
                let expected = if corrupt == Some(i) {
                    sha256_hex(b"something else")
                } else {
                    sha256_hex(content.as_bytes())
                };
                RemoteBlob::local(&format!("pkg{i}"), path, Sha256Digest::new(expected))
            })
            .collect()
    }

    #[test]
    fn one_bad_checksum_among_five() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let blobs = local_blobs(src.path(), 5, Some(2));

        let results = fetch_all(&blobs, 2, dest.path(), &LocalFetcher, &CancelToken::new());

        assert_eq!(results.len(), 5);
        let failed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_err())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(failed, vec![2]);
        assert!(results[2].as_ref().unwrap_err().is_integrity_failure());
        assert!(!dest.path().join(blobs[2].stored_name()).exists());
        for (i, r) in results.iter().enumerate().filter(|(i, _)| *i != 2) {
            assert_eq!(r.as_ref().unwrap(), &dest.path().join(blobs[i].stored_name()));
        }
    }

    /// Counts how many fetches run at once.
    struct SlowFetcher {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Fetcher for SlowFetcher {
        fn fetch(&self, blob: &RemoteBlob, dest_dir: &Path) -> Result<PathBuf, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(dest_dir.join(&blob.name))
        }
    }

    fn slow() -> SlowFetcher {
        SlowFetcher {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn never_exceeds_concurrency() {
        let src = tempfile::tempdir().unwrap();
        let blobs = local_blobs(src.path(), 8, None);
        let fetcher = slow();
        let results = fetch_all(&blobs, 3, src.path(), &fetcher, &CancelToken::new());
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(Result::is_ok));
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn cancelled_before_start_dispatches_nothing() {
        let src = tempfile::tempdir().unwrap();
        let blobs = local_blobs(src.path(), 4, None);
        let fetcher = slow();
        let cancel = CancelToken::new();
        cancel.cancel();
        let results = fetch_all(&blobs, 2, src.path(), &fetcher, &cancel);
        assert_eq!(results.len(), 4);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(FetchError::Cancelled { .. }))));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    /// Cancels the token from inside the first fetch.
    struct CancellingFetcher {
        cancel: CancelToken,
        calls: AtomicUsize,
    }

    impl Fetcher for CancellingFetcher {
        fn fetch(&self, blob: &RemoteBlob, dest_dir: &Path) -> Result<PathBuf, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            Ok(dest_dir.join(&blob.name))
        }
    }

    #[test]
    fn cancel_mid_batch_still_reports_every_blob() {
        let src = tempfile::tempdir().unwrap();
        let blobs = local_blobs(src.path(), 10, None);
        let cancel = CancelToken::new();
        let fetcher = CancellingFetcher {
            cancel: cancel.clone(),
            calls: AtomicUsize::new(0),
        };
        let results = fetch_all(&blobs, 1, src.path(), &fetcher, &cancel);
        assert_eq!(results.len(), 10);
        let done = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(done, fetcher.calls.load(Ordering::SeqCst));
        assert!(done < 10);
        assert!(results[0].is_ok());
        assert!(matches!(results[9], Err(FetchError::Cancelled { .. })));
    }

    #[test]
    fn empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        assert!(fetch_all(&[], 4, dir.path(), &LocalFetcher, &CancelToken::new()).is_empty());
    }
}
