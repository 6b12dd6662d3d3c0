use crate::digest::{reuse_existing, write_verified};
use crate::{FetchError, Fetcher};
use layerpack_schema::{BlobSource, RemoteBlob};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Downloads `BlobSource::Remote` blobs over HTTP(S).
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    /// `timeout` bounds each whole request, body included.
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn download(&self, url: &str, dest: &Path, blob: &RemoteBlob) -> Result<PathBuf, FetchError> {
        debug!("GET {url}");
        let resp = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(FetchError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(FetchError::Http {
                    url: url.to_owned(),
                    message: format!("HTTP {code}"),
                });
            }
            Err(e) => {
                return Err(FetchError::Http {
                    url: url.to_owned(),
                    message: e.to_string(),
                });
            }
        };
        let reader = resp.into_body().into_reader();
        let path = write_verified(reader, dest, blob)?;
        info!("fetched {} from {url}", blob.name);
        Ok(path)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, blob: &RemoteBlob, dest_dir: &Path) -> Result<PathBuf, FetchError> {
        let BlobSource::Remote { url } = &blob.source else {
            return Err(FetchError::Http {
                url: String::new(),
                message: format!("'{}' is not a remote blob", blob.name),
            });
        };
        let dest = dest_dir.join(blob.stored_name());
        if reuse_existing(&dest, blob)? {
            return Ok(dest);
        }
        self.download(url, &dest, blob)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use layerpack_schema::Sha256Digest;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves fixed bodies by path and counts the requests it answered.
    pub(crate) struct MockServer {
        pub(crate) addr: String,
        hits: Arc<AtomicUsize>,
        _handle: std::thread::JoinHandle<()>,
    }

    impl MockServer {
        pub(crate) fn start(files: HashMap<String, Vec<u8>>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = format!("http://{}", listener.local_addr().unwrap());
            let files = Arc::new(files);
            let hits = Arc::new(AtomicUsize::new(0));
            let hits_clone = Arc::clone(&hits);
            let handle = std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { break };
                    let files = Arc::clone(&files);
                    let hits = Arc::clone(&hits_clone);
                    std::thread::spawn(move || {
                        let mut reader = BufReader::new(stream.try_clone().unwrap());
                        let mut request_line = String::new();
                        if reader.read_line(&mut request_line).is_err() {
                            return;
                        }
                        loop {
                            let mut line = String::new();
                            if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                                break;
                            }
                        }
                        hits.fetch_add(1, Ordering::SeqCst);
                        let path = request_line.split_whitespace().nth(1).unwrap_or("/");
                        match files.get(path) {
                            Some(body) => {
                                let _ = write!(
                                    stream,
                                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                    body.len()
                                );
                                let _ = stream.write_all(body);
                            }
                            None => {
                                let _ = stream.write_all(
                                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                                );
                            }
                        }
                        let _ = stream.flush();
                    });
                }
            });
            Self {
                addr,
                hits,
                _handle: handle,
            }
        }

        pub(crate) fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn sha256_hex(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(data))
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(10))
    }

    #[test]
    fn downloads_and_verifies() {
        let server = MockServer::start(HashMap::from([(
            "/pool/hello_1.0_amd64.deb".to_owned(),
            b"deb payload".to_vec(),
        )]));
        let dir = tempfile::tempdir().unwrap();
        let blob = RemoteBlob::remote(
            "hello",
            &format!("{}/pool/hello_1.0_amd64.deb", server.addr),
            Sha256Digest::new(sha256_hex(b"deb payload")),
        );
        let path = fetcher().fetch(&blob, dir.path()).unwrap();
        assert_eq!(path, dir.path().join(blob.stored_name()));
        assert!(blob.stored_name().ends_with("-hello_1.0_amd64.deb"));
        assert_eq!(std::fs::read(&path).unwrap(), b"deb payload");
    }

    #[test]
    fn checksum_mismatch_is_never_persisted() {
        let server = MockServer::start(HashMap::from([(
            "/bad.deb".to_owned(),
            b"tampered".to_vec(),
        )]));
        let dir = tempfile::tempdir().unwrap();
        let blob = RemoteBlob::remote(
            "bad",
            &format!("{}/bad.deb", server.addr),
            Sha256Digest::new(sha256_hex(b"original")),
        );
        let err = fetcher().fetch(&blob, dir.path()).unwrap_err();
        assert!(err.is_integrity_failure());
                assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn verified_file_is_reused_without_request() {
        let server = MockServer::start(HashMap::new());
        let dir = tempfile::tempdir().unwrap();
        let blob = RemoteBlob::remote(
            "cached",
            &format!("{}/cached.deb", server.addr),
            Sha256Digest::new(sha256_hex(b"cached")),
        );
        std::fs::write(dir.path().join(blob.stored_name()), b"cached").unwrap();
        fetcher().fetch(&blob, dir.path()).unwrap();
        assert_eq!(server.hits(), 0);
    }

    #[test]
    fn missing_url_is_not_found() {
        let server = MockServer::start(HashMap::new());
        let dir = tempfile::tempdir().unwrap();
        let blob = RemoteBlob::remote(
            "gone",
            &format!("{}/gone.deb", server.addr),
            Sha256Digest::new(sha256_hex(b"")),
        );
        assert!(matches!(
            fetcher().fetch(&blob, dir.path()),
            Err(FetchError::NotFound(_))
        ));
    }
}
