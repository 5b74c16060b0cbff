//! Streaming artifact download with integrity checks.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use super::local::ArtifactStore;
use crate::error::{Result, ServerError};
use crate::upstream::UpstreamClient;

/// What the upstream metadata promised about an artifact
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// A downloaded, verified artifact now in its final place
#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub relative_path: String,
    pub size: u64,
    pub sha256: String,
}

/// Receives the running byte count of a download
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, bytes: u64);
}

/// Observer that ignores progress
pub struct NoProgress;

#[async_trait]
impl ProgressObserver for NoProgress {
    async fn on_progress(&self, _bytes: u64) {}
}

pub struct ArtifactFetcher {
    client: Arc<UpstreamClient>,
    store: Arc<ArtifactStore>,
}

impl ArtifactFetcher {
    pub fn new(client: Arc<UpstreamClient>, store: Arc<ArtifactStore>) -> Self {
        Self { client, store }
    }

    /// Download `url` into `relative_dest`, verifying size and SHA-256.
    ///
    /// Nothing appears at the destination unless every check passes.
    pub async fn fetch(
        &self,
        url: &str,
        relative_dest: &str,
        expected: &Expected,
        observer: &dyn ProgressObserver,
    ) -> Result<FetchedArtifact> {
        // Reject bad destinations before any bytes move
        self.store.resolve(relative_dest)?;

        let response = self.client.send(url).await?;

        if let (Some(declared), Some(announced)) = (expected.size, response.content_length()) {
            if declared != announced {
                return Err(ServerError::Integrity(format!(
                    "{}: declared size {} but server sent Content-Length {}",
                    url, declared, announced
                )));
            }
        }

        let timeout = self.client.config().timeout;
        let mut sink = self.store.stage().await?;
        let mut stream = response.bytes_stream();

        loop {
            let next = match tokio::time::timeout(timeout, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    sink.abort().await;
                    return Err(ServerError::UpstreamUnreachable(format!(
                        "timed out reading {}",
                        url
                    )));
                }
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    sink.abort().await;
                    return Err(ServerError::UpstreamUnreachable(format!(
                        "failed reading {}: {}",
                        url, e
                    )));
                }
            };

            if let Some(declared) = expected.size {
                if sink.written() + chunk.len() as u64 > declared {
                    sink.abort().await;
                    return Err(ServerError::Integrity(format!(
                        "{}: body exceeds declared size {}",
                        url, declared
                    )));
                }
            }

            if let Err(e) = sink.write(&chunk).await {
                sink.abort().await;
                return Err(ServerError::Storage(format!("failed writing artifact: {}", e)));
            }
            observer.on_progress(sink.written()).await;
        }

        let staged = sink
            .finish()
            .await
            .map_err(|e| ServerError::Storage(format!("failed to flush artifact: {}", e)))?;

        if let Some(declared) = expected.size {
            if staged.size != declared {
                let observed = staged.size;
                staged.discard().await;
                return Err(ServerError::Integrity(format!(
                    "{}: declared size {} but received {} bytes",
                    url, declared, observed
                )));
            }
        }

        if let Some(declared) = expected.sha256.as_deref() {
            if !declared.trim().eq_ignore_ascii_case(&staged.sha256) {
                let observed = staged.sha256.clone();
                staged.discard().await;
                return Err(ServerError::Integrity(format!(
                    "{}: sha256 mismatch (declared {}, computed {})",
                    url,
                    declared.trim(),
                    observed
                )));
            }
        }

        let size = staged.size;
        let sha256 = staged.sha256.clone();
        self.store.commit(staged, relative_dest).await?;

        tracing::info!("Fetched {} ({} bytes, sha256 {})", relative_dest, size, sha256);

        Ok(FetchedArtifact {
            relative_path: relative_dest.to_string(),
            size,
            sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::storage::sink::sha256_hex;
    use crate::upstream::UpstreamGuard;
    use axum::{routing::get, Router};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    const BODY: &[u8] = b"0123456789abcdef";

    async fn serve_body() -> String {
        let app = Router::new().route("/file", get(|| async { BODY.to_vec() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/file", addr)
    }

    fn fetcher(temp_dir: &TempDir) -> (ArtifactFetcher, Arc<ArtifactStore>) {
        let store = Arc::new(ArtifactStore::new(
            temp_dir.path().join("root"),
            temp_dir.path().join("staging"),
        ));
        let client = Arc::new(UpstreamClient::new(
            Arc::new(UpstreamGuard::new(true)),
            UpstreamConfig {
                allow_private_networks: true,
                ..Default::default()
            },
        ));
        (ArtifactFetcher::new(client, store.clone()), store)
    }

    #[derive(Default)]
    struct Recorder(AtomicU64);

    #[async_trait]
    impl ProgressObserver for Recorder {
        async fn on_progress(&self, bytes: u64) {
            self.0.store(bytes, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_fetch_verified() {
        let temp_dir = TempDir::new().unwrap();
        let (fetcher, store) = fetcher(&temp_dir);
        let url = serve_body().await;
        let recorder = Recorder::default();

        let expected = Expected {
            size: Some(BODY.len() as u64),
            sha256: Some(sha256_hex(BODY).to_uppercase()),
        };
        let fetched = fetcher
            .fetch(&url, "mirror/1/file", &expected, &recorder)
            .await
            .unwrap();

        assert_eq!(fetched.size, BODY.len() as u64);
        assert_eq!(fetched.sha256, sha256_hex(BODY));
        assert_eq!(recorder.0.load(Ordering::SeqCst), BODY.len() as u64);
        let on_disk = tokio::fs::read(store.resolve("mirror/1/file").unwrap()).await.unwrap();
        assert_eq!(on_disk, BODY);
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (fetcher, store) = fetcher(&temp_dir);
        let url = serve_body().await;

        let expected = Expected {
            size: None,
            sha256: Some(sha256_hex(b"something else")),
        };
        let err = fetcher
            .fetch(&url, "mirror/1/file", &expected, &NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Integrity(_)));
        assert!(!store.resolve("mirror/1/file").unwrap().exists());
        assert_eq!(store.clear_staging().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let (fetcher, store) = fetcher(&temp_dir);
        let url = serve_body().await;

        let expected = Expected {
            size: Some(4),
            sha256: None,
        };
        let err = fetcher
            .fetch(&url, "mirror/1/file", &expected, &NoProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Integrity(_)));
        assert!(!store.resolve("mirror/1/file").unwrap().exists());
    }

    #[tokio::test]
    async fn test_blocked_url_never_fetched() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(
            temp_dir.path().join("root"),
            temp_dir.path().join("staging"),
        ));
        let client = Arc::new(UpstreamClient::new(
            Arc::new(UpstreamGuard::new(false)),
            UpstreamConfig::default(),
        ));
        let fetcher = ArtifactFetcher::new(client, store);

        let err = fetcher
            .fetch("http://169.254.169.254/latest", "mirror/1/x", &Expected::default(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::UpstreamBlocked(_)));
    }
}
