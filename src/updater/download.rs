//! Streaming artifact download with progress, cooperative cancellation and
//! SHA-256 integrity verification.

use futures_util::StreamExt;
use log::{info, warn};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    Connecting,
    InProgress,
    Verifying,
    Done,
    Failed,
    Cancelled,
}

/// Snapshot emitted after every chunk. `total_bytes` is `None` when the
/// server sent no `Content-Length`; progress is then bytes-only.
#[derive(Clone, Copy, Debug)]
pub struct DownloadProgress {
    pub bytes_read: u64,
    pub total_bytes: Option<u64>,
    pub status: DownloadStatus,
}

impl DownloadProgress {
    pub fn percent(&self) -> Option<u8> {
        self.total_bytes
            .filter(|&t| t > 0)
            .map(|t| ((self.bytes_read * 100) / t).min(100) as u8)
    }
}

#[derive(Clone, Debug)]
pub enum DownloadError {
    Http(u16),
    Network(String),
    Io(String),
    /// The only defense against a corrupted or tampered artifact; never
    /// silently ignored. The partial file has already been deleted.
    Integrity {
        expected: String,
        actual: String,
    },
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::Http(code) => write!(f, "HTTP {code}"),
            DownloadError::Network(e) => write!(f, "Network error: {e}"),
            DownloadError::Io(e) => write!(f, "File error: {e}"),
            DownloadError::Integrity { expected, actual } => write!(
                f,
                "Integrity check failed: expected {expected}, got {actual}"
            ),
        }
    }
}

impl std::error::Error for DownloadError {}

#[derive(Debug)]
pub enum DownloadOutcome {
    Done(PathBuf),
    /// Deliberate abort, distinct from failure: the partial file was
    /// deleted and no error dialog should be shown.
    Cancelled,
    Failed(DownloadError),
}

/// Shared cancellation flag, checked cooperatively at chunk boundaries.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// True when both handles control the same download. Lets the owner
    /// clear its registration without racing a newer download's handle.
    pub(crate) fn shares_flag(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.flag, &other.flag)
    }
}

pub struct DownloadEngine {
    client: reqwest::Client,
}

impl DownloadEngine {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Streams `url` to `dest`, feeding every chunk into a running SHA-256.
    ///
    /// `on_progress` fires once per received chunk plus once per phase
    /// change. No partial file outlives a non-`Done` outcome: cancellation
    /// and mid-stream errors delete it, and a hash mismatch against
    /// `expected_hash` deletes the finished file.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        expected_hash: Option<&str>,
        cancel: &CancelHandle,
        mut on_progress: F,
    ) -> DownloadOutcome
    where
        F: FnMut(DownloadProgress),
    {
        on_progress(DownloadProgress {
            bytes_read: 0,
            total_bytes: None,
            status: DownloadStatus::Connecting,
        });

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return DownloadOutcome::Failed(DownloadError::Network(e.to_string())),
        };
        if !response.status().is_success() {
            return DownloadOutcome::Failed(DownloadError::Http(response.status().as_u16()));
        }

        let total_bytes = response.content_length();
        let mut file = match tokio::fs::File::create(dest).await {
            Ok(f) => f,
            Err(e) => return DownloadOutcome::Failed(DownloadError::Io(e.to_string())),
        };

        let mut hasher = Sha256::new();
        let mut bytes_read: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                on_progress(DownloadProgress {
                    bytes_read,
                    total_bytes,
                    status: DownloadStatus::Cancelled,
                });
                return DownloadOutcome::Cancelled;
            }
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return DownloadOutcome::Failed(DownloadError::Network(e.to_string()));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return DownloadOutcome::Failed(DownloadError::Io(e.to_string()));
            }
            hasher.update(&chunk);
            bytes_read += chunk.len() as u64;
            on_progress(DownloadProgress {
                bytes_read,
                total_bytes,
                status: DownloadStatus::InProgress,
            });
        }

        if let Err(e) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(dest).await;
            return DownloadOutcome::Failed(DownloadError::Io(e.to_string()));
        }
        drop(file);

        // A cancel that lands after the final chunk still counts: the caller
        // asked for an abort, not an install.
        if cancel.is_cancelled() {
            let _ = tokio::fs::remove_file(dest).await;
            on_progress(DownloadProgress {
                bytes_read,
                total_bytes,
                status: DownloadStatus::Cancelled,
            });
            return DownloadOutcome::Cancelled;
        }

        if let Some(expected) = expected_hash {
            on_progress(DownloadProgress {
                bytes_read,
                total_bytes,
                status: DownloadStatus::Verifying,
            });
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                warn!("Integrity check failed for {url}: expected {expected}, got {actual}");
                let _ = tokio::fs::remove_file(dest).await;
                on_progress(DownloadProgress {
                    bytes_read,
                    total_bytes,
                    status: DownloadStatus::Failed,
                });
                return DownloadOutcome::Failed(DownloadError::Integrity {
                    expected: expected.to_owned(),
                    actual,
                });
            }
        }

        info!("Downloaded {bytes_read} bytes to {}", dest.display());
        on_progress(DownloadProgress {
            bytes_read,
            total_bytes,
            status: DownloadStatus::Done,
        });
        DownloadOutcome::Done(dest.to_path_buf())
    }
}

impl Default for DownloadEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_requires_known_total() {
        let p = DownloadProgress {
            bytes_read: 512,
            total_bytes: None,
            status: DownloadStatus::InProgress,
        };
        assert_eq!(p.percent(), None);

        let p = DownloadProgress {
            bytes_read: 512,
            total_bytes: Some(1024),
            status: DownloadStatus::InProgress,
        };
        assert_eq!(p.percent(), Some(50));
    }

    #[test]
    fn percent_is_clamped() {
        let p = DownloadProgress {
            bytes_read: 2048,
            total_bytes: Some(1024),
            status: DownloadStatus::InProgress,
        };
        assert_eq!(p.percent(), Some(100));
    }
}
