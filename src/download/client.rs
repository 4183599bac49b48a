//! HTTP executor for streaming downloads.
//!
//! Wraps a reqwest client and streams response bodies to disk chunk by
//! chunk, reporting byte-level progress on every chunk and supporting
//! cooperative cancellation. The executor knows nothing about the queue; the
//! manager orchestrates it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, STALL_TIMEOUT_SECS};
use super::error::DownloadError;
use super::progress::DownloadProgress;

/// Result of a completed download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Final output path.
    pub path: PathBuf,
    /// Bytes written to disk.
    pub bytes_downloaded: u64,
    /// Expected size from the Content-Length header, when present.
    pub content_length: Option<u64>,
}

/// HTTP client for streaming downloads.
///
/// Designed to be created once and reused, taking advantage of connection
/// pooling. Cloning is cheap (the inner reqwest client is ref-counted).
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    stall_timeout: Duration,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts.
    ///
    /// - Connect timeout: 30 seconds
    /// - Per-chunk stall watchdog: 5 minutes
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(STALL_TIMEOUT_SECS),
        )
    }

    /// Creates a new HTTP client with explicit timeout values.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout: Duration, stall_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .gzip(true)
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self {
            client,
            stall_timeout,
        }
    }

    /// Downloads `url` to `dest`, streaming chunks to disk.
    ///
    /// `on_progress` is invoked once after headers arrive and then after
    /// every chunk, with non-decreasing `downloaded_bytes`. No debouncing is
    /// applied; consumers throttle if they need to.
    ///
    /// The partial file is removed best-effort on any failure, including
    /// cancellation; there is no byte-range resume in this design.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::InvalidUrl`] for unparseable URLs
    /// - [`DownloadError::Network`] for transport failures
    /// - [`DownloadError::HttpStatus`] when the response status is not 200
    /// - [`DownloadError::Cancelled`] when `cancel` fires mid-transfer
    /// - [`DownloadError::Stalled`] when no bytes arrive within the watchdog
    /// - [`DownloadError::Io`] for filesystem failures
    #[instrument(skip(self, headers, cancel, on_progress), fields(url = %url, dest = %dest.display()))]
    pub async fn download_to_file(
        &self,
        url: &str,
        headers: HeaderMap,
        dest: &Path,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(DownloadProgress) + Send,
    ) -> Result<DownloadOutcome, DownloadError> {
        if Url::parse(url).is_err() {
            return Err(DownloadError::invalid_url(url));
        }

        // Cancellation is honored while waiting for headers too, not just
        // mid-stream.
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.get(url).headers(headers).send() => {
                response.map_err(|e| DownloadError::network(url, e))?
            }
        };

        let status = response.status().as_u16();
        if status != 200 {
            return Err(DownloadError::http_status(url, status));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let total_bytes = content_length.unwrap_or(0);

        debug!(content_length, "starting streamed download");

        let file = File::create(dest)
            .await
            .map_err(|e| DownloadError::io(dest, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        // First tick lets subscribers observe the transfer even for empty bodies.
        on_progress(DownloadProgress::new(0, total_bytes));

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    drop(writer);
                    remove_partial(dest).await;
                    return Err(DownloadError::Cancelled);
                }
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => next,
            };

            let Ok(item) = next else {
                drop(writer);
                remove_partial(dest).await;
                return Err(DownloadError::stalled(url));
            };

            let Some(chunk) = item else {
                break;
            };

            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    drop(writer);
                    remove_partial(dest).await;
                    return Err(DownloadError::network(url, e));
                }
            };

            if let Err(e) = writer.write_all(&bytes).await {
                drop(writer);
                remove_partial(dest).await;
                return Err(DownloadError::io(dest, e));
            }

            downloaded += bytes.len() as u64;
            on_progress(DownloadProgress::new(downloaded, total_bytes));
        }

        if let Err(e) = writer.flush().await {
            remove_partial(dest).await;
            return Err(DownloadError::io(dest, e));
        }

        debug!(bytes_downloaded = downloaded, "download complete");

        Ok(DownloadOutcome {
            path: dest.to_path_buf(),
            bytes_downloaded: downloaded,
            content_length,
        })
    }
}

/// Best-effort removal of a partial file after a failed transfer.
async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial download");
        }
    }
}

#[cfg(test)]
mod tests {
    // Full transfer behavior is covered against mock servers in
    // tests/download_integration.rs.

    use super::*;

    #[tokio::test]
    async fn test_download_rejects_invalid_url() {
        let client = HttpClient::new();
        let temp = tempfile::tempdir().unwrap();
        let dest = temp.path().join("out.cbz");

        let result = client
            .download_to_file(
                "not a url",
                HeaderMap::new(),
                &dest,
                &CancellationToken::new(),
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_remove_partial_tolerates_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        remove_partial(&temp.path().join("never-existed")).await;
    }
}
