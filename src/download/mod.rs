//! HTTP download executor for streaming files to disk.
//!
//! This module wraps the chunked network download primitive the queue
//! manager orchestrates: streaming transfers with per-chunk progress
//! callbacks, cooperative cancellation, and a stall watchdog.
//!
//! # Example
//!
//! ```no_run
//! use stump_offline::download::HttpClient;
//! use reqwest::header::HeaderMap;
//! use tokio_util::sync::CancellationToken;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let outcome = client
//!     .download_to_file(
//!         "https://stump.local/api/v1/books/b1/file",
//!         HeaderMap::new(),
//!         Path::new("./downloads/s1/b1.cbz"),
//!         &CancellationToken::new(),
//!         |progress| println!("{}%", progress.percentage),
//!     )
//!     .await?;
//! println!("Downloaded {} bytes", outcome.bytes_downloaded);
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod progress;

pub use client::{DownloadOutcome, HttpClient};
pub use error::DownloadError;
pub use progress::DownloadProgress;
