//! Normalized download progress value type.

use serde::{Deserialize, Serialize};

/// Byte-level progress snapshot for one download.
///
/// `percentage` is an integer 0-100, rounded; it is 0 while the total size
/// is unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Total bytes expected, 0 when the server did not report a size.
    pub total_bytes: u64,
    /// Bytes written so far.
    pub downloaded_bytes: u64,
    /// Rounded completion percentage (0-100).
    pub percentage: u8,
}

impl DownloadProgress {
    /// Builds a snapshot from raw byte counts, computing the percentage.
    #[must_use]
    pub fn new(downloaded_bytes: u64, total_bytes: u64) -> Self {
        Self {
            total_bytes,
            downloaded_bytes,
            percentage: percentage_of(downloaded_bytes, total_bytes),
        }
    }
}

/// Computes `round(downloaded / total * 100)` as an integer, 0 when the
/// total is unknown or zero.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn percentage_of(downloaded_bytes: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 0;
    }
    let ratio = downloaded_bytes as f64 / total_bytes as f64;
    ((ratio * 100.0).round() as u64).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_rounds_to_nearest_integer() {
        let progress = DownloadProgress::new(512_000, 1_000_000);
        assert_eq!(progress.percentage, 51);
    }

    #[test]
    fn test_percentage_zero_total_is_zero() {
        let progress = DownloadProgress::new(512_000, 0);
        assert_eq!(progress.percentage, 0);
    }

    #[test]
    fn test_percentage_complete() {
        let progress = DownloadProgress::new(1_000_000, 1_000_000);
        assert_eq!(progress.percentage, 100);
    }

    #[test]
    fn test_percentage_clamps_overshoot() {
        // Servers occasionally under-report Content-Length.
        let progress = DownloadProgress::new(1_500_000, 1_000_000);
        assert_eq!(progress.percentage, 100);
    }

    #[test]
    fn test_percentage_rounds_half_up() {
        let progress = DownloadProgress::new(5, 1000);
        assert_eq!(progress.percentage, 1); // 0.5% rounds to 1
    }
}
