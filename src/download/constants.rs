//! Timeout constants for the download executor.

/// Connect timeout for establishing the HTTP connection.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Per-chunk inactivity watchdog. A transfer that produces no bytes for this
/// long is treated as stalled and fails rather than occupying a concurrency
/// slot indefinitely.
pub const STALL_TIMEOUT_SECS: u64 = 300;
