//! Error types for server connections and the remote sync API.

use thiserror::Error;

use crate::store::StoreError;

/// Errors from the remote sync API client.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure.
    #[error("network error calling {url}: {source}")]
    Network {
        /// The endpoint URL.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The server returned a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// The endpoint URL.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        /// The endpoint URL.
        url: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The saved server configuration holds an unusable base URL.
    #[error("invalid server base URL: {url}")]
    InvalidBaseUrl {
        /// The offending URL string.
        url: String,
    },

    /// The saved API token contains characters invalid in an HTTP header.
    #[error("invalid API token for server {server_id}")]
    InvalidToken {
        /// The server whose token is unusable.
        server_id: String,
    },
}

impl RemoteError {
    /// Creates a network error for an endpoint.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error for an endpoint.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }
}

/// Errors from resolving an authenticated client for a server.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No saved configuration exists for the server.
    #[error("server not connected: {0}")]
    NotConnected(String),

    /// Loading the saved configuration failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The saved configuration could not be turned into a client.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}
