//! Authenticated API client for one Stump server instance.

use std::fmt;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;
use url::Url;

use super::error::RemoteError;
use super::registry::ServerConfig;

/// Connect timeout for API calls; sync calls are small JSON exchanges.
const API_TIMEOUT_SECS: u64 = 30;

/// The three remotely synchronized entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    /// Reading progress per book.
    Progress,
    /// Page/location bookmarks.
    Bookmarks,
    /// Highlights and notes.
    Annotations,
}

impl SyncKind {
    /// URL path segment for the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Bookmarks => "bookmarks",
            Self::Annotations => "annotations",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authenticated client for one server, built from its saved configuration.
///
/// Cheap to clone; shared through the registry cache as `Arc<ServerClient>`.
#[derive(Debug, Clone)]
pub struct ServerClient {
    server_id: String,
    base_url: Url,
    auth: HeaderValue,
    http: Client,
}

impl ServerClient {
    /// Builds a client from a saved server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidBaseUrl`] when the stored base URL does
    /// not parse, or [`RemoteError::InvalidToken`] when the stored token is
    /// not a valid header value.
    pub fn from_config(config: &ServerConfig) -> Result<Self, RemoteError> {
        let base_url = Url::parse(&config.base_url).map_err(|_| RemoteError::InvalidBaseUrl {
            url: config.base_url.clone(),
        })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_token)).map_err(
            |_| RemoteError::InvalidToken {
                server_id: config.id.clone(),
            },
        )?;
        auth.set_sensitive(true);

        #[allow(clippy::expect_used)]
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client with static configuration");

        Ok(Self {
            server_id: config.id.clone(),
            base_url,
            auth,
            http,
        })
    }

    /// Identifier of the server this client talks to.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Base URL of the server.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Authenticated headers for requests against this server, including
    /// downloads performed by the executor.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth.clone());
        headers
    }

    fn sync_url(&self, kind: SyncKind) -> Result<Url, RemoteError> {
        self.base_url
            .join(&format!("api/v1/sync/{kind}"))
            .map_err(|_| RemoteError::InvalidBaseUrl {
                url: self.base_url.to_string(),
            })
    }

    fn sync_item_url(&self, kind: SyncKind, book_id: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(&format!("api/v1/sync/{kind}/{book_id}"))
            .map_err(|_| RemoteError::InvalidBaseUrl {
                url: self.base_url.to_string(),
            })
    }

    /// Fetches all remote items of a kind for the authenticated user.
    ///
    /// Items are returned as raw JSON values so that one malformed item
    /// fails only that item during reconciliation, not the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] for transport failures, non-2xx statuses, or
    /// a body that is not a JSON array.
    #[instrument(skip(self), fields(server_id = %self.server_id, kind = %kind))]
    pub async fn fetch_entities(&self, kind: SyncKind) -> Result<Vec<Value>, RemoteError> {
        let url = self.sync_url(kind)?;
        let response = self
            .http
            .get(url.clone())
            .headers(self.headers())
            .send()
            .await
            .map_err(|e| RemoteError::network(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::http_status(url.as_str(), status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::network(url.as_str(), e))?;

        serde_json::from_str::<Vec<Value>>(&body).map_err(|source| RemoteError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Uploads local state for one book.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] for transport failures or non-2xx statuses.
    #[instrument(skip(self, body), fields(server_id = %self.server_id, kind = %kind, book_id = %book_id))]
    pub async fn push_entity<T: Serialize + Sync>(
        &self,
        kind: SyncKind,
        book_id: &str,
        body: &T,
    ) -> Result<(), RemoteError> {
        let url = self.sync_item_url(kind, book_id)?;
        let response = self
            .http
            .put(url.clone())
            .headers(self.headers())
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::network(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::http_status(url.as_str(), status.as_u16()));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> ServerConfig {
        ServerConfig {
            id: "s1".to_string(),
            name: "Home".to_string(),
            base_url: base_url.to_string(),
            api_token: "token-123".to_string(),
            created_at: "2026-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn test_from_config_rejects_bad_base_url() {
        let result = ServerClient::from_config(&config("not a url"));
        assert!(matches!(result, Err(RemoteError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn test_headers_carry_bearer_token() {
        let client = ServerClient::from_config(&config("https://stump.local/")).unwrap();
        let headers = client.headers();
        let auth = headers.get(AUTHORIZATION).unwrap();
        // Sensitive values still compare by bytes.
        assert_eq!(auth.as_bytes(), b"Bearer token-123");
    }

    #[test]
    fn test_sync_kind_path_segments() {
        assert_eq!(SyncKind::Progress.as_str(), "progress");
        assert_eq!(SyncKind::Bookmarks.as_str(), "bookmarks");
        assert_eq!(SyncKind::Annotations.as_str(), "annotations");
    }

    #[test]
    fn test_sync_urls_join_under_base() {
        let client = ServerClient::from_config(&config("https://stump.local/")).unwrap();
        let url = client.sync_url(SyncKind::Bookmarks).unwrap();
        assert_eq!(url.as_str(), "https://stump.local/api/v1/sync/bookmarks");

        let item = client.sync_item_url(SyncKind::Progress, "b1").unwrap();
        assert_eq!(item.as_str(), "https://stump.local/api/v1/sync/progress/b1");
    }
}
