//! Saved server connections and the per-server client cache.

use std::sync::Arc;

use dashmap::DashMap;
use sqlx::FromRow;
use tracing::{debug, instrument};

use super::client::ServerClient;
use super::error::RegistryError;
use crate::db::Database;
use crate::store::StoreError;

/// A saved server connection, as stored in the `servers` table.
#[derive(Debug, Clone, FromRow)]
pub struct ServerConfig {
    /// Server identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Base URL, e.g. `https://stump.example.com/`.
    pub base_url: String,
    /// API token used to rebuild an authenticated client.
    pub api_token: String,
    /// When the connection was saved.
    pub created_at: String,
}

/// Registry of saved servers with a cache-or-create client contract.
///
/// Clients are lazily constructed from saved configuration and cached; a
/// lookup hits the cache first, else loads the row, builds the client, and
/// caches it. Removing or updating a server invalidates its cached client.
#[derive(Debug)]
pub struct ServerRegistry {
    db: Database,
    clients: DashMap<String, Arc<ServerClient>>,
}

impl ServerRegistry {
    /// Creates a registry over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clients: DashMap::new(),
        }
    }

    /// Saves (or updates) a server connection and drops any cached client.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the upsert fails.
    #[instrument(skip(self, config), fields(server_id = %config.id))]
    pub async fn upsert_server(&self, config: &ServerConfig) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO servers (id, name, base_url, api_token)
              VALUES (?, ?, ?, ?)
              ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                base_url = excluded.base_url,
                api_token = excluded.api_token",
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config.base_url)
        .bind(&config.api_token)
        .execute(self.db.pool())
        .await?;

        self.invalidate(&config.id);
        Ok(())
    }

    /// Loads a saved server configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_server(&self, server_id: &str) -> Result<Option<ServerConfig>, StoreError> {
        let config = sqlx::query_as::<_, ServerConfig>(r"SELECT * FROM servers WHERE id = ?")
            .bind(server_id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(config)
    }

    /// Lists all saved server connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_servers(&self) -> Result<Vec<ServerConfig>, StoreError> {
        let configs =
            sqlx::query_as::<_, ServerConfig>(r"SELECT * FROM servers ORDER BY created_at ASC")
                .fetch_all(self.db.pool())
                .await?;

        Ok(configs)
    }

    /// Resolves the server ids a sync pass should visit: the provided subset
    /// when given, otherwise every saved server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn resolve_server_ids(
        &self,
        for_servers: Option<&[String]>,
    ) -> Result<Vec<String>, StoreError> {
        match for_servers {
            Some(ids) => Ok(ids.to_vec()),
            None => Ok(self
                .list_servers()
                .await?
                .into_iter()
                .map(|config| config.id)
                .collect()),
        }
    }

    /// Removes a saved server and its cached client.
    ///
    /// Returns `true` when a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove_server(&self, server_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(r"DELETE FROM servers WHERE id = ?")
            .bind(server_id)
            .execute(self.db.pool())
            .await?;

        self.invalidate(server_id);
        Ok(result.rows_affected() > 0)
    }

    /// Resolves an authenticated client for a server: cached instance when
    /// available, else rebuilt from the saved configuration and cached.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotConnected`] when no configuration exists,
    /// or the underlying store/client construction error.
    #[instrument(skip(self))]
    pub async fn client_for(&self, server_id: &str) -> Result<Arc<ServerClient>, RegistryError> {
        if let Some(client) = self.clients.get(server_id) {
            return Ok(Arc::clone(&client));
        }

        let config = self
            .get_server(server_id)
            .await?
            .ok_or_else(|| RegistryError::NotConnected(server_id.to_string()))?;

        let client = Arc::new(ServerClient::from_config(&config)?);
        debug!(server_id, "constructed and cached server client");
        self.clients
            .insert(server_id.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Drops the cached client for a server, forcing reconstruction on the
    /// next lookup.
    pub fn invalidate(&self, server_id: &str) {
        self.clients.remove(server_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;

    fn config(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: "Home".to_string(),
            base_url: "https://stump.local/".to_string(),
            api_token: "token-123".to_string(),
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_client_for_unknown_server_is_not_connected() {
        let db = Database::new_in_memory().await.unwrap();
        let registry = ServerRegistry::new(db);

        let result = registry.client_for("missing").await;
        assert!(matches!(result, Err(RegistryError::NotConnected(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_client_for_caches_instance() {
        let db = Database::new_in_memory().await.unwrap();
        let registry = ServerRegistry::new(db);
        registry.upsert_server(&config("s1")).await.unwrap();

        let first = registry.client_for("s1").await.unwrap();
        let second = registry.client_for("s1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.invalidate("s1");
        let third = registry.client_for("s1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_upsert_overwrites_and_invalidates() {
        let db = Database::new_in_memory().await.unwrap();
        let registry = ServerRegistry::new(db);
        registry.upsert_server(&config("s1")).await.unwrap();
        let before = registry.client_for("s1").await.unwrap();

        let mut updated = config("s1");
        updated.base_url = "https://stump.example.com/".to_string();
        registry.upsert_server(&updated).await.unwrap();

        let after = registry.client_for("s1").await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.base_url().as_str(), "https://stump.example.com/");
    }

    #[tokio::test]
    async fn test_resolve_server_ids_defaults_to_all() {
        let db = Database::new_in_memory().await.unwrap();
        let registry = ServerRegistry::new(db);
        registry.upsert_server(&config("s1")).await.unwrap();
        registry.upsert_server(&config("s2")).await.unwrap();

        let all = registry.resolve_server_ids(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let subset = registry
            .resolve_server_ids(Some(&["s2".to_string()]))
            .await
            .unwrap();
        assert_eq!(subset, vec!["s2".to_string()]);
    }
}
