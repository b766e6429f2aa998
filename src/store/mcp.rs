//! MCP client CRUD.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::hooks;
use crate::models::{to_json_text, McpClient};

use super::{ConfigStore, StoreError, StoreResult};

impl ConfigStore {
    /// Insert a new MCP client. The name must already be in normalized
    /// form; callers normalize user input with
    /// [`crate::models::mcp::normalize_name`] before constructing the
    /// entity.
    pub async fn create_mcp_client(&self, client: &McpClient) -> StoreResult<McpClient> {
        let mut tx = self.begin().await?;
        let client_id = Self::upsert_mcp_client_tx(&mut tx, client).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_mcp_client(&client_id).await
    }

    /// Upsert by external client id, replacing the configuration.
    pub async fn update_mcp_client(&self, client: &McpClient) -> StoreResult<McpClient> {
        self.create_mcp_client(client).await
    }

    pub async fn get_mcp_client(&self, client_id: &str) -> StoreResult<McpClient> {
        let mut client =
            sqlx::query_as::<_, McpClient>("SELECT * FROM config_mcp_clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_optional(self.pool().inner())
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("mcp client {:?}", client_id)))?;
        hooks::after_load_mcp_client(&mut client)?;
        Ok(client)
    }

    pub async fn get_mcp_client_by_name(&self, name: &str) -> StoreResult<McpClient> {
        let mut client =
            sqlx::query_as::<_, McpClient>("SELECT * FROM config_mcp_clients WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool().inner())
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("mcp client {:?}", name)))?;
        hooks::after_load_mcp_client(&mut client)?;
        Ok(client)
    }

    pub async fn list_mcp_clients(&self) -> StoreResult<Vec<McpClient>> {
        let mut clients =
            sqlx::query_as::<_, McpClient>("SELECT * FROM config_mcp_clients ORDER BY name")
                .fetch_all(self.pool().inner())
                .await?;
        for client in &mut clients {
            hooks::after_load_mcp_client(client)?;
        }
        Ok(clients)
    }

    pub async fn delete_mcp_client(&self, client_id: &str) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let deleted = Self::delete_mcp_client_tx(&mut tx, client_id).await?;
        tx.commit().await.map_err(StoreError::from)?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("mcp client {:?}", client_id)))
        }
    }

    /// Upsert an MCP client by external client id; returns the client id.
    pub async fn upsert_mcp_client_tx(
        conn: &mut SqliteConnection,
        client: &McpClient,
    ) -> StoreResult<String> {
        client.validate().map_err(StoreError::Validation)?;

        let mut to_save = client.clone();
        if to_save.client_id.is_empty() {
            to_save.client_id = Uuid::new_v4().to_string();
        }

        let row = hooks::before_save_mcp_client(&to_save)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO config_mcp_clients \
                 (client_id, name, connection_type, connection_string, stdio_config, headers, \
                  tools_to_execute, tools_to_auto_execute, is_code_mode_client, config_hash, \
                  encryption_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(client_id) DO UPDATE SET \
                 name = excluded.name, \
                 connection_type = excluded.connection_type, \
                 connection_string = excluded.connection_string, \
                 stdio_config = excluded.stdio_config, \
                 headers = excluded.headers, \
                 tools_to_execute = excluded.tools_to_execute, \
                 tools_to_auto_execute = excluded.tools_to_auto_execute, \
                 is_code_mode_client = excluded.is_code_mode_client, \
                 config_hash = excluded.config_hash, \
                 encryption_status = excluded.encryption_status, \
                 updated_at = excluded.updated_at",
        )
        .bind(&row.client_id)
        .bind(&row.name)
        .bind(row.connection_type.as_str())
        .bind(&row.connection_string)
        .bind(row.stdio_config.as_ref().map(to_json_text))
        .bind(to_json_text(&row.headers))
        .bind(to_json_text(&row.tools_to_execute))
        .bind(to_json_text(&row.tools_to_auto_execute))
        .bind(row.is_code_mode_client)
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(row.client_id)
    }

    pub async fn delete_mcp_client_tx(
        conn: &mut SqliteConnection,
        client_id: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM config_mcp_clients WHERE client_id = ?")
            .bind(client_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migrations::MigrationRunner;
    use crate::database::pool::{ConnectionPool, DatabaseConfig};
    use crate::models::McpConnectionType;

    async fn store() -> ConfigStore {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        MigrationRunner::with_declared_schema(pool.clone()).run().await.unwrap();
        ConfigStore::new(pool)
    }

    fn sample_client() -> McpClient {
        let mut client = McpClient {
            client_id: "mcp-uuid-1".to_string(),
            name: "tools".to_string(),
            connection_type: McpConnectionType::Http,
            connection_string: Some("https://mcp.example.com".to_string()),
            tools_to_execute: vec!["search".to_string()],
            ..Default::default()
        };
        client.headers.insert("Authorization".to_string(), "env.MCP_TOKEN".to_string());
        client
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let created = store.create_mcp_client(&sample_client()).await.unwrap();
        assert_eq!(created.name, "tools");
        assert!(!created.config_hash.is_empty());

        let by_name = store.get_mcp_client_by_name("tools").await.unwrap();
        assert_eq!(by_name.client_id, "mcp-uuid-1");
        assert_eq!(
            by_name.headers.get("Authorization").map(String::as_str),
            Some("env.MCP_TOKEN")
        );
    }

    #[tokio::test]
    async fn test_unnormalized_name_rejected() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let mut client = sample_client();
        client.name = "2-prod".to_string();
        assert!(matches!(
            store.create_mcp_client(&client).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflict() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        store.create_mcp_client(&sample_client()).await.unwrap();

        let mut other = sample_client();
        other.client_id = "mcp-uuid-2".to_string();
        let err = store.create_mcp_client(&other).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { field } if field == "name"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_configuration() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        store.create_mcp_client(&sample_client()).await.unwrap();

        let mut changed = sample_client();
        changed.tools_to_execute = vec!["search".to_string(), "fetch".to_string()];
        let updated = store.update_mcp_client(&changed).await.unwrap();
        assert_eq!(updated.tools_to_execute.len(), 2);

        assert_eq!(store.list_mcp_clients().await.unwrap().len(), 1);
    }
}
