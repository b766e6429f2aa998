//! Provider and key CRUD.
//!
//! Key updates follow a three-phase protocol: fetch the provider's
//! existing keys, diff the incoming set by `key_id` (updates keep the
//! internal row id so foreign keys survive), then delete keys absent from
//! the incoming set.

use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use uuid::Uuid;

use crate::hooks;
use crate::models::{opt_to_json_text, to_json_text, Key, Provider};

use super::{ConfigStore, StoreError, StoreResult};

impl ConfigStore {
    /// Insert a new provider and its keys. Fails with `AlreadyExists` when
    /// the name is taken.
    pub async fn create_provider(&self, provider: &Provider) -> StoreResult<Provider> {
        provider.validate().map_err(StoreError::Validation)?;

        let mut tx = self.begin().await?;
        let provider_id = Self::insert_provider_tx(&mut tx, provider).await?;
        Self::update_provider_keys_tx(&mut tx, provider_id, &provider.name, &provider.keys).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.get_provider(&provider.name).await
    }

    /// Upsert a provider by name and apply the three-phase key update.
    pub async fn update_provider(&self, provider: &Provider) -> StoreResult<Provider> {
        provider.validate().map_err(StoreError::Validation)?;

        let mut tx = self.begin().await?;
        let provider_id = Self::upsert_provider_tx(&mut tx, provider).await?;
        Self::update_provider_keys_tx(&mut tx, provider_id, &provider.name, &provider.keys).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.get_provider(&provider.name).await
    }

    /// Replace the key set of an existing provider.
    pub async fn update_provider_keys(
        &self,
        provider_name: &str,
        keys: &[Key],
    ) -> StoreResult<Provider> {
        let provider = self.get_provider(provider_name).await?;

        let mut tx = self.begin().await?;
        Self::update_provider_keys_tx(&mut tx, provider.id, provider_name, keys).await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.get_provider(provider_name).await
    }

    /// Fetch a provider with its keys preloaded and decrypted.
    pub async fn get_provider(&self, name: &str) -> StoreResult<Provider> {
        let mut provider = sqlx::query_as::<_, Provider>(
            "SELECT * FROM config_providers WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool().inner())
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("provider {:?}", name)))?;

        hooks::after_load_provider(&mut provider)?;
        provider.keys = self.load_keys_for_provider(provider.id).await?;
        Ok(provider)
    }

    /// All providers with keys preloaded and decrypted.
    pub async fn list_providers(&self) -> StoreResult<Vec<Provider>> {
        let mut providers =
            sqlx::query_as::<_, Provider>("SELECT * FROM config_providers ORDER BY name")
                .fetch_all(self.pool().inner())
                .await?;

        let mut keys = sqlx::query_as::<_, Key>("SELECT * FROM config_keys ORDER BY id")
            .fetch_all(self.pool().inner())
            .await?;
        for key in &mut keys {
            hooks::after_load_key(key)?;
        }

        let mut by_provider: HashMap<i64, Vec<Key>> = HashMap::new();
        for key in keys {
            by_provider.entry(key.provider_id).or_default().push(key);
        }
        for provider in &mut providers {
            hooks::after_load_provider(provider)?;
            provider.keys = by_provider.remove(&provider.id).unwrap_or_default();
        }
        Ok(providers)
    }

    /// Providers projected to non-secret columns only: no proxy config, no
    /// key values, no credential bundles. For listing endpoints.
    pub async fn list_redacted_providers(&self) -> StoreResult<Vec<Provider>> {
        let mut providers = sqlx::query_as::<_, Provider>(
            "SELECT id, name, network_config, concurrency_and_buffer_size, \
                    NULL AS proxy_config, custom_provider_config, \
                    send_back_raw_request, send_back_raw_response, \
                    budget_id, rate_limit_id, config_hash, encryption_status, \
                    created_at, updated_at \
             FROM config_providers ORDER BY name",
        )
        .fetch_all(self.pool().inner())
        .await?;

        let keys = sqlx::query_as::<_, Key>(
            "SELECT id, key_id, name, provider_id, provider, '' AS value, models, weight, \
                    enabled, use_for_batch_api, \
                    NULL AS azure_endpoint, NULL AS azure_api_version, NULL AS azure_deployments, \
                    NULL AS azure_client_id, NULL AS azure_client_secret, NULL AS azure_tenant_id, \
                    NULL AS vertex_project_id, NULL AS vertex_region, NULL AS vertex_auth_credentials, \
                    NULL AS bedrock_access_key, NULL AS bedrock_secret_key, NULL AS bedrock_session_token, \
                    NULL AS bedrock_region, NULL AS bedrock_arn, NULL AS bedrock_deployments, \
                    config_hash, encryption_status, created_at, updated_at \
             FROM config_keys ORDER BY id",
        )
        .fetch_all(self.pool().inner())
        .await?;

        let mut by_provider: HashMap<i64, Vec<Key>> = HashMap::new();
        for key in keys {
            by_provider.entry(key.provider_id).or_default().push(key);
        }
        for provider in &mut providers {
            provider.keys = by_provider.remove(&provider.id).unwrap_or_default();
        }
        Ok(providers)
    }

    /// Delete a provider; its keys cascade.
    pub async fn delete_provider(&self, name: &str) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let deleted = Self::delete_provider_tx(&mut tx, name).await?;
        tx.commit().await.map_err(StoreError::from)?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("provider {:?}", name)))
        }
    }

    /// Fetch one key by its external id, decrypted.
    pub async fn get_key_by_key_id(&self, key_id: &str) -> StoreResult<Key> {
        let mut key = sqlx::query_as::<_, Key>("SELECT * FROM config_keys WHERE key_id = ?")
            .bind(key_id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("key {:?}", key_id)))?;
        hooks::after_load_key(&mut key)?;
        Ok(key)
    }

    async fn load_keys_for_provider(&self, provider_id: i64) -> StoreResult<Vec<Key>> {
        let mut keys =
            sqlx::query_as::<_, Key>("SELECT * FROM config_keys WHERE provider_id = ? ORDER BY id")
                .bind(provider_id)
                .fetch_all(self.pool().inner())
                .await?;
        for key in &mut keys {
            hooks::after_load_key(key)?;
        }
        Ok(keys)
    }

    /// Insert the provider row; returns the new row id.
    pub async fn insert_provider_tx(
        conn: &mut SqliteConnection,
        provider: &Provider,
    ) -> StoreResult<i64> {
        let row = hooks::before_save_provider(provider)?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO config_providers \
                 (name, network_config, concurrency_and_buffer_size, proxy_config, \
                  custom_provider_config, send_back_raw_request, send_back_raw_response, \
                  budget_id, rate_limit_id, config_hash, encryption_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.name)
        .bind(opt_to_json_text(&row.network_config))
        .bind(opt_to_json_text(&row.concurrency_and_buffer_size))
        .bind(opt_to_json_text(&row.proxy_config))
        .bind(opt_to_json_text(&row.custom_provider_config))
        .bind(row.send_back_raw_request)
        .bind(row.send_back_raw_response)
        .bind(&row.budget_id)
        .bind(&row.rate_limit_id)
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Upsert the provider row by name; returns the row id.
    pub async fn upsert_provider_tx(
        conn: &mut SqliteConnection,
        provider: &Provider,
    ) -> StoreResult<i64> {
        let row = hooks::before_save_provider(provider)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO config_providers \
                 (name, network_config, concurrency_and_buffer_size, proxy_config, \
                  custom_provider_config, send_back_raw_request, send_back_raw_response, \
                  budget_id, rate_limit_id, config_hash, encryption_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                 network_config = excluded.network_config, \
                 concurrency_and_buffer_size = excluded.concurrency_and_buffer_size, \
                 proxy_config = excluded.proxy_config, \
                 custom_provider_config = excluded.custom_provider_config, \
                 send_back_raw_request = excluded.send_back_raw_request, \
                 send_back_raw_response = excluded.send_back_raw_response, \
                 budget_id = excluded.budget_id, \
                 rate_limit_id = excluded.rate_limit_id, \
                 config_hash = excluded.config_hash, \
                 encryption_status = excluded.encryption_status, \
                 updated_at = excluded.updated_at",
        )
        .bind(&row.name)
        .bind(opt_to_json_text(&row.network_config))
        .bind(opt_to_json_text(&row.concurrency_and_buffer_size))
        .bind(opt_to_json_text(&row.proxy_config))
        .bind(opt_to_json_text(&row.custom_provider_config))
        .bind(row.send_back_raw_request)
        .bind(row.send_back_raw_response)
        .bind(&row.budget_id)
        .bind(&row.rate_limit_id)
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM config_providers WHERE name = ?")
            .bind(&row.name)
            .fetch_one(conn)
            .await?;
        Ok(id)
    }

    /// Delete a provider row by name; keys cascade. Returns whether a row
    /// was deleted.
    pub async fn delete_provider_tx(conn: &mut SqliteConnection, name: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM config_providers WHERE name = ?")
            .bind(name)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Three-phase key replacement for one provider.
    pub async fn update_provider_keys_tx(
        conn: &mut SqliteConnection,
        provider_id: i64,
        provider_name: &str,
        keys: &[Key],
    ) -> StoreResult<()> {
        // Phase 1: existing keys by external id.
        let existing =
            sqlx::query_as::<_, Key>("SELECT * FROM config_keys WHERE provider_id = ?")
                .bind(provider_id)
                .fetch_all(&mut *conn)
                .await?;
        let existing_by_key_id: HashMap<String, i64> =
            existing.iter().map(|k| (k.key_id.clone(), k.id)).collect();

        // Phase 2: save or create each incoming key.
        let mut incoming_ids = Vec::with_capacity(keys.len());
        for key in keys {
            key.validate().map_err(StoreError::Validation)?;

            let mut to_save = key.clone();
            if to_save.key_id.is_empty() {
                to_save.key_id = Uuid::new_v4().to_string();
            }
            to_save.provider_id = provider_id;
            to_save.provider = provider_name.to_string();
            incoming_ids.push(to_save.key_id.clone());

            match existing_by_key_id.get(&to_save.key_id) {
                Some(&internal_id) => {
                    Self::update_key_tx(&mut *conn, internal_id, &to_save).await?;
                }
                None => {
                    Self::insert_key_tx(&mut *conn, &to_save).await?;
                }
            }
        }

        // Phase 3: delete keys absent from the incoming set.
        for key in &existing {
            if !incoming_ids.contains(&key.key_id) {
                sqlx::query("DELETE FROM config_keys WHERE id = ?")
                    .bind(key.id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn insert_key_tx(conn: &mut SqliteConnection, key: &Key) -> StoreResult<()> {
        let row = hooks::before_save_key(key)?;
        let now = Utc::now();
        let azure = row.azure_key_config.as_ref();
        let vertex = row.vertex_key_config.as_ref();
        let bedrock = row.bedrock_key_config.as_ref();

        sqlx::query(
            "INSERT INTO config_keys \
                 (key_id, name, provider_id, provider, value, models, weight, enabled, \
                  use_for_batch_api, \
                  azure_endpoint, azure_api_version, azure_deployments, azure_client_id, \
                  azure_client_secret, azure_tenant_id, \
                  vertex_project_id, vertex_region, vertex_auth_credentials, \
                  bedrock_access_key, bedrock_secret_key, bedrock_session_token, \
                  bedrock_region, bedrock_arn, bedrock_deployments, \
                  config_hash, encryption_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.key_id)
        .bind(&row.name)
        .bind(row.provider_id)
        .bind(&row.provider)
        .bind(&row.value)
        .bind(to_json_text(&row.models))
        .bind(row.weight)
        .bind(row.enabled)
        .bind(row.use_for_batch_api)
        .bind(azure.map(|a| a.endpoint.clone()))
        .bind(azure.and_then(|a| a.api_version.clone()))
        .bind(azure.and_then(|a| a.deployments.as_ref().map(to_json_text)))
        .bind(azure.and_then(|a| a.client_id.clone()))
        .bind(azure.and_then(|a| a.client_secret.clone()))
        .bind(azure.and_then(|a| a.tenant_id.clone()))
        .bind(vertex.map(|v| v.project_id.clone()))
        .bind(vertex.map(|v| v.region.clone()))
        .bind(vertex.map(|v| v.auth_credentials.clone()))
        .bind(bedrock.map(|b| b.access_key.clone()))
        .bind(bedrock.map(|b| b.secret_key.clone()))
        .bind(bedrock.and_then(|b| b.session_token.clone()))
        .bind(bedrock.and_then(|b| b.region.clone()))
        .bind(bedrock.and_then(|b| b.arn.clone()))
        .bind(bedrock.and_then(|b| b.deployments.as_ref().map(to_json_text)))
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub(crate) async fn update_key_tx(
        conn: &mut SqliteConnection,
        internal_id: i64,
        key: &Key,
    ) -> StoreResult<()> {
        let row = hooks::before_save_key(key)?;
        let azure = row.azure_key_config.as_ref();
        let vertex = row.vertex_key_config.as_ref();
        let bedrock = row.bedrock_key_config.as_ref();

        sqlx::query(
            "UPDATE config_keys SET \
                 name = ?, provider_id = ?, provider = ?, value = ?, models = ?, weight = ?, \
                 enabled = ?, use_for_batch_api = ?, \
                 azure_endpoint = ?, azure_api_version = ?, azure_deployments = ?, \
                 azure_client_id = ?, azure_client_secret = ?, azure_tenant_id = ?, \
                 vertex_project_id = ?, vertex_region = ?, vertex_auth_credentials = ?, \
                 bedrock_access_key = ?, bedrock_secret_key = ?, bedrock_session_token = ?, \
                 bedrock_region = ?, bedrock_arn = ?, bedrock_deployments = ?, \
                 config_hash = ?, encryption_status = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&row.name)
        .bind(row.provider_id)
        .bind(&row.provider)
        .bind(&row.value)
        .bind(to_json_text(&row.models))
        .bind(row.weight)
        .bind(row.enabled)
        .bind(row.use_for_batch_api)
        .bind(azure.map(|a| a.endpoint.clone()))
        .bind(azure.and_then(|a| a.api_version.clone()))
        .bind(azure.and_then(|a| a.deployments.as_ref().map(to_json_text)))
        .bind(azure.and_then(|a| a.client_id.clone()))
        .bind(azure.and_then(|a| a.client_secret.clone()))
        .bind(azure.and_then(|a| a.tenant_id.clone()))
        .bind(vertex.map(|v| v.project_id.clone()))
        .bind(vertex.map(|v| v.region.clone()))
        .bind(vertex.map(|v| v.auth_credentials.clone()))
        .bind(bedrock.map(|b| b.access_key.clone()))
        .bind(bedrock.map(|b| b.secret_key.clone()))
        .bind(bedrock.and_then(|b| b.session_token.clone()))
        .bind(bedrock.and_then(|b| b.region.clone()))
        .bind(bedrock.and_then(|b| b.arn.clone()))
        .bind(bedrock.and_then(|b| b.deployments.as_ref().map(to_json_text)))
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(Utc::now())
        .bind(internal_id)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migrations::MigrationRunner;
    use crate::database::pool::{ConnectionPool, DatabaseConfig};

    async fn store() -> ConfigStore {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        MigrationRunner::with_declared_schema(pool.clone()).run().await.unwrap();
        ConfigStore::new(pool)
    }

    fn sample_provider() -> Provider {
        Provider {
            name: "openai".to_string(),
            keys: vec![Key {
                key_id: "u1".to_string(),
                name: "openai-primary".to_string(),
                value: "sk-first".to_string(),
                models: vec!["gpt-4o".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get_provider() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let created = store.create_provider(&sample_provider()).await.unwrap();
        assert!(created.id > 0);
        assert_eq!(created.keys.len(), 1);
        assert_eq!(created.keys[0].provider, "openai");
        assert!(!created.config_hash.is_empty());

        let fetched = store.get_provider("openai").await.unwrap();
        assert_eq!(fetched.keys[0].value, "sk-first");
    }

    #[tokio::test]
    async fn test_duplicate_provider_name() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        store.create_provider(&sample_provider()).await.unwrap();
        let err = store.create_provider(&sample_provider()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { field } if field == "name"));
    }

    #[tokio::test]
    async fn test_key_upsert_preserves_internal_id() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let created = store.create_provider(&sample_provider()).await.unwrap();
        let original_internal_id = created.keys[0].id;

        // Same key_id, new value: the internal id must survive the update.
        let mut keys = created.keys.clone();
        keys[0].value = "sk-rotated".to_string();
        let updated = store.update_provider_keys("openai", &keys).await.unwrap();

        assert_eq!(updated.keys.len(), 1);
        assert_eq!(updated.keys[0].id, original_internal_id);
        assert_eq!(updated.keys[0].value, "sk-rotated");
    }

    #[tokio::test]
    async fn test_absent_keys_are_deleted() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let mut provider = sample_provider();
        provider.keys.push(Key {
            key_id: "u2".to_string(),
            name: "openai-secondary".to_string(),
            value: "sk-second".to_string(),
            ..Default::default()
        });
        store.create_provider(&provider).await.unwrap();

        let remaining = vec![provider.keys[0].clone()];
        let updated = store.update_provider_keys("openai", &remaining).await.unwrap();
        assert_eq!(updated.keys.len(), 1);
        assert_eq!(updated.keys[0].key_id, "u1");
    }

    #[tokio::test]
    async fn test_delete_provider_cascades_keys() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        store.create_provider(&sample_provider()).await.unwrap();
        store.delete_provider("openai").await.unwrap();

        assert!(matches!(
            store.get_key_by_key_id("u1").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_provider("openai").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_redacted_projection_hides_secrets() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        store.create_provider(&sample_provider()).await.unwrap();

        let providers = store.list_redacted_providers().await.unwrap();
        assert_eq!(providers.len(), 1);
        assert!(providers[0].proxy_config.is_none());
        assert_eq!(providers[0].keys[0].value, "");
        assert_eq!(providers[0].keys[0].name, "openai-primary");
    }
}
