//! Singleton gateway configs, sessions, OAuth, and model pricing.
//!
//! `config_client` and `config_vector_store` are single-row tables. Auth,
//! global proxy, log store and framework settings share the
//! `governance_config` key/value bucket; sensitive values there are sealed
//! as whole blobs and opened on read.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::crypto;
use crate::hash::ConfigHash;
use crate::hooks;
use crate::models::{
    AuthConfig, ClientConfig, FrameworkConfig, GlobalProxyConfig, LogStoreConfig, ModelPricing,
    OAuthConfig, OAuthToken, Session, VectorStoreConfig,
};

use super::{ConfigStore, StoreError, StoreResult};

/// Keys inside the `governance_config` bucket.
const CONFIG_KEY_AUTH: &str = "auth";
const CONFIG_KEY_GLOBAL_PROXY: &str = "global_proxy";
const CONFIG_KEY_LOG_STORE: &str = "log_store";
const CONFIG_KEY_FRAMEWORK: &str = "framework";

impl ConfigStore {
    // ---- client config (singleton row) ----

    /// The gateway client config; defaults when no row exists yet.
    pub async fn get_client_config(&self) -> StoreResult<ClientConfig> {
        let row = sqlx::query_as::<_, ClientConfig>("SELECT * FROM config_client ORDER BY id LIMIT 1")
            .fetch_optional(self.pool().inner())
            .await?;
        Ok(row.unwrap_or_default())
    }

    pub async fn update_client_config(&self, config: &ClientConfig) -> StoreResult<ClientConfig> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO config_client \
                 (id, drop_excess_requests, allowed_origins, enable_logging, enable_governance, \
                  enforce_governance_header, allow_direct_keys, config_hash, created_at, updated_at) \
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 drop_excess_requests = excluded.drop_excess_requests, \
                 allowed_origins = excluded.allowed_origins, \
                 enable_logging = excluded.enable_logging, \
                 enable_governance = excluded.enable_governance, \
                 enforce_governance_header = excluded.enforce_governance_header, \
                 allow_direct_keys = excluded.allow_direct_keys, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(config.drop_excess_requests)
        .bind(crate::models::to_json_text(&config.allowed_origins))
        .bind(config.enable_logging)
        .bind(config.enable_governance)
        .bind(config.enforce_governance_header)
        .bind(config.allow_direct_keys)
        .bind(config.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(self.pool().inner())
        .await?;
        self.get_client_config().await
    }

    // ---- vector store config (singleton row, sealed blob) ----

    pub async fn get_vector_store_config(&self) -> StoreResult<Option<VectorStoreConfig>> {
        let row = sqlx::query("SELECT * FROM config_vector_store ORDER BY id LIMIT 1")
            .fetch_optional(self.pool().inner())
            .await?;
        let Some(row) = row else { return Ok(None) };

        let status: Option<String> = row.try_get("encryption_status")?;
        let stored: Option<String> = row.try_get("config")?;
        let opened = hooks::open_blob(stored.as_deref().unwrap_or(""), status.as_deref())?;
        let config = if opened.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&opened)
                .map_err(|e| StoreError::Validation(format!("stored vector store config is invalid: {}", e)))?
        };

        Ok(Some(VectorStoreConfig {
            id: row.try_get("id")?,
            enabled: row.try_get("enabled")?,
            store_type: row.try_get::<Option<String>, _>("store_type")?.unwrap_or_default(),
            config,
            config_hash: row.try_get("config_hash")?,
            encryption_status: status,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn update_vector_store_config(
        &self,
        config: &VectorStoreConfig,
    ) -> StoreResult<VectorStoreConfig> {
        let serialized = crate::models::to_json_text(&config.config);
        let (sealed, status) = hooks::seal_blob(&serialized)?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO config_vector_store \
                 (id, enabled, store_type, config, config_hash, encryption_status, \
                  created_at, updated_at) \
             VALUES (1, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 enabled = excluded.enabled, \
                 store_type = excluded.store_type, \
                 config = excluded.config, \
                 config_hash = excluded.config_hash, \
                 encryption_status = excluded.encryption_status, \
                 updated_at = excluded.updated_at",
        )
        .bind(config.enabled)
        .bind(&config.store_type)
        .bind(sealed)
        .bind(config.compute_config_hash())
        .bind(status)
        .bind(now)
        .bind(now)
        .execute(self.pool().inner())
        .await?;

        self.get_vector_store_config()
            .await?
            .ok_or_else(|| StoreError::NotFound("vector store config".to_string()))
    }

    // ---- governance_config bucket ----

    async fn get_config_blob(&self, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value, encryption_status FROM governance_config WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool().inner())
            .await?;
        let Some(row) = row else { return Ok(None) };
        let stored: String = row.try_get("value")?;
        let status: Option<String> = row.try_get("encryption_status")?;
        Ok(Some(hooks::open_blob(&stored, status.as_deref())?))
    }

    /// Write one bucket entry. Sensitive entries are sealed as whole blobs;
    /// the hash is always over the plain serialization.
    pub async fn set_config_blob_tx(
        conn: &mut SqliteConnection,
        key: &str,
        plain_json: &str,
        sensitive: bool,
    ) -> StoreResult<()> {
        let (value, status) = if sensitive {
            hooks::seal_blob(plain_json)?
        } else {
            (plain_json.to_string(), crate::models::STATUS_PLAIN_TEXT.to_string())
        };
        sqlx::query(
            "INSERT INTO governance_config (key, value, config_hash, encryption_status, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET \
                 value = excluded.value, \
                 config_hash = excluded.config_hash, \
                 encryption_status = excluded.encryption_status, \
                 updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(crypto::sha256_hex(plain_json.as_bytes()))
        .bind(status)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn set_config_blob(&self, key: &str, plain_json: &str, sensitive: bool) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        Self::set_config_blob_tx(&mut tx, key, plain_json, sensitive).await?;
        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    pub async fn get_auth_config(&self) -> StoreResult<Option<AuthConfig>> {
        self.parse_config_blob(CONFIG_KEY_AUTH).await
    }

    pub async fn update_auth_config(&self, config: &AuthConfig) -> StoreResult<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| StoreError::Validation(format!("auth config does not serialize: {}", e)))?;
        self.set_config_blob(CONFIG_KEY_AUTH, &json, true).await
    }

    pub async fn get_global_proxy_config(&self) -> StoreResult<Option<GlobalProxyConfig>> {
        self.parse_config_blob(CONFIG_KEY_GLOBAL_PROXY).await
    }

    pub async fn update_global_proxy_config(&self, config: &GlobalProxyConfig) -> StoreResult<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| StoreError::Validation(format!("proxy config does not serialize: {}", e)))?;
        self.set_config_blob(CONFIG_KEY_GLOBAL_PROXY, &json, true).await
    }

    pub async fn get_log_store_config(&self) -> StoreResult<Option<LogStoreConfig>> {
        self.parse_config_blob(CONFIG_KEY_LOG_STORE).await
    }

    pub async fn update_log_store_config(&self, config: &LogStoreConfig) -> StoreResult<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| StoreError::Validation(format!("log store config does not serialize: {}", e)))?;
        self.set_config_blob(CONFIG_KEY_LOG_STORE, &json, true).await
    }

    pub async fn get_framework_config(&self) -> StoreResult<Option<FrameworkConfig>> {
        self.parse_config_blob(CONFIG_KEY_FRAMEWORK).await
    }

    pub async fn update_framework_config(&self, config: &FrameworkConfig) -> StoreResult<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| StoreError::Validation(format!("framework config does not serialize: {}", e)))?;
        self.set_config_blob(CONFIG_KEY_FRAMEWORK, &json, false).await
    }

    async fn parse_config_blob<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get_config_blob(key).await? {
            None => Ok(None),
            Some(json) if json.is_empty() => Ok(None),
            Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                StoreError::Validation(format!("stored {} config is invalid: {}", key, e))
            }),
        }
    }

    // ---- sessions ----

    pub async fn create_session(&self, session: &Session) -> StoreResult<Session> {
        let mut to_save = session.clone();
        if to_save.id.is_empty() {
            to_save.id = Uuid::new_v4().to_string();
        }
        let row = hooks::before_save_session(&to_save)?;

        sqlx::query(
            "INSERT INTO sessions (id, token, user_id, encryption_status, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.token)
        .bind(&row.user_id)
        .bind(&row.encryption_status)
        .bind(row.expires_at)
        .bind(Utc::now())
        .execute(self.pool().inner())
        .await?;

        self.get_session(&row.id).await
    }

    pub async fn get_session(&self, id: &str) -> StoreResult<Session> {
        let mut session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {:?}", id)))?;
        hooks::after_load_session(&mut session)?;
        Ok(session)
    }

    pub async fn delete_session(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool().inner())
            .await?;
        if result.rows_affected() > 0 {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("session {:?}", id)))
        }
    }

    /// Remove sessions past their expiry; returns the count removed.
    pub async fn delete_expired_sessions(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(self.pool().inner())
            .await?;
        Ok(result.rows_affected())
    }

    // ---- oauth ----

    pub async fn upsert_oauth_config(&self, config: &OAuthConfig) -> StoreResult<OAuthConfig> {
        if config.provider.trim().is_empty() {
            return Err(StoreError::Validation("oauth config needs a provider".to_string()));
        }

        let mut to_save = config.clone();
        if to_save.id.is_empty() {
            to_save.id = Uuid::new_v4().to_string();
        }
        let row = hooks::before_save_oauth_config(&to_save)?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO oauth_configs \
                 (id, provider, client_id, client_secret, redirect_uri, scopes, config_hash, \
                  encryption_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(provider) DO UPDATE SET \
                 client_id = excluded.client_id, \
                 client_secret = excluded.client_secret, \
                 redirect_uri = excluded.redirect_uri, \
                 scopes = excluded.scopes, \
                 config_hash = excluded.config_hash, \
                 encryption_status = excluded.encryption_status, \
                 updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.provider)
        .bind(&row.client_id)
        .bind(&row.client_secret)
        .bind(&row.redirect_uri)
        .bind(crate::models::to_json_text(&row.scopes))
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(now)
        .bind(now)
        .execute(self.pool().inner())
        .await?;

        self.get_oauth_config(&row.provider).await
    }

    pub async fn get_oauth_config(&self, provider: &str) -> StoreResult<OAuthConfig> {
        let mut config =
            sqlx::query_as::<_, OAuthConfig>("SELECT * FROM oauth_configs WHERE provider = ?")
                .bind(provider)
                .fetch_optional(self.pool().inner())
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("oauth config {:?}", provider)))?;
        hooks::after_load_oauth_config(&mut config)?;
        Ok(config)
    }

    /// Replace the stored token for an OAuth config.
    pub async fn store_oauth_token(&self, token: &OAuthToken) -> StoreResult<OAuthToken> {
        let mut to_save = token.clone();
        if to_save.id.is_empty() {
            to_save.id = Uuid::new_v4().to_string();
        }
        let row = hooks::before_save_oauth_token(&to_save)?;
        let now = Utc::now();

        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM oauth_tokens WHERE config_id = ?")
            .bind(&row.config_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO oauth_tokens \
                 (id, config_id, access_token, refresh_token, encryption_status, expires_at, \
                  created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.config_id)
        .bind(&row.access_token)
        .bind(&row.refresh_token)
        .bind(&row.encryption_status)
        .bind(row.expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await.map_err(StoreError::from)?;

        self.get_oauth_token(&row.config_id).await
    }

    pub async fn get_oauth_token(&self, config_id: &str) -> StoreResult<OAuthToken> {
        let mut token =
            sqlx::query_as::<_, OAuthToken>("SELECT * FROM oauth_tokens WHERE config_id = ?")
                .bind(config_id)
                .fetch_optional(self.pool().inner())
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("oauth token for {:?}", config_id)))?;
        hooks::after_load_oauth_token(&mut token)?;
        Ok(token)
    }

    // ---- model pricing ----

    /// Replace the whole pricing sheet in one transaction.
    pub async fn sync_model_pricing(&self, entries: &[ModelPricing]) -> StoreResult<usize> {
        for entry in entries {
            entry.validate().map_err(StoreError::Validation)?;
        }

        let now = Utc::now();
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM model_pricing").execute(&mut *tx).await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO model_pricing \
                     (model, provider, input_cost_per_token, output_cost_per_token, mode, \
                      input_cost_per_token_batches, output_cost_per_token_batches, \
                      cache_read_input_token_cost, cache_creation_input_token_cost, \
                      created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.model)
            .bind(&entry.provider)
            .bind(entry.input_cost_per_token)
            .bind(entry.output_cost_per_token)
            .bind(&entry.mode)
            .bind(entry.input_cost_per_token_batches)
            .bind(entry.output_cost_per_token_batches)
            .bind(entry.cache_read_input_token_cost)
            .bind(entry.cache_creation_input_token_cost)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        Ok(entries.len())
    }

    pub async fn list_model_pricing(&self) -> StoreResult<Vec<ModelPricing>> {
        Ok(
            sqlx::query_as::<_, ModelPricing>("SELECT * FROM model_pricing ORDER BY model, provider")
                .fetch_all(self.pool().inner())
                .await?,
        )
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

    #[tokio::test]
    async fn test_client_config_defaults_then_updates() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let config = store.get_client_config().await.unwrap();
        assert!(config.enable_logging);

        let mut changed = config.clone();
        changed.drop_excess_requests = true;
        changed.allowed_origins = vec!["https://app.example.com".to_string()];
        let updated = store.update_client_config(&changed).await.unwrap();
        assert!(updated.drop_excess_requests);
        assert_eq!(updated.allowed_origins.len(), 1);

        // Second update hits the same singleton row.
        store.update_client_config(&updated).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM config_client")
            .fetch_one(store.pool().inner())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_governance_config_bucket_round_trip() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        assert!(store.get_auth_config().await.unwrap().is_none());

        let auth = AuthConfig {
            is_enabled: true,
            admin_username: "admin".to_string(),
            admin_password_hash: "argon2-hash".to_string(),
        };
        store.update_auth_config(&auth).await.unwrap();

        let loaded = store.get_auth_config().await.unwrap().unwrap();
        assert!(loaded.is_enabled);
        assert_eq!(loaded.admin_password_hash, "argon2-hash");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let session = store
            .create_session(&Session {
                token: "bearer-token".to_string(),
                user_id: "admin".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded = store.get_session(&session.id).await.unwrap();
        assert_eq!(loaded.token, "bearer-token");

        store.delete_session(&session.id).await.unwrap();
        assert!(matches!(store.get_session(&session.id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_session_sweep() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        store
            .create_session(&Session {
                token: "old".to_string(),
                expires_at: Utc::now() - chrono::Duration::hours(1),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_session(&Session {
                token: "fresh".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(store.delete_expired_sessions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oauth_config_and_token() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let config = store
            .upsert_oauth_config(&OAuthConfig {
                provider: "github".to_string(),
                client_id: "client-1".to_string(),
                client_secret: "secret-1".to_string(),
                scopes: vec!["read:user".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(config.client_secret, "secret-1");

        let token = store
            .store_oauth_token(&OAuthToken {
                config_id: config.id.clone(),
                access_token: "at-1".to_string(),
                refresh_token: Some("rt-1".to_string()),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(token.access_token, "at-1");

        // Storing again replaces the previous token row.
        store
            .store_oauth_token(&OAuthToken {
                config_id: config.id.clone(),
                access_token: "at-2".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oauth_tokens")
            .fetch_one(store.pool().inner())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_model_pricing_sync_replaces_all() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let first = vec![ModelPricing {
            model: "gpt-4o".to_string(),
            provider: "openai".to_string(),
            input_cost_per_token: 2.5e-6,
            output_cost_per_token: 1e-5,
            mode: "chat".to_string(),
            ..Default::default()
        }];
        assert_eq!(store.sync_model_pricing(&first).await.unwrap(), 1);

        let second = vec![
            ModelPricing {
                model: "claude-sonnet".to_string(),
                provider: "anthropic".to_string(),
                input_cost_per_token: 3e-6,
                output_cost_per_token: 1.5e-5,
                mode: "chat".to_string(),
                ..Default::default()
            },
            ModelPricing {
                model: "text-embedding-3-small".to_string(),
                provider: "openai".to_string(),
                input_cost_per_token: 2e-8,
                output_cost_per_token: 0.0,
                mode: "embedding".to_string(),
                ..Default::default()
            },
        ];
        assert_eq!(store.sync_model_pricing(&second).await.unwrap(), 2);

        let listed = store.list_model_pricing().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].model, "claude-sonnet");
    }
}
