//! Startup encryption sweep.
//!
//! Databases created before encryption was configured (or while it was
//! disabled) hold rows with `encryption_status` of `plain_text`, NULL or
//! empty. On boot, after migrations, each sensitive table is scanned in
//! batches of 100 for such rows with at least one non-empty sensitive
//! column, and every hit is re-saved so the save hooks upgrade it in
//! place. The pass is idempotent: once every row reads `encrypted`, the
//! scans come back empty and nothing is written.

use sqlx::Row;

use crate::crypto;
use crate::hooks;
use crate::models::{Key, McpClient, OAuthConfig, OAuthToken, Provider, Session, VirtualKey};

use super::{ConfigStore, StoreError, StoreResult};

const BATCH_SIZE: i64 = 100;

/// SQL fragment matching rows pending encryption.
const PLAIN: &str = "(encryption_status IS NULL OR encryption_status = '' \
                     OR encryption_status = 'plain_text')";

/// Per-table row counts upgraded by one sweep.
#[derive(Debug, Clone, Default)]
pub struct EncryptionSweepReport {
    pub keys: u64,
    pub providers: u64,
    pub virtual_keys: u64,
    pub mcp_clients: u64,
    pub oauth_configs: u64,
    pub oauth_tokens: u64,
    pub sessions: u64,
    pub vector_store: u64,
    pub governance_config: u64,
}

impl EncryptionSweepReport {
    pub fn total(&self) -> u64 {
        self.keys
            + self.providers
            + self.virtual_keys
            + self.mcp_clients
            + self.oauth_configs
            + self.oauth_tokens
            + self.sessions
            + self.vector_store
            + self.governance_config
    }
}

/// Re-save every plaintext row with secrets so the save hooks encrypt it.
/// No-op when the codec is disabled.
pub async fn encrypt_existing_plaintext(store: &ConfigStore) -> StoreResult<EncryptionSweepReport> {
    if !crypto::is_enabled() {
        log::info!("encryption disabled, skipping plaintext upgrade sweep");
        return Ok(EncryptionSweepReport::default());
    }

    let report = EncryptionSweepReport {
        keys: sweep_keys(store).await?,
        providers: sweep_providers(store).await?,
        virtual_keys: sweep_virtual_keys(store).await?,
        mcp_clients: sweep_mcp_clients(store).await?,
        oauth_configs: sweep_oauth_configs(store).await?,
        oauth_tokens: sweep_oauth_tokens(store).await?,
        sessions: sweep_sessions(store).await?,
        vector_store: sweep_vector_store(store).await?,
        governance_config: sweep_governance_config(store).await?,
    };

    log::info!("startup encryption pass upgraded {} plaintext row(s)", report.total());
    Ok(report)
}

async fn sweep_keys(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT * FROM config_keys WHERE {PLAIN} AND (\
             value <> '' OR COALESCE(azure_endpoint, '') <> '' \
             OR COALESCE(vertex_project_id, '') <> '' \
             OR COALESCE(bedrock_access_key, '') <> ''\
         ) ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch = sqlx::query_as::<_, Key>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for key in &batch {
            ConfigStore::update_key_tx(&mut tx, key.id, key).await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_providers(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT * FROM config_providers WHERE {PLAIN} \
         AND COALESCE(proxy_config, '') <> '' ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch = sqlx::query_as::<_, Provider>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for provider in &batch {
            let row = hooks::before_save_provider(provider)?;
            sqlx::query(
                "UPDATE config_providers SET proxy_config = ?, config_hash = ?, \
                 encryption_status = ? WHERE id = ?",
            )
            .bind(crate::models::opt_to_json_text(&row.proxy_config))
            .bind(&row.config_hash)
            .bind(&row.encryption_status)
            .bind(provider.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_virtual_keys(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT * FROM governance_virtual_keys WHERE {PLAIN} AND value <> '' \
         ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch =
            sqlx::query_as::<_, VirtualKey>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for vk in &batch {
            let row = hooks::before_save_virtual_key(vk)?;
            sqlx::query(
                "UPDATE governance_virtual_keys SET value = ?, config_hash = ?, \
                 encryption_status = ? WHERE id = ?",
            )
            .bind(&row.value)
            .bind(&row.config_hash)
            .bind(&row.encryption_status)
            .bind(&vk.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_mcp_clients(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT * FROM config_mcp_clients WHERE {PLAIN} AND (\
             COALESCE(connection_string, '') <> '' \
             OR COALESCE(headers, '') NOT IN ('', '{{}}', 'null')\
         ) ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch = sqlx::query_as::<_, McpClient>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for client in &batch {
            let row = hooks::before_save_mcp_client(client)?;
            sqlx::query(
                "UPDATE config_mcp_clients SET connection_string = ?, headers = ?, \
                 config_hash = ?, encryption_status = ? WHERE id = ?",
            )
            .bind(&row.connection_string)
            .bind(crate::models::to_json_text(&row.headers))
            .bind(&row.config_hash)
            .bind(&row.encryption_status)
            .bind(client.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_oauth_configs(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT * FROM oauth_configs WHERE {PLAIN} AND client_secret <> '' \
         ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch =
            sqlx::query_as::<_, OAuthConfig>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for config in &batch {
            let row = hooks::before_save_oauth_config(config)?;
            sqlx::query(
                "UPDATE oauth_configs SET client_secret = ?, config_hash = ?, \
                 encryption_status = ? WHERE id = ?",
            )
            .bind(&row.client_secret)
            .bind(&row.config_hash)
            .bind(&row.encryption_status)
            .bind(&config.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_oauth_tokens(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT * FROM oauth_tokens WHERE {PLAIN} AND access_token <> '' \
         ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch =
            sqlx::query_as::<_, OAuthToken>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for token in &batch {
            let row = hooks::before_save_oauth_token(token)?;
            sqlx::query(
                "UPDATE oauth_tokens SET access_token = ?, refresh_token = ?, \
                 encryption_status = ? WHERE id = ?",
            )
            .bind(&row.access_token)
            .bind(&row.refresh_token)
            .bind(&row.encryption_status)
            .bind(&token.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_sessions(store: &ConfigStore) -> StoreResult<u64> {
    let query =
        format!("SELECT * FROM sessions WHERE {PLAIN} AND token <> '' ORDER BY id LIMIT {BATCH_SIZE}");
    let mut upgraded = 0u64;
    loop {
        let batch = sqlx::query_as::<_, Session>(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for session in &batch {
            let row = hooks::before_save_session(session)?;
            sqlx::query("UPDATE sessions SET token = ?, encryption_status = ? WHERE id = ?")
                .bind(&row.token)
                .bind(&row.encryption_status)
                .bind(&session.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_vector_store(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT id, config FROM config_vector_store WHERE {PLAIN} \
         AND COALESCE(config, '') <> '' ORDER BY id LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch = sqlx::query(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for row in &batch {
            let id: i64 = row.try_get("id")?;
            let plain: String = row.try_get("config")?;
            let (sealed, status) = hooks::seal_blob(&plain)?;
            sqlx::query("UPDATE config_vector_store SET config = ?, encryption_status = ? WHERE id = ?")
                .bind(sealed)
                .bind(status)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}

async fn sweep_governance_config(store: &ConfigStore) -> StoreResult<u64> {
    let query = format!(
        "SELECT key, value FROM governance_config WHERE {PLAIN} AND value <> '' \
         AND key IN ('auth', 'global_proxy', 'log_store') ORDER BY key LIMIT {BATCH_SIZE}"
    );
    let mut upgraded = 0u64;
    loop {
        let batch = sqlx::query(&query).fetch_all(store.pool().inner()).await?;
        if batch.is_empty() {
            break;
        }
        let mut tx = store.begin().await?;
        for row in &batch {
            let key: String = row.try_get("key")?;
            let plain: String = row.try_get("value")?;
            let (sealed, status) = hooks::seal_blob(&plain)?;
            sqlx::query("UPDATE governance_config SET value = ?, encryption_status = ? WHERE key = ?")
                .bind(sealed)
                .bind(status)
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await.map_err(StoreError::from)?;
        upgraded += batch.len() as u64;
    }
    Ok(upgraded)
}
