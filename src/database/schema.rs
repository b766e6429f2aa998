//! The declared migration list.
//!
//! Append-only: new migrations go at the end, existing entries are frozen.
//! Every DDL statement uses `IF NOT EXISTS` / `IF EXISTS` so a partially
//! migrated database (created by an older or newer binary) converges
//! instead of failing.

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;

use crate::models::mcp::{is_normalized_name, normalize_name};

use super::migrations::{AddColumnMigration, Migration, SqlMigration};
use super::{DatabaseError, Result};

/// All migrations, in the order they run.
pub fn declared_migrations() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(create_config_tables()),
        Box::new(create_governance_tables()),
        Box::new(create_distributed_locks()),
        Box::new(KeyRowHygiene),
        Box::new(create_unique_key_indexes()),
        Box::new(AddColumnMigration::new(
            "0006_add_key_batch_api_column",
            "config_keys",
            "use_for_batch_api",
            "BOOLEAN NOT NULL DEFAULT 0",
        )),
        Box::new(AddColumnMigration::new(
            "0007_add_mcp_code_mode_column",
            "config_mcp_clients",
            "is_code_mode_client",
            "BOOLEAN NOT NULL DEFAULT 0",
        )),
        Box::new(NormalizeMcpClientNames),
    ]
}

fn create_config_tables() -> SqlMigration {
    SqlMigration::new(
        "0001_create_config_tables",
        vec![
            "CREATE TABLE IF NOT EXISTS config_providers (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 name VARCHAR(255) NOT NULL UNIQUE,\
                 network_config TEXT,\
                 concurrency_and_buffer_size TEXT,\
                 proxy_config TEXT,\
                 custom_provider_config TEXT,\
                 send_back_raw_request BOOLEAN NOT NULL DEFAULT 0,\
                 send_back_raw_response BOOLEAN NOT NULL DEFAULT 0,\
                 budget_id VARCHAR(255),\
                 rate_limit_id VARCHAR(255),\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS config_keys (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 key_id VARCHAR(255) NOT NULL,\
                 name VARCHAR(255) NOT NULL,\
                 provider_id INTEGER NOT NULL REFERENCES config_providers(id) ON DELETE CASCADE,\
                 provider VARCHAR(255) NOT NULL DEFAULT '',\
                 value TEXT NOT NULL DEFAULT '',\
                 models TEXT,\
                 weight DOUBLE PRECISION,\
                 enabled BOOLEAN NOT NULL DEFAULT 1,\
                 azure_endpoint TEXT,\
                 azure_api_version TEXT,\
                 azure_deployments TEXT,\
                 azure_client_id TEXT,\
                 azure_client_secret TEXT,\
                 azure_tenant_id TEXT,\
                 vertex_project_id TEXT,\
                 vertex_region TEXT,\
                 vertex_auth_credentials TEXT,\
                 bedrock_access_key TEXT,\
                 bedrock_secret_key TEXT,\
                 bedrock_session_token TEXT,\
                 bedrock_region TEXT,\
                 bedrock_arn TEXT,\
                 bedrock_deployments TEXT,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE INDEX IF NOT EXISTS idx_config_keys_provider_id ON config_keys(provider_id)",
            "CREATE TABLE IF NOT EXISTS config_mcp_clients (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 client_id VARCHAR(255) NOT NULL UNIQUE,\
                 name VARCHAR(255) NOT NULL UNIQUE,\
                 connection_type VARCHAR(20) NOT NULL,\
                 connection_string TEXT,\
                 stdio_config TEXT,\
                 headers TEXT,\
                 tools_to_execute TEXT,\
                 tools_to_auto_execute TEXT,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS config_client (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 drop_excess_requests BOOLEAN NOT NULL DEFAULT 0,\
                 allowed_origins TEXT,\
                 enable_logging BOOLEAN NOT NULL DEFAULT 1,\
                 enable_governance BOOLEAN NOT NULL DEFAULT 0,\
                 enforce_governance_header BOOLEAN NOT NULL DEFAULT 0,\
                 allow_direct_keys BOOLEAN NOT NULL DEFAULT 1,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS config_plugins (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 name VARCHAR(255) NOT NULL UNIQUE,\
                 enabled BOOLEAN NOT NULL DEFAULT 1,\
                 path TEXT,\
                 config TEXT,\
                 version VARCHAR(64),\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS config_vector_store (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 enabled BOOLEAN NOT NULL DEFAULT 0,\
                 store_type VARCHAR(64),\
                 config TEXT,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS governance_config (\
                 key VARCHAR(255) PRIMARY KEY,\
                 value TEXT NOT NULL DEFAULT '',\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS sessions (\
                 id VARCHAR(255) PRIMARY KEY,\
                 token TEXT NOT NULL,\
                 user_id VARCHAR(255),\
                 encryption_status VARCHAR(20),\
                 expires_at TIMESTAMP NOT NULL,\
                 created_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS oauth_configs (\
                 id VARCHAR(255) PRIMARY KEY,\
                 provider VARCHAR(255) NOT NULL UNIQUE,\
                 client_id TEXT NOT NULL DEFAULT '',\
                 client_secret TEXT NOT NULL DEFAULT '',\
                 redirect_uri TEXT,\
                 scopes TEXT,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS oauth_tokens (\
                 id VARCHAR(255) PRIMARY KEY,\
                 config_id VARCHAR(255) NOT NULL REFERENCES oauth_configs(id) ON DELETE CASCADE,\
                 access_token TEXT NOT NULL DEFAULT '',\
                 refresh_token TEXT,\
                 encryption_status VARCHAR(20),\
                 expires_at TIMESTAMP NOT NULL,\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS model_pricing (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 model VARCHAR(255) NOT NULL,\
                 provider VARCHAR(255) NOT NULL,\
                 input_cost_per_token DOUBLE PRECISION NOT NULL DEFAULT 0,\
                 output_cost_per_token DOUBLE PRECISION NOT NULL DEFAULT 0,\
                 mode VARCHAR(64),\
                 input_cost_per_token_batches DOUBLE PRECISION,\
                 output_cost_per_token_batches DOUBLE PRECISION,\
                 cache_read_input_token_cost DOUBLE PRECISION,\
                 cache_creation_input_token_cost DOUBLE PRECISION,\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE INDEX IF NOT EXISTS idx_model_pricing_model ON model_pricing(model)",
        ],
        vec![],
    )
}

fn create_governance_tables() -> SqlMigration {
    SqlMigration::new(
        "0002_create_governance_tables",
        vec![
            "CREATE TABLE IF NOT EXISTS governance_budgets (\
                 id VARCHAR(255) PRIMARY KEY,\
                 max_limit DOUBLE PRECISION NOT NULL,\
                 reset_duration VARCHAR(32) NOT NULL,\
                 current_usage DOUBLE PRECISION NOT NULL DEFAULT 0,\
                 last_reset TIMESTAMP NOT NULL,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS governance_rate_limits (\
                 id VARCHAR(255) PRIMARY KEY,\
                 token_max_limit BIGINT,\
                 token_reset_duration VARCHAR(32),\
                 request_max_limit BIGINT,\
                 request_reset_duration VARCHAR(32),\
                 token_current_usage BIGINT NOT NULL DEFAULT 0,\
                 request_current_usage BIGINT NOT NULL DEFAULT 0,\
                 token_last_reset TIMESTAMP NOT NULL,\
                 request_last_reset TIMESTAMP NOT NULL,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS governance_customers (\
                 id VARCHAR(255) PRIMARY KEY,\
                 name VARCHAR(255) NOT NULL,\
                 budget_id VARCHAR(255),\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS governance_teams (\
                 id VARCHAR(255) PRIMARY KEY,\
                 name VARCHAR(255) NOT NULL,\
                 customer_id VARCHAR(255) REFERENCES governance_customers(id),\
                 budget_id VARCHAR(255),\
                 profile TEXT,\
                 config TEXT,\
                 claims TEXT,\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS governance_virtual_keys (\
                 id VARCHAR(255) PRIMARY KEY,\
                 name VARCHAR(255) NOT NULL UNIQUE,\
                 description TEXT,\
                 value TEXT NOT NULL DEFAULT '',\
                 is_active BOOLEAN NOT NULL DEFAULT 1,\
                 team_id VARCHAR(255) REFERENCES governance_teams(id),\
                 customer_id VARCHAR(255) REFERENCES governance_customers(id),\
                 budget_id VARCHAR(255),\
                 rate_limit_id VARCHAR(255),\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 encryption_status VARCHAR(20),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE TABLE IF NOT EXISTS governance_virtual_key_provider_configs (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 virtual_key_id VARCHAR(255) NOT NULL REFERENCES governance_virtual_keys(id) ON DELETE CASCADE,\
                 provider VARCHAR(255) NOT NULL,\
                 weight DOUBLE PRECISION NOT NULL DEFAULT 0,\
                 allowed_models TEXT,\
                 budget_id VARCHAR(255),\
                 rate_limit_id VARCHAR(255),\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE INDEX IF NOT EXISTS idx_governance_vk_provider_configs_vk \
                 ON governance_virtual_key_provider_configs(virtual_key_id)",
            // Explicit join table so its schema stays visible to this runner.
            "CREATE TABLE IF NOT EXISTS governance_virtual_key_provider_config_keys (\
                 virtual_key_provider_config_id INTEGER NOT NULL \
                     REFERENCES governance_virtual_key_provider_configs(id) ON DELETE CASCADE,\
                 key_id VARCHAR(255) NOT NULL,\
                 PRIMARY KEY (virtual_key_provider_config_id, key_id)\
             )",
            "CREATE TABLE IF NOT EXISTS governance_virtual_key_mcp_configs (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT,\
                 virtual_key_id VARCHAR(255) NOT NULL REFERENCES governance_virtual_keys(id) ON DELETE CASCADE,\
                 mcp_client_id VARCHAR(255) NOT NULL,\
                 tools_to_execute TEXT,\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
            "CREATE INDEX IF NOT EXISTS idx_governance_vk_mcp_configs_vk \
                 ON governance_virtual_key_mcp_configs(virtual_key_id)",
            "CREATE TABLE IF NOT EXISTS governance_model_configs (\
                 id VARCHAR(255) PRIMARY KEY,\
                 model_name VARCHAR(255) NOT NULL,\
                 provider VARCHAR(255),\
                 config_hash VARCHAR(64) NOT NULL DEFAULT '',\
                 created_at TIMESTAMP NOT NULL,\
                 updated_at TIMESTAMP NOT NULL\
             )",
        ],
        vec![],
    )
}

fn create_distributed_locks() -> SqlMigration {
    SqlMigration::new(
        "0003_create_distributed_locks",
        vec![
            "CREATE TABLE IF NOT EXISTS distributed_locks (\
                 lock_key VARCHAR(255) PRIMARY KEY,\
                 holder_id VARCHAR(255) NOT NULL,\
                 expires_at TIMESTAMP NOT NULL,\
                 created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP\
             )",
            "CREATE INDEX IF NOT EXISTS idx_distributed_locks_expires_at \
                 ON distributed_locks(expires_at)",
        ],
        vec![
            "DROP INDEX IF EXISTS idx_distributed_locks_expires_at",
            "DROP TABLE IF EXISTS distributed_locks",
        ],
    )
}

fn create_unique_key_indexes() -> SqlMigration {
    SqlMigration::new(
        "0005_unique_key_indexes",
        vec![
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_config_keys_key_id ON config_keys(key_id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_config_keys_name ON config_keys(name)",
        ],
        vec![
            "DROP INDEX IF EXISTS idx_config_keys_name",
            "DROP INDEX IF EXISTS idx_config_keys_key_id",
        ],
    )
}

/// Removes legacy key rows that would break the unique indexes: rows with
/// NULL or empty `key_id` and duplicates of the same `(key_id, value)`
/// pair, keeping the lowest-id row of each group.
struct KeyRowHygiene;

#[async_trait]
impl Migration for KeyRowHygiene {
    fn id(&self) -> &str {
        "0004_key_row_hygiene"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> Result<()> {
        let nulled = sqlx::query(
            "DELETE FROM config_keys WHERE key_id IS NULL OR key_id = '' OR value IS NULL",
        )
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::Sqlx)?
        .rows_affected();

        let duplicates = sqlx::query(
            "DELETE FROM config_keys WHERE id NOT IN (\
                 SELECT MIN(id) FROM config_keys GROUP BY key_id, value\
             )",
        )
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::Sqlx)?
        .rows_affected();

        if nulled + duplicates > 0 {
            log::info!(
                "key hygiene removed {} null and {} duplicate legacy key row(s)",
                nulled,
                duplicates
            );
        }
        Ok(())
    }
}

const MAX_SUFFIX_ATTEMPTS: u32 = 1_000;

/// One-shot rename of MCP client names to the normalized form: no hyphens
/// or spaces, no leading digits, collisions suffixed from 2. Uniqueness of
/// names assigned within this transaction is tracked in process because
/// intra-transaction visibility of writes is not relied on.
struct NormalizeMcpClientNames;

#[async_trait]
impl Migration for NormalizeMcpClientNames {
    fn id(&self) -> &str {
        "0008_normalize_mcp_client_names"
    }

    async fn up(&self, conn: &mut SqliteConnection) -> Result<()> {
        let rows = sqlx::query("SELECT id, name FROM config_mcp_clients ORDER BY id")
            .fetch_all(&mut *conn)
            .await
            .map_err(DatabaseError::Sqlx)?;

        let mut assigned: HashSet<String> = HashSet::new();
        for row in rows {
            let id: i64 = row.try_get("id").map_err(DatabaseError::Sqlx)?;
            let name: String = row.try_get("name").map_err(DatabaseError::Sqlx)?;

            let base = if is_normalized_name(&name) { name.clone() } else { normalize_name(&name) };

            let mut candidate = base.clone();
            let mut suffix = 2u32;
            while assigned.contains(&candidate) {
                if suffix > MAX_SUFFIX_ATTEMPTS {
                    return Err(DatabaseError::Migration(format!(
                        "could not find a free name for mcp client {:?} after {} attempts",
                        name, MAX_SUFFIX_ATTEMPTS
                    )));
                }
                candidate = format!("{}{}", base, suffix);
                suffix += 1;
            }

            if candidate != name {
                log::info!("normalizing mcp client name {:?} -> {:?}", name, candidate);
                sqlx::query("UPDATE config_mcp_clients SET name = ? WHERE id = ?")
                    .bind(&candidate)
                    .bind(id)
                    .execute(&mut *conn)
                    .await
                    .map_err(DatabaseError::Sqlx)?;
            }
            assigned.insert(candidate);
        }
        Ok(())
    }
}
