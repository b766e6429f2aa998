//! Simple configuration entities: pricing, gateway client settings,
//! sessions, OAuth, and the singleton config blobs stored in the
//! `governance_config` bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// Per-model token pricing, synced from a published price sheet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Database-issued row id.
    #[serde(default)]
    pub id: i64,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    /// Request mode the prices apply to (chat, embedding, ...).
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_token_batches: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_token_batches: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_token_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_token_cost: Option<f64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ModelPricing {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("model pricing entry needs a model name".to_string());
        }
        if self.provider.trim().is_empty() {
            return Err(format!("model pricing entry {:?} needs a provider", self.model));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for ModelPricing {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            model: row.try_get("model")?,
            provider: row.try_get("provider")?,
            input_cost_per_token: row.try_get("input_cost_per_token")?,
            output_cost_per_token: row.try_get("output_cost_per_token")?,
            mode: row.try_get::<Option<String>, _>("mode")?.unwrap_or_default(),
            input_cost_per_token_batches: row.try_get("input_cost_per_token_batches")?,
            output_cost_per_token_batches: row.try_get("output_cost_per_token_batches")?,
            cache_read_input_token_cost: row.try_get("cache_read_input_token_cost")?,
            cache_creation_input_token_cost: row.try_get("cache_creation_input_token_cost")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Gateway-wide client behavior. Singleton row in `config_client`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub drop_excess_requests: bool,
    /// Allowed CORS origins. Set semantics.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
    #[serde(default)]
    pub enable_governance: bool,
    #[serde(default)]
    pub enforce_governance_header: bool,
    #[serde(default = "default_true")]
    pub allow_direct_keys: bool,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: 0,
            drop_excess_requests: false,
            allowed_origins: Vec::new(),
            enable_logging: true,
            enable_governance: false,
            enforce_governance_header: false,
            allow_direct_keys: true,
            config_hash: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

impl<'r> FromRow<'r, SqliteRow> for ClientConfig {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            drop_excess_requests: row.try_get("drop_excess_requests")?,
            allowed_origins: super::json_column(row, "allowed_origins")?,
            enable_logging: row.try_get("enable_logging")?,
            enable_governance: row.try_get("enable_governance")?,
            enforce_governance_header: row.try_get("enforce_governance_header")?,
            allow_direct_keys: row.try_get("allow_direct_keys")?,
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Admin auth settings. Stored in the `governance_config` bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub admin_username: String,
    /// Password hash. Sensitive.
    #[serde(default)]
    pub admin_password_hash: String,
}

/// Gateway-wide outbound proxy. Stored in the `governance_config` bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalProxyConfig {
    #[serde(rename = "type", default)]
    pub proxy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Sensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Log store wiring. Stored in the `governance_config` bucket; the store
/// implementation itself lives outside this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStoreConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store_type: String,
    /// Backend-specific settings; may carry connection secrets.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Which gateway version initialized this database. Stored in the
/// `governance_config` bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized_at: Option<DateTime<Utc>>,
}

/// Vector store wiring. Singleton row in `config_vector_store`; the store
/// implementation itself lives outside this crate.
///
/// The `config` blob is encrypted as a whole, so this type has no `FromRow`
/// impl: the store reads the raw column, decrypts, then parses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub store_type: String,
    /// Backend-specific settings; may carry connection secrets. Sensitive.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// An admin UI session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    /// Bearer token. Sensitive.
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub expires_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Session {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            user_id: row.try_get::<Option<String>, _>("user_id")?.unwrap_or_default(),
            encryption_status: row.try_get("encryption_status")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// OAuth application registration for an identity provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    /// Identity provider name, the business key.
    pub provider: String,
    #[serde(default)]
    pub client_id: String,
    /// Sensitive.
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for OAuthConfig {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            provider: row.try_get("provider")?,
            client_id: row.try_get("client_id")?,
            client_secret: row.try_get("client_secret")?,
            redirect_uri: row.try_get::<Option<String>, _>("redirect_uri")?.unwrap_or_default(),
            scopes: super::json_column(row, "scopes")?,
            config_hash: row.try_get("config_hash")?,
            encryption_status: row.try_get("encryption_status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Issued OAuth tokens for a configured provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthToken {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    /// Owning `oauth_configs.id`.
    #[serde(default)]
    pub config_id: String,
    /// Sensitive.
    #[serde(default)]
    pub access_token: String,
    /// Sensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub expires_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for OAuthToken {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            config_id: row.try_get("config_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            encryption_status: row.try_get("encryption_status")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
