//! Provider and key entities.
//!
//! A [`Provider`] is an upstream model vendor (OpenAI, Anthropic, Azure,
//! Bedrock, ...). It owns a list of [`Key`] credentials; deleting a
//! provider cascades to its keys. Key names are unique across all
//! providers, and each key denormalizes its owner's name so governance
//! lookups avoid a join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::collections::HashMap;

use crate::envref;

use super::{json_column, opt_json_column};

/// Network tuning for requests to a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Override for the provider's API base URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Extra headers attached to every upstream request.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_headers: HashMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_request_timeout_in_seconds: Option<u64>,
    /// Retry budget for transient upstream failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Worker-pool sizing for a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default)]
    pub concurrency: u32,
    #[serde(default)]
    pub buffer_size: u32,
}

/// Outbound proxy for a provider. The password may be a secret, so the
/// whole config is treated as a sensitive column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type")]
    pub proxy_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Settings for providers that speak a custom (non-built-in) protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomProviderConfig {
    /// Which built-in provider's wire format to reuse.
    pub base_provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_requests: Option<Vec<String>>,
}

/// An upstream model provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    /// Database-issued row id.
    #[serde(default)]
    pub id: i64,
    /// Unique provider name, the business key.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_and_buffer_size: Option<ConcurrencySettings>,
    /// Sensitive: may carry proxy credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_provider_config: Option<CustomProviderConfig>,
    #[serde(default)]
    pub send_back_raw_request: bool,
    #[serde(default)]
    pub send_back_raw_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_id: Option<String>,
    /// Owned keys, preloaded on read. Not a column.
    #[serde(default)]
    pub keys: Vec<Key>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    /// Entity-level invariants checked before any write.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("provider name cannot be empty".to_string());
        }
        for key in &self.keys {
            key.validate()?;
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Provider {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            network_config: opt_json_column(row, "network_config")?,
            concurrency_and_buffer_size: opt_json_column(row, "concurrency_and_buffer_size")?,
            proxy_config: opt_json_column(row, "proxy_config")?,
            custom_provider_config: opt_json_column(row, "custom_provider_config")?,
            send_back_raw_request: row.try_get("send_back_raw_request")?,
            send_back_raw_response: row.try_get("send_back_raw_response")?,
            budget_id: row.try_get("budget_id")?,
            rate_limit_id: row.try_get("rate_limit_id")?,
            keys: Vec::new(),
            config_hash: row.try_get("config_hash")?,
            encryption_status: row.try_get("encryption_status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Azure-family credential bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AzureKeyConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Model name → Azure deployment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployments: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Vertex-family credential bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexKeyConfig {
    pub project_id: String,
    #[serde(default)]
    pub region: String,
    /// Service-account JSON or an `env.NAME` reference to it.
    #[serde(default)]
    pub auth_credentials: String,
}

/// Bedrock-family credential bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BedrockKeyConfig {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    /// Model name → inference profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployments: Option<HashMap<String, String>>,
}

/// A provider credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Key {
    /// Database-issued row id. Preserved across updates so join rows and
    /// foreign keys survive.
    #[serde(default)]
    pub id: i64,
    /// External identifier, stable across replicas. The business key for
    /// upserts.
    #[serde(default)]
    pub key_id: String,
    /// Unique key name across all providers.
    pub name: String,
    /// Owning provider row id.
    #[serde(default)]
    pub provider_id: i64,
    /// Denormalized owning provider name; must match the owner.
    #[serde(default)]
    pub provider: String,
    /// The credential itself, or an `env.NAME` reference.
    #[serde(default)]
    pub value: String,
    /// Models this key may serve. Set semantics.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_for_batch_api: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_key_config: Option<AzureKeyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_key_config: Option<VertexKeyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock_key_config: Option<BedrockKeyConfig>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Key {
    /// Entity-level invariants checked before any write.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("key name cannot be empty".to_string());
        }
        if let Some(weight) = self.weight {
            if !(0.0..=1.0).contains(&weight) {
                return Err(format!(
                    "key {:?} weight must be between 0 and 1, got {}",
                    self.name, weight
                ));
            }
        }
        Ok(())
    }

    /// The credential with any `env.NAME` reference resolved. The persisted
    /// form stays the reference.
    pub fn resolved_value(&self) -> String {
        envref::resolve(&self.value)
    }
}

impl<'r> FromRow<'r, SqliteRow> for Key {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        // Credential bundles are stored flattened into columns; rebuild the
        // typed bundles here. Decryption happens later in the load hook.
        let azure_endpoint: Option<String> = row.try_get("azure_endpoint")?;
        let azure_key_config = match azure_endpoint {
            Some(endpoint) if !endpoint.is_empty() => Some(AzureKeyConfig {
                endpoint,
                api_version: row.try_get("azure_api_version")?,
                deployments: opt_json_column(row, "azure_deployments")?,
                client_id: row.try_get("azure_client_id")?,
                client_secret: row.try_get("azure_client_secret")?,
                tenant_id: row.try_get("azure_tenant_id")?,
            }),
            _ => None,
        };

        let vertex_project_id: Option<String> = row.try_get("vertex_project_id")?;
        let vertex_key_config = match vertex_project_id {
            Some(project_id) if !project_id.is_empty() => Some(VertexKeyConfig {
                project_id,
                region: row.try_get::<Option<String>, _>("vertex_region")?.unwrap_or_default(),
                auth_credentials: row
                    .try_get::<Option<String>, _>("vertex_auth_credentials")?
                    .unwrap_or_default(),
            }),
            _ => None,
        };

        let bedrock_access_key: Option<String> = row.try_get("bedrock_access_key")?;
        let bedrock_key_config = match bedrock_access_key {
            Some(access_key) if !access_key.is_empty() => Some(BedrockKeyConfig {
                access_key,
                secret_key: row
                    .try_get::<Option<String>, _>("bedrock_secret_key")?
                    .unwrap_or_default(),
                session_token: row.try_get("bedrock_session_token")?,
                region: row.try_get("bedrock_region")?,
                arn: row.try_get("bedrock_arn")?,
                deployments: opt_json_column(row, "bedrock_deployments")?,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.try_get("id")?,
            key_id: row.try_get("key_id")?,
            name: row.try_get("name")?,
            provider_id: row.try_get("provider_id")?,
            provider: row.try_get("provider")?,
            value: row.try_get("value")?,
            models: json_column(row, "models")?,
            weight: row.try_get("weight")?,
            enabled: row.try_get("enabled")?,
            use_for_batch_api: row.try_get("use_for_batch_api")?,
            azure_key_config,
            vertex_key_config,
            bedrock_key_config,
            config_hash: row.try_get("config_hash")?,
            encryption_status: row.try_get("encryption_status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validate() {
        let mut key = Key {
            name: "primary".to_string(),
            value: "sk-test".to_string(),
            ..Default::default()
        };
        assert!(key.validate().is_ok());

        key.weight = Some(1.5);
        assert!(key.validate().is_err());

        key.weight = Some(0.5);
        key.name = " ".to_string();
        assert!(key.validate().is_err());
    }

    #[test]
    fn test_resolved_value_passthrough() {
        let key = Key {
            name: "primary".to_string(),
            value: "sk-plain".to_string(),
            ..Default::default()
        };
        assert_eq!(key.resolved_value(), "sk-plain");
    }
}
