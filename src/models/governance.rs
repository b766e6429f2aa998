//! Governance entities: virtual keys and the budget / rate-limit /
//! customer / team graph around them.
//!
//! The graph is expressed through foreign keys, never object cycles. The
//! aggregate loader preloads virtual key → provider configs → key join
//! rows and virtual key → MCP configs in one direction only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use crate::duration::validate_extended_duration;

use super::json_column;

/// A bearer identifier issued to a gateway client, mapping to provider
/// configurations, budgets and rate limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualKey {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    /// Unique name, the business key.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The opaque bearer token. Sensitive.
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_id: Option<String>,
    /// Per-provider routing entries. Preloaded, not a column.
    #[serde(default)]
    pub provider_configs: Vec<VirtualKeyProviderConfig>,
    /// MCP tool grants. Preloaded, not a column.
    #[serde(default)]
    pub mcp_configs: Vec<VirtualKeyMcpConfig>,
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

impl VirtualKey {
    /// Entity-level invariants checked before any write.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("virtual key name cannot be empty".to_string());
        }
        if self.team_id.is_some() && self.customer_id.is_some() {
            return Err(format!(
                "virtual key {:?} cannot belong to both a team and a customer",
                self.name
            ));
        }
        for pc in &self.provider_configs {
            pc.validate()?;
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for VirtualKey {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get::<Option<String>, _>("description")?.unwrap_or_default(),
            value: row.try_get("value")?,
            is_active: row.try_get("is_active")?,
            team_id: row.try_get("team_id")?,
            customer_id: row.try_get("customer_id")?,
            budget_id: row.try_get("budget_id")?,
            rate_limit_id: row.try_get("rate_limit_id")?,
            provider_configs: Vec::new(),
            mcp_configs: Vec::new(),
            config_hash: row.try_get("config_hash")?,
            encryption_status: row.try_get("encryption_status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One provider a virtual key may route to, with weight, model allowlist
/// and the subset of the provider's keys it may use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualKeyProviderConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub virtual_key_id: String,
    /// Provider name this entry routes to.
    pub provider: String,
    #[serde(default)]
    pub weight: f64,
    /// Models this entry may request. Set semantics.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_id: Option<String>,
    /// External key ids usable through this entry, loaded through the
    /// explicit join table. Set semantics.
    #[serde(default)]
    pub key_ids: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl VirtualKeyProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.trim().is_empty() {
            return Err("provider config must name a provider".to_string());
        }
        if self.weight < 0.0 {
            return Err(format!(
                "provider config for {:?} has negative weight {}",
                self.provider, self.weight
            ));
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for VirtualKeyProviderConfig {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            virtual_key_id: row.try_get("virtual_key_id")?,
            provider: row.try_get("provider")?,
            weight: row.try_get("weight")?,
            allowed_models: json_column(row, "allowed_models")?,
            budget_id: row.try_get("budget_id")?,
            rate_limit_id: row.try_get("rate_limit_id")?,
            key_ids: Vec::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Row type for the explicit provider-config ↔ key join table.
///
/// The table is created by a migration rather than ORM scaffolding so
/// schema changes to it stay visible to the migration runner.
#[derive(Debug, Clone, FromRow)]
pub struct VirtualKeyProviderConfigKey {
    pub virtual_key_provider_config_id: i64,
    /// External key id (`config_keys.key_id`), not the internal row id.
    pub key_id: String,
}

/// MCP tool grant attached to a virtual key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualKeyMcpConfig {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub virtual_key_id: String,
    /// External MCP client id (`config_mcp_clients.client_id`).
    pub mcp_client_id: String,
    /// Tools the key may invoke through this client. Set semantics.
    #[serde(default)]
    pub tools_to_execute: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for VirtualKeyMcpConfig {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            virtual_key_id: row.try_get("virtual_key_id")?,
            mcp_client_id: row.try_get("mcp_client_id")?,
            tools_to_execute: json_column(row, "tools_to_execute")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Spending ceiling with a rolling reset window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Budget {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    /// Ceiling in account currency. Must be positive.
    pub max_limit: f64,
    /// Extended duration string (`1d`, `1M`, ...).
    pub reset_duration: String,
    /// Dynamic; excluded from the config hash.
    #[serde(default)]
    pub current_usage: f64,
    /// Dynamic; excluded from the config hash.
    #[serde(default = "Utc::now")]
    pub last_reset: DateTime<Utc>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_limit <= 0.0 {
            return Err(format!("budget max_limit must be positive, got {}", self.max_limit));
        }
        validate_extended_duration(&self.reset_duration)
            .map_err(|e| format!("budget reset_duration: {}", e))
    }
}

impl<'r> FromRow<'r, SqliteRow> for Budget {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            max_limit: row.try_get("max_limit")?,
            reset_duration: row.try_get("reset_duration")?,
            current_usage: row.try_get("current_usage")?,
            last_reset: row.try_get("last_reset")?,
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Token and request throughput ceilings with independent reset windows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimit {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_max_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_reset_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_max_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_reset_duration: Option<String>,
    /// Dynamic; excluded from the config hash.
    #[serde(default)]
    pub token_current_usage: i64,
    /// Dynamic; excluded from the config hash.
    #[serde(default)]
    pub request_current_usage: i64,
    /// Dynamic; excluded from the config hash.
    #[serde(default = "Utc::now")]
    pub token_last_reset: DateTime<Utc>,
    /// Dynamic; excluded from the config hash.
    #[serde(default = "Utc::now")]
    pub request_last_reset: DateTime<Utc>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl RateLimit {
    /// A max limit without its matching reset duration is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_max_limit.is_some() {
            match &self.token_reset_duration {
                None => {
                    return Err(
                        "rate limit sets token_max_limit without token_reset_duration".to_string()
                    )
                }
                Some(d) => validate_extended_duration(d)
                    .map_err(|e| format!("rate limit token_reset_duration: {}", e))?,
            }
        }
        if self.request_max_limit.is_some() {
            match &self.request_reset_duration {
                None => {
                    return Err(
                        "rate limit sets request_max_limit without request_reset_duration"
                            .to_string(),
                    )
                }
                Some(d) => validate_extended_duration(d)
                    .map_err(|e| format!("rate limit request_reset_duration: {}", e))?,
            }
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for RateLimit {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            token_max_limit: row.try_get("token_max_limit")?,
            token_reset_duration: row.try_get("token_reset_duration")?,
            request_max_limit: row.try_get("request_max_limit")?,
            request_reset_duration: row.try_get("request_reset_duration")?,
            token_current_usage: row.try_get("token_current_usage")?,
            request_current_usage: row.try_get("request_current_usage")?,
            token_last_reset: row.try_get("token_last_reset")?,
            request_last_reset: row.try_get("request_last_reset")?,
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A paying account that teams and virtual keys can hang off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Customer {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("customer name cannot be empty".to_string());
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Customer {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            budget_id: row.try_get("budget_id")?,
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A group of users under a customer, optionally carrying identity-provider
/// metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Team {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claims: Option<serde_json::Value>,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Team {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("team name cannot be empty".to_string());
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Team {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            customer_id: row.try_get("customer_id")?,
            budget_id: row.try_get("budget_id")?,
            profile: super::opt_json_column(row, "profile")?,
            config: super::opt_json_column(row, "config")?,
            claims: super::opt_json_column(row, "claims")?,
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Governance catalog entry for a model a virtual key may be granted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// UUID primary key.
    #[serde(default)]
    pub id: String,
    pub model_name: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("model_name cannot be empty".to_string());
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for ModelConfig {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            model_name: row.try_get("model_name")?,
            provider: row.try_get::<Option<String>, _>("provider")?.unwrap_or_default(),
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_key_owner_exclusivity() {
        let mut vk = VirtualKey {
            name: "analytics".to_string(),
            ..Default::default()
        };
        assert!(vk.validate().is_ok());

        vk.team_id = Some("team-1".to_string());
        assert!(vk.validate().is_ok());

        vk.customer_id = Some("customer-1".to_string());
        assert!(vk.validate().is_err());
    }

    #[test]
    fn test_budget_validate() {
        let mut budget = Budget {
            max_limit: 100.0,
            reset_duration: "1M".to_string(),
            ..Default::default()
        };
        assert!(budget.validate().is_ok());

        budget.max_limit = 0.0;
        assert!(budget.validate().is_err());

        budget.max_limit = 50.0;
        budget.reset_duration = "fortnight".to_string();
        assert!(budget.validate().is_err());
    }

    #[test]
    fn test_rate_limit_requires_matching_duration() {
        let mut rl = RateLimit {
            token_max_limit: Some(100_000),
            token_reset_duration: Some("1h".to_string()),
            ..Default::default()
        };
        assert!(rl.validate().is_ok());

        rl.request_max_limit = Some(500);
        assert!(rl.validate().is_err());

        rl.request_reset_duration = Some("1m".to_string());
        assert!(rl.validate().is_ok());
    }
}
