//! Plugin registration entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

/// A gateway plugin registration. Built-in plugins ship with the gateway;
/// custom plugins are loaded from a path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plugin {
    /// Database-issued row id.
    #[serde(default)]
    pub id: i64,
    /// Unique plugin name, the business key.
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Filesystem path for custom plugins; empty for built-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Arbitrary plugin settings, stored as JSON.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub version: String,
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

impl Plugin {
    /// Whether this is a custom (path-loaded) plugin. Derived, not stored.
    pub fn is_custom(&self) -> bool {
        self.path.as_deref().map_or(false, |p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("plugin name cannot be empty".to_string());
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for Plugin {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            path: row.try_get("path")?,
            config: super::json_column(row, "config")?,
            version: row.try_get::<Option<String>, _>("version")?.unwrap_or_default(),
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
