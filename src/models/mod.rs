//! # Configuration Entities
//!
//! Row types for every configurable entity the control plane stores:
//! providers and their keys, the governance graph around virtual keys,
//! MCP clients, plugins, pricing, and the singleton gateway configs.
//!
//! Struct fields hold the *persisted* form of each column; secrets may be
//! ciphertext or `env.NAME` references depending on `encryption_status`
//! and how the row was written. The row lifecycle hooks in [`crate::hooks`]
//! translate between persisted and in-memory form.

use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub mod governance;
pub mod mcp;
pub mod misc;
pub mod plugin;
pub mod provider;

pub use governance::{
    Budget, Customer, ModelConfig, RateLimit, Team, VirtualKey, VirtualKeyMcpConfig,
    VirtualKeyProviderConfig, VirtualKeyProviderConfigKey,
};
pub use mcp::{McpClient, McpConnectionType, McpStdioConfig};
pub use misc::{
    AuthConfig, ClientConfig, FrameworkConfig, GlobalProxyConfig, LogStoreConfig, ModelPricing,
    OAuthConfig, OAuthToken, Session, VectorStoreConfig,
};
pub use plugin::Plugin;
pub use provider::{
    AzureKeyConfig, BedrockKeyConfig, ConcurrencySettings, CustomProviderConfig, Key,
    NetworkConfig, Provider, ProxyConfig, VertexKeyConfig,
};

/// `encryption_status` value for rows whose secret columns are plaintext.
pub const STATUS_PLAIN_TEXT: &str = "plain_text";

/// `encryption_status` value for rows whose secret columns are ciphertext.
pub const STATUS_ENCRYPTED: &str = "encrypted";

/// Whether an `encryption_status` column value means "pending encryption".
///
/// NULL and empty string are legacy rows written before the column existed
/// and read as `plain_text`.
pub fn is_plain_status(status: Option<&str>) -> bool {
    match status {
        None => true,
        Some(s) => s.is_empty() || s == STATUS_PLAIN_TEXT,
    }
}

/// Decode a JSON text column into a typed value.
///
/// NULL and empty string decode to the type's `Default`.
pub(crate) fn json_column<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: DeserializeOwned + Default,
{
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        None => Ok(T::default()),
        Some(text) if text.is_empty() => Ok(T::default()),
        Some(text) => serde_json::from_str(&text).map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        }),
    }
}

/// Decode an optional JSON text column; NULL and empty string become `None`.
pub(crate) fn opt_json_column<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: DeserializeOwned,
{
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        None => Ok(None),
        Some(text) if text.is_empty() => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: column.to_string(),
                source: Box::new(e),
            }),
    }
}

/// Serialize a value for storage in a JSON text column.
pub(crate) fn to_json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Serialize an optional value; `None` is stored as SQL NULL.
pub(crate) fn opt_to_json_text<T: serde::Serialize>(value: &Option<T>) -> Option<String> {
    value.as_ref().map(to_json_text)
}
