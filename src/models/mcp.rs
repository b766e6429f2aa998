//! MCP client entities.
//!
//! An MCP client is a configured connection to a Model Context Protocol
//! endpoint. Client names double as identifiers in tool invocations, so
//! they are normalized: no hyphens or spaces, no leading digits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::collections::HashMap;

use super::{json_column, opt_json_column};

/// How an MCP client reaches its endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpConnectionType {
    #[default]
    Http,
    Sse,
    Stdio,
}

impl McpConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpConnectionType::Http => "http",
            McpConnectionType::Sse => "sse",
            McpConnectionType::Stdio => "stdio",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "http" => Ok(McpConnectionType::Http),
            "sse" => Ok(McpConnectionType::Sse),
            "stdio" => Ok(McpConnectionType::Stdio),
            other => Err(format!("unknown MCP connection type {:?}", other)),
        }
    }
}

/// Subprocess launch settings for stdio-connected clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpStdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<String>,
}

/// A configured MCP endpoint with its tool permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpClient {
    /// Database-issued row id.
    #[serde(default)]
    pub id: i64,
    /// External UUID, the business key for upserts.
    #[serde(default)]
    pub client_id: String,
    /// Unique normalized name.
    pub name: String,
    #[serde(default)]
    pub connection_type: McpConnectionType,
    /// URL for http/sse clients. Sensitive; may be an `env.NAME` reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Sensitive: subprocess env may carry secrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdio_config: Option<McpStdioConfig>,
    /// Request headers; values may be secrets or `env.NAME` references.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Tools a caller may invoke. Set semantics.
    #[serde(default)]
    pub tools_to_execute: Vec<String>,
    /// Tools invoked without confirmation. Set semantics.
    #[serde(default)]
    pub tools_to_auto_execute: Vec<String>,
    #[serde(default)]
    pub is_code_mode_client: bool,
    #[serde(default)]
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_status: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl McpClient {
    /// Entity-level invariants checked before any write.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("mcp client name cannot be empty".to_string());
        }
        if !is_normalized_name(&self.name) {
            return Err(format!(
                "mcp client name {:?} must not contain hyphens or spaces or start with a digit",
                self.name
            ));
        }
        match self.connection_type {
            McpConnectionType::Stdio => {
                if self.stdio_config.as_ref().map_or(true, |c| c.command.is_empty()) {
                    return Err(format!(
                        "stdio mcp client {:?} requires a stdio_config with a command",
                        self.name
                    ));
                }
            }
            McpConnectionType::Http | McpConnectionType::Sse => {
                if self.connection_string.as_deref().unwrap_or("").is_empty() {
                    return Err(format!(
                        "{} mcp client {:?} requires a connection_string",
                        self.connection_type.as_str(),
                        self.name
                    ));
                }
            }
        }
        Ok(())
    }
}

impl<'r> FromRow<'r, SqliteRow> for McpClient {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let connection_type: String = row.try_get("connection_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            client_id: row.try_get("client_id")?,
            name: row.try_get("name")?,
            connection_type: McpConnectionType::parse(&connection_type).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "connection_type".to_string(),
                    source: e.into(),
                }
            })?,
            connection_string: row.try_get("connection_string")?,
            stdio_config: opt_json_column(row, "stdio_config")?,
            headers: json_column(row, "headers")?,
            tools_to_execute: json_column(row, "tools_to_execute")?,
            tools_to_auto_execute: json_column(row, "tools_to_auto_execute")?,
            is_code_mode_client: row.try_get("is_code_mode_client")?,
            config_hash: row.try_get("config_hash")?,
            encryption_status: row.try_get("encryption_status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Whether a name already satisfies the normalization rules.
pub fn is_normalized_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('-')
        && !name.contains(' ')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

/// Fallback name used when normalization strips a name to nothing.
pub const FALLBACK_CLIENT_NAME: &str = "mcp_client";

/// Normalize an MCP client name: hyphens and spaces become underscores,
/// leading digits are stripped (along with the separator underscores they
/// leave behind), and an emptied name falls back to [`FALLBACK_CLIENT_NAME`].
pub fn normalize_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect();

    let mut rest = replaced.as_str();
    let had_leading_digits = rest.starts_with(|c: char| c.is_ascii_digit());
    rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    if had_leading_digits {
        rest = rest.trim_start_matches('_');
        // Digits may reappear after the separators ("2_3prod").
        while rest.starts_with(|c: char| c.is_ascii_digit()) {
            rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            rest = rest.trim_start_matches('_');
        }
    }

    if rest.is_empty() {
        FALLBACK_CLIENT_NAME.to_string()
    } else {
        rest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("prod-1"), "prod_1");
        assert_eq!(normalize_name("2-prod"), "prod");
        assert_eq!(normalize_name("2_prod"), "prod");
        assert_eq!(normalize_name("my client"), "my_client");
        assert_eq!(normalize_name("already_fine"), "already_fine");
        assert_eq!(normalize_name("42"), FALLBACK_CLIENT_NAME);
        assert_eq!(normalize_name(""), FALLBACK_CLIENT_NAME);
    }

    #[test]
    fn test_is_normalized_name() {
        assert!(is_normalized_name("prod_1"));
        assert!(!is_normalized_name("prod-1"));
        assert!(!is_normalized_name("2prod"));
        assert!(!is_normalized_name("my client"));
        assert!(!is_normalized_name(""));
    }

    #[test]
    fn test_validate_connection_requirements() {
        let mut client = McpClient {
            name: "tools".to_string(),
            connection_type: McpConnectionType::Http,
            ..Default::default()
        };
        assert!(client.validate().is_err());

        client.connection_string = Some("https://mcp.example.com".to_string());
        assert!(client.validate().is_ok());

        client.connection_type = McpConnectionType::Stdio;
        assert!(client.validate().is_err());

        client.stdio_config = Some(McpStdioConfig {
            command: "npx".to_string(),
            args: vec!["run".to_string()],
            envs: Vec::new(),
        });
        assert!(client.validate().is_ok());
    }
}
