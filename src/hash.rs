//! # Config Hashing
//!
//! Deterministic SHA-256 fingerprints over entity content, used to detect
//! drift between a declarative source and the live database without deep
//! comparisons.
//!
//! The contract, applied uniformly:
//! - Dynamic fields never participate: database-issued ids, timestamps,
//!   usage counters, preloaded relationship objects, `encryption_status`.
//! - Set-valued fields are sorted before hashing, so the hash is
//!   order-independent over sets.
//! - Composite values are projected to a canonical struct and serialized
//!   with `serde_json` (struct field order is fixed by declaration).
//! - Boolean flags are tagged (`"enabled:true"`) and optional id fields are
//!   tag-prefixed (`"teamID:..."`) so absent and empty never collide.
//! - Hashes are computed over *pre-encryption* semantics; encrypting a row
//!   never changes its hash.

use serde::Serialize;

use crate::crypto::sha256_hex;
use crate::models::{
    Budget, ClientConfig, Customer, Key, McpClient, ModelConfig, OAuthConfig, Plugin, Provider,
    RateLimit, Team, VectorStoreConfig, VirtualKey, VirtualKeyMcpConfig, VirtualKeyProviderConfig,
};

/// Entities that carry a `config_hash` column implement this.
pub trait ConfigHash {
    /// Compute the canonical content hash for this entity.
    fn compute_config_hash(&self) -> String;
}

const SEPARATOR: &str = "|";

fn finish(parts: Vec<String>) -> String {
    sha256_hex(parts.join(SEPARATOR).as_bytes())
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut copy = values.to_vec();
    copy.sort();
    copy
}

fn push_flag(parts: &mut Vec<String>, tag: &str, value: bool) {
    parts.push(format!("{}:{}", tag, value));
}

fn push_opt_tag(parts: &mut Vec<String>, tag: &str, value: &Option<String>) {
    if let Some(v) = value {
        if !v.is_empty() {
            parts.push(format!("{}:{}", tag, v));
        }
    }
}

fn push_json<T: Serialize>(parts: &mut Vec<String>, tag: &str, value: &T) {
    if let Ok(serialized) = serde_json::to_string(value) {
        parts.push(format!("{}:{}", tag, serialized));
    }
}

fn push_opt_json<T: Serialize>(parts: &mut Vec<String>, tag: &str, value: &Option<T>) {
    if let Some(v) = value {
        push_json(parts, tag, v);
    }
}

impl ConfigHash for Key {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![self.name.clone(), self.value.clone()];
        parts.extend(sorted(&self.models));
        if let Some(weight) = self.weight {
            parts.push(format!("weight:{}", weight));
        }
        push_opt_json(&mut parts, "azure", &self.azure_key_config);
        push_opt_json(&mut parts, "vertex", &self.vertex_key_config);
        push_opt_json(&mut parts, "bedrock", &self.bedrock_key_config);
        push_flag(&mut parts, "enabled", self.enabled);
        push_flag(&mut parts, "useForBatchAPI", self.use_for_batch_api);
        finish(parts)
    }
}

impl ConfigHash for Provider {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![self.name.clone()];
        push_opt_json(&mut parts, "network", &self.network_config);
        push_opt_json(&mut parts, "concurrency", &self.concurrency_and_buffer_size);
        push_opt_json(&mut parts, "proxy", &self.proxy_config);
        push_opt_json(&mut parts, "custom", &self.custom_provider_config);
        push_flag(&mut parts, "sendBackRawRequest", self.send_back_raw_request);
        push_flag(&mut parts, "sendBackRawResponse", self.send_back_raw_response);
        push_opt_tag(&mut parts, "budgetID", &self.budget_id);
        push_opt_tag(&mut parts, "rateLimitID", &self.rate_limit_id);
        finish(parts)
    }
}

/// Canonical projection of one virtual-key provider config.
#[derive(Serialize)]
struct ProviderConfigProjection {
    provider: String,
    weight: f64,
    allowed_models: Vec<String>,
    budget_id: String,
    rate_limit_id: String,
    key_ids: Vec<String>,
}

impl ProviderConfigProjection {
    fn of(pc: &VirtualKeyProviderConfig) -> Self {
        Self {
            provider: pc.provider.clone(),
            weight: pc.weight,
            allowed_models: sorted(&pc.allowed_models),
            budget_id: pc.budget_id.clone().unwrap_or_default(),
            rate_limit_id: pc.rate_limit_id.clone().unwrap_or_default(),
            key_ids: sorted(&pc.key_ids),
        }
    }
}

/// Canonical projection of one virtual-key MCP config.
#[derive(Serialize)]
struct McpConfigProjection {
    mcp_client_id: String,
    tools_to_execute: Vec<String>,
}

impl McpConfigProjection {
    fn of(mc: &VirtualKeyMcpConfig) -> Self {
        Self {
            mcp_client_id: mc.mcp_client_id.clone(),
            tools_to_execute: sorted(&mc.tools_to_execute),
        }
    }
}

impl ConfigHash for VirtualKey {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![self.name.clone(), self.description.clone()];
        push_flag(&mut parts, "isActive", self.is_active);
        push_opt_tag(&mut parts, "teamID", &self.team_id);
        push_opt_tag(&mut parts, "customerID", &self.customer_id);
        push_opt_tag(&mut parts, "budgetID", &self.budget_id);
        push_opt_tag(&mut parts, "rateLimitID", &self.rate_limit_id);

        let mut provider_configs: Vec<ProviderConfigProjection> = self
            .provider_configs
            .iter()
            .map(ProviderConfigProjection::of)
            .collect();
        provider_configs.sort_by(|a, b| {
            a.provider
                .cmp(&b.provider)
                .then_with(|| a.budget_id.cmp(&b.budget_id))
                .then_with(|| a.rate_limit_id.cmp(&b.rate_limit_id))
                .then_with(|| a.weight.total_cmp(&b.weight))
        });
        push_json(&mut parts, "providerConfigs", &provider_configs);

        let mut mcp_configs: Vec<McpConfigProjection> =
            self.mcp_configs.iter().map(McpConfigProjection::of).collect();
        mcp_configs.sort_by(|a, b| a.mcp_client_id.cmp(&b.mcp_client_id));
        push_json(&mut parts, "mcpConfigs", &mcp_configs);

        finish(parts)
    }
}

impl ConfigHash for Budget {
    fn compute_config_hash(&self) -> String {
        let parts = vec![
            format!("maxLimit:{}", self.max_limit),
            format!("resetDuration:{}", self.reset_duration),
        ];
        finish(parts)
    }
}

impl ConfigHash for RateLimit {
    fn compute_config_hash(&self) -> String {
        let mut parts = Vec::new();
        if let Some(limit) = self.token_max_limit {
            parts.push(format!("tokenMaxLimit:{}", limit));
        }
        push_opt_tag(&mut parts, "tokenResetDuration", &self.token_reset_duration);
        if let Some(limit) = self.request_max_limit {
            parts.push(format!("requestMaxLimit:{}", limit));
        }
        push_opt_tag(&mut parts, "requestResetDuration", &self.request_reset_duration);
        finish(parts)
    }
}

impl ConfigHash for Customer {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![self.name.clone()];
        push_opt_tag(&mut parts, "budgetID", &self.budget_id);
        finish(parts)
    }
}

impl ConfigHash for Team {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![self.name.clone()];
        push_opt_tag(&mut parts, "customerID", &self.customer_id);
        push_opt_tag(&mut parts, "budgetID", &self.budget_id);
        push_opt_json(&mut parts, "profile", &self.profile);
        push_opt_json(&mut parts, "config", &self.config);
        push_opt_json(&mut parts, "claims", &self.claims);
        finish(parts)
    }
}

impl ConfigHash for ModelConfig {
    fn compute_config_hash(&self) -> String {
        finish(vec![self.model_name.clone(), self.provider.clone()])
    }
}

impl ConfigHash for McpClient {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![
            self.client_id.clone(),
            self.name.clone(),
            self.connection_type.as_str().to_string(),
        ];
        push_opt_tag(&mut parts, "connectionString", &self.connection_string);
        push_opt_json(&mut parts, "stdio", &self.stdio_config);
        parts.extend(sorted(&self.tools_to_execute));
        parts.extend(sorted(&self.tools_to_auto_execute));

        // Headers with sorted keys; values marked env: or val: so an env
        // reference and a literal of the same spelling hash differently.
        let mut header_keys: Vec<&String> = self.headers.keys().collect();
        header_keys.sort();
        for key in header_keys {
            let value = &self.headers[key];
            let marker = if crate::envref::is_env_ref(value) { "env" } else { "val" };
            parts.push(format!("{}={}:{}", key, marker, value));
        }

        push_flag(&mut parts, "isCodeModeClient", self.is_code_mode_client);
        finish(parts)
    }
}

impl ConfigHash for Plugin {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![self.name.clone()];
        push_flag(&mut parts, "enabled", self.enabled);
        push_opt_tag(&mut parts, "path", &self.path);
        push_json(&mut parts, "config", &self.config);
        parts.push(format!("version:{}", self.version));
        finish(parts)
    }
}

impl ConfigHash for ClientConfig {
    fn compute_config_hash(&self) -> String {
        let mut parts = Vec::new();
        push_flag(&mut parts, "dropExcessRequests", self.drop_excess_requests);
        parts.extend(sorted(&self.allowed_origins));
        push_flag(&mut parts, "enableLogging", self.enable_logging);
        push_flag(&mut parts, "enableGovernance", self.enable_governance);
        push_flag(&mut parts, "enforceGovernanceHeader", self.enforce_governance_header);
        push_flag(&mut parts, "allowDirectKeys", self.allow_direct_keys);
        finish(parts)
    }
}

impl ConfigHash for VectorStoreConfig {
    fn compute_config_hash(&self) -> String {
        let mut parts = Vec::new();
        push_flag(&mut parts, "enabled", self.enabled);
        parts.push(format!("type:{}", self.store_type));
        push_json(&mut parts, "config", &self.config);
        finish(parts)
    }
}

impl ConfigHash for OAuthConfig {
    fn compute_config_hash(&self) -> String {
        let mut parts = vec![
            self.provider.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
            self.redirect_uri.clone(),
        ];
        parts.extend(sorted(&self.scopes));
        finish(parts)
    }
}
