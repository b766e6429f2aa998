//! # Hash-Driven Reconciliation
//!
//! Loads a declarative description of the gateway's configuration, diffs
//! it against the live database using each entity's `config_hash`, and
//! applies only the minimal writes inside a single transaction — all under
//! a named distributed lock so concurrent replicas serialize.
//!
//! The diff per domain is: equal hash → untouched; differing hash →
//! upsert; present in the source but not the database → insert; present in
//! the database but not the source → delete.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::hash::ConfigHash;
use crate::lock::{LockError, LockManager};
use crate::models::{
    Budget, Customer, McpClient, ModelConfig, Plugin, Provider, RateLimit, Team, VirtualKey,
};
use crate::store::{ConfigStore, StoreError};

/// Reconcile error types
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The reconciliation lock could not be taken or released
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A store operation failed; the transaction was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The declarative source does not parse
    #[error("declarative config is invalid: {0}")]
    Parse(#[from] serde_json::Error),

    /// The declarative source could not be read
    #[error("failed to read declarative config: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

/// The critical section all reconciliation runs serialize on.
pub const RECONCILE_LOCK_KEY: &str = "gateway-config-reconcile";

/// Declarative source of truth, as loaded from the operator's config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclarativeConfig {
    #[serde(default)]
    pub budgets: Vec<Budget>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimit>,
    #[serde(default)]
    pub customers: Vec<Customer>,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub mcp_clients: Vec<McpClient>,
    #[serde(default)]
    pub virtual_keys: Vec<VirtualKey>,
    #[serde(default)]
    pub plugins: Vec<Plugin>,
    #[serde(default)]
    pub model_configs: Vec<ModelConfig>,
}

impl DeclarativeConfig {
    pub fn from_json(json: &str) -> ReconcileResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &std::path::Path) -> ReconcileResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Governance entities in the file must carry explicit ids; they are
    /// the cross-reference currency of the whole graph.
    fn validate_ids(&self) -> Result<(), StoreError> {
        let missing = |what: &str| {
            StoreError::Validation(format!("declarative {} must carry explicit ids", what))
        };
        if self.budgets.iter().any(|b| b.id.is_empty()) {
            return Err(missing("budgets"));
        }
        if self.rate_limits.iter().any(|r| r.id.is_empty()) {
            return Err(missing("rate limits"));
        }
        if self.customers.iter().any(|c| c.id.is_empty()) {
            return Err(missing("customers"));
        }
        if self.teams.iter().any(|t| t.id.is_empty()) {
            return Err(missing("teams"));
        }
        Ok(())
    }
}

/// What one reconciliation run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, plan: &DomainPlan) {
        self.created += plan.creates.len();
        self.updated += plan.updates.len();
        self.deleted += plan.deletes.len();
        self.unchanged += plan.unchanged;
    }
}

/// Index-based diff decisions for one domain. Pure data; the caller
/// executes the writes.
struct DomainPlan {
    creates: Vec<usize>,
    updates: Vec<usize>,
    deletes: Vec<String>,
    unchanged: usize,
}

/// Diff a desired entity list against the stored one by business key and
/// stored hash.
fn plan_domain<T, K, H>(desired: &[T], current: &[T], key_of: K, stored_hash: H) -> DomainPlan
where
    T: ConfigHash,
    K: Fn(&T) -> String,
    H: Fn(&T) -> String,
{
    let current_by_key: HashMap<String, &T> =
        current.iter().map(|entity| (key_of(entity), entity)).collect();

    let mut plan = DomainPlan {
        creates: Vec::new(),
        updates: Vec::new(),
        deletes: Vec::new(),
        unchanged: 0,
    };

    for (index, entity) in desired.iter().enumerate() {
        match current_by_key.get(&key_of(entity)) {
            None => plan.creates.push(index),
            Some(stored) => {
                if entity.compute_config_hash() == stored_hash(stored) {
                    plan.unchanged += 1;
                } else {
                    plan.updates.push(index);
                }
            }
        }
    }

    for entity in current {
        let key = key_of(entity);
        if !desired.iter().any(|d| key_of(d) == key) {
            plan.deletes.push(key);
        }
    }
    plan
}

/// Drift reconciler over one named critical section.
pub struct Reconciler {
    store: ConfigStore,
    locks: LockManager,
    lock_retries: u32,
}

impl Reconciler {
    pub fn new(store: ConfigStore, locks: LockManager) -> Self {
        Self {
            store,
            locks,
            lock_retries: 3,
        }
    }

    /// Reconcile the database toward `desired`. Serializes with other
    /// replicas through the distributed lock; applies every write in one
    /// transaction.
    pub async fn reconcile(
        &self,
        desired: &DeclarativeConfig,
        cancel: &CancellationToken,
    ) -> ReconcileResult<ReconcileReport> {
        desired.validate_ids()?;

        let mut lock = self.locks.lock(RECONCILE_LOCK_KEY)?;
        lock.lock_with_retry(cancel, self.lock_retries).await?;

        let result = self.apply(desired).await;

        if let Err(e) = lock.unlock().await {
            // The row expires on its own; the next run preempts it.
            log::warn!("failed to release reconciliation lock: {}", e);
        }

        let report = result?;
        log::info!(
            "reconciliation applied: {} created, {} updated, {} deleted, {} unchanged",
            report.created,
            report.updated,
            report.deleted,
            report.unchanged
        );
        Ok(report)
    }

    async fn apply(&self, desired: &DeclarativeConfig) -> ReconcileResult<ReconcileReport> {
        // Snapshot the live state. We hold the lock, so no other replica is
        // writing configuration concurrently.
        let current_budgets = self.store.list_budgets().await?;
        let current_rate_limits = self.store.list_rate_limits().await?;
        let current_customers = self.store.list_customers().await?;
        let current_teams = self.store.list_teams().await?;
        let current_providers = self.store.list_providers().await?;
        let current_mcp_clients = self.store.list_mcp_clients().await?;
        let current_virtual_keys = self.store.list_virtual_keys().await?;
        let current_plugins = self.store.list_plugins().await?;
        let current_model_configs = self.store.list_model_configs().await?;

        let mut report = ReconcileReport::default();
        let mut tx = self.store.begin().await?;

        // Referenced entities first, dependents after; deletions run inside
        // each domain after its upserts.
        let plan = plan_domain(
            &desired.budgets,
            &current_budgets,
            |b: &Budget| b.id.clone(),
            |b| b.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_budget_tx(&mut tx, &desired.budgets[i]).await?;
        }
        for id in &plan.deletes {
            ConfigStore::delete_budget_tx(&mut tx, id).await?;
        }
        report.absorb(&plan);

        let plan = plan_domain(
            &desired.rate_limits,
            &current_rate_limits,
            |r: &RateLimit| r.id.clone(),
            |r| r.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_rate_limit_tx(&mut tx, &desired.rate_limits[i]).await?;
        }
        for id in &plan.deletes {
            ConfigStore::delete_rate_limit_tx(&mut tx, id).await?;
        }
        report.absorb(&plan);

        let plan = plan_domain(
            &desired.customers,
            &current_customers,
            |c: &Customer| c.id.clone(),
            |c| c.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_customer_tx(&mut tx, &desired.customers[i]).await?;
        }
        for id in &plan.deletes {
            ConfigStore::delete_customer_tx(&mut tx, id).await?;
        }
        report.absorb(&plan);

        let plan = plan_domain(
            &desired.teams,
            &current_teams,
            |t: &Team| t.id.clone(),
            |t| t.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_team_tx(&mut tx, &desired.teams[i]).await?;
        }
        for id in &plan.deletes {
            ConfigStore::delete_team_tx(&mut tx, id).await?;
        }
        report.absorb(&plan);

        report.absorb(&self.sync_providers(&mut tx, desired, &current_providers).await?);

        let plan = plan_domain(
            &desired.mcp_clients,
            &current_mcp_clients,
            |m: &McpClient| m.client_id.clone(),
            |m| m.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_mcp_client_tx(&mut tx, &desired.mcp_clients[i]).await?;
        }
        for client_id in &plan.deletes {
            ConfigStore::delete_mcp_client_tx(&mut tx, client_id).await?;
        }
        report.absorb(&plan);

        let plan = plan_domain(
            &desired.virtual_keys,
            &current_virtual_keys,
            |vk: &VirtualKey| vk.name.clone(),
            |vk| vk.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_virtual_key_tx(&mut tx, &desired.virtual_keys[i]).await?;
        }
        for name in &plan.deletes {
            ConfigStore::delete_virtual_key_tx(&mut tx, name).await?;
        }
        report.absorb(&plan);

        let plan = plan_domain(
            &desired.plugins,
            &current_plugins,
            |p: &Plugin| p.name.clone(),
            |p| p.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_plugin_tx(&mut tx, &desired.plugins[i]).await?;
        }
        for name in &plan.deletes {
            ConfigStore::delete_plugin_tx(&mut tx, name).await?;
        }
        report.absorb(&plan);

        let plan = plan_domain(
            &desired.model_configs,
            &current_model_configs,
            |m: &ModelConfig| m.model_name.clone(),
            |m| m.config_hash.clone(),
        );
        for &i in plan.creates.iter().chain(&plan.updates) {
            ConfigStore::upsert_model_config_tx(&mut tx, &desired.model_configs[i]).await?;
        }
        for model_name in &plan.deletes {
            sqlx::query("DELETE FROM governance_model_configs WHERE model_name = ?")
                .bind(model_name)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from)?;
        }
        report.absorb(&plan);

        tx.commit().await.map_err(StoreError::from)?;
        Ok(report)
    }

    /// Providers need a composite drift check: the provider row's own hash
    /// plus the hash of each owned key, so a rotated credential triggers an
    /// update even when the provider row itself is untouched.
    async fn sync_providers(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        desired: &DeclarativeConfig,
        current: &[Provider],
    ) -> ReconcileResult<DomainPlan> {
        let mut plan = DomainPlan {
            creates: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            unchanged: 0,
        };
        let current_by_name: HashMap<&str, &Provider> =
            current.iter().map(|p| (p.name.as_str(), p)).collect();

        for (index, provider) in desired.providers.iter().enumerate() {
            match current_by_name.get(provider.name.as_str()) {
                None => plan.creates.push(index),
                Some(stored) if provider_drifted(provider, stored) => plan.updates.push(index),
                Some(_) => plan.unchanged += 1,
            }
        }
        for stored in current {
            if !desired.providers.iter().any(|p| p.name == stored.name) {
                plan.deletes.push(stored.name.clone());
            }
        }

        for &i in plan.creates.iter().chain(&plan.updates) {
            let provider = &desired.providers[i];
            let id = ConfigStore::upsert_provider_tx(&mut *tx, provider).await?;
            ConfigStore::update_provider_keys_tx(&mut *tx, id, &provider.name, &provider.keys)
                .await?;
        }
        for name in &plan.deletes {
            ConfigStore::delete_provider_tx(&mut *tx, name).await?;
        }
        Ok(plan)
    }
}

fn provider_drifted(desired: &Provider, stored: &Provider) -> bool {
    if desired.compute_config_hash() != stored.config_hash {
        return true;
    }
    if desired.keys.len() != stored.keys.len() {
        return true;
    }
    let stored_hashes: HashMap<&str, &str> = stored
        .keys
        .iter()
        .map(|k| (k.key_id.as_str(), k.config_hash.as_str()))
        .collect();
    desired.keys.iter().any(|key| {
        stored_hashes.get(key.key_id.as_str()).copied() != Some(key.compute_config_hash()).as_deref()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarative_config_parses_partial_files() {
        let config = DeclarativeConfig::from_json(
            r#"{
                "providers": [
                    {"name": "openai", "keys": [{"key_id": "u1", "name": "primary", "value": "env.OPENAI_API_KEY"}]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.providers.len(), 1);
        assert!(config.virtual_keys.is_empty());
        assert_eq!(config.providers[0].keys[0].value, "env.OPENAI_API_KEY");
    }

    #[test]
    fn test_declarative_governance_requires_ids() {
        let config = DeclarativeConfig {
            budgets: vec![Budget {
                max_limit: 10.0,
                reset_duration: "1d".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config.validate_ids().is_err());
    }

    #[test]
    fn test_plan_domain_classification() {
        let mut stored_kept = Plugin {
            name: "kept".to_string(),
            ..Default::default()
        };
        stored_kept.config_hash = stored_kept.compute_config_hash();
        let mut stored_stale = Plugin {
            name: "stale".to_string(),
            version: "1.0.0".to_string(),
            ..Default::default()
        };
        stored_stale.config_hash = stored_stale.compute_config_hash();
        let stored_dropped = Plugin {
            name: "dropped".to_string(),
            ..Default::default()
        };

        let desired = vec![
            Plugin {
                name: "kept".to_string(),
                ..Default::default()
            },
            Plugin {
                name: "stale".to_string(),
                version: "2.0.0".to_string(),
                ..Default::default()
            },
            Plugin {
                name: "brand-new".to_string(),
                ..Default::default()
            },
        ];
        let current = vec![stored_kept, stored_stale, stored_dropped];

        let plan = plan_domain(
            &desired,
            &current,
            |p: &Plugin| p.name.clone(),
            |p| p.config_hash.clone(),
        );
        assert_eq!(plan.creates, vec![2]);
        assert_eq!(plan.updates, vec![1]);
        assert_eq!(plan.deletes, vec!["dropped".to_string()]);
        assert_eq!(plan.unchanged, 1);
    }

    #[test]
    fn test_provider_drift_detects_key_rotation() {
        let mut desired = Provider {
            name: "openai".to_string(),
            keys: vec![crate::models::Key {
                key_id: "u1".to_string(),
                name: "primary".to_string(),
                value: "sk-new".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut stored = desired.clone();
        stored.config_hash = stored.compute_config_hash();
        for key in &mut stored.keys {
            key.config_hash = key.compute_config_hash();
        }
        assert!(!provider_drifted(&desired, &stored));

        desired.keys[0].value = "sk-rotated".to_string();
        assert!(provider_drifted(&desired, &stored));
    }
}
