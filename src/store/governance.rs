//! Governance CRUD: budgets, rate limits, customers, teams, model
//! configs, and the virtual-key aggregate.
//!
//! The virtual-key aggregate loader preloads the whole graph in one
//! direction (virtual key → provider configs → key-id join rows, virtual
//! key → MCP configs) and groups rows in memory, so no object cycles ever
//! form.

use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::hash::ConfigHash;
use crate::hooks;
use crate::models::{
    to_json_text, Budget, Customer, ModelConfig, RateLimit, Team, VirtualKey,
    VirtualKeyMcpConfig, VirtualKeyProviderConfig, VirtualKeyProviderConfigKey,
};

use super::{ConfigStore, StoreError, StoreResult};

impl ConfigStore {
    // ---- budgets ----

    pub async fn create_budget(&self, budget: &Budget) -> StoreResult<Budget> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_budget_tx(&mut tx, budget).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_budget(&id).await
    }

    pub async fn get_budget(&self, id: &str) -> StoreResult<Budget> {
        sqlx::query_as::<_, Budget>("SELECT * FROM governance_budgets WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("budget {:?}", id)))
    }

    pub async fn list_budgets(&self) -> StoreResult<Vec<Budget>> {
        Ok(sqlx::query_as::<_, Budget>("SELECT * FROM governance_budgets ORDER BY id")
            .fetch_all(self.pool().inner())
            .await?)
    }

    pub async fn delete_budget(&self, id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM governance_budgets WHERE id = ?")
            .bind(id)
            .execute(self.pool().inner())
            .await?;
        if result.rows_affected() > 0 {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("budget {:?}", id)))
        }
    }

    /// Upsert a budget by id; dynamic usage columns are preserved on
    /// update. Returns the id.
    pub async fn upsert_budget_tx(
        conn: &mut SqliteConnection,
        budget: &Budget,
    ) -> StoreResult<String> {
        budget.validate().map_err(StoreError::Validation)?;
        let id = if budget.id.is_empty() { Uuid::new_v4().to_string() } else { budget.id.clone() };
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO governance_budgets \
                 (id, max_limit, reset_duration, current_usage, last_reset, config_hash, \
                  created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 max_limit = excluded.max_limit, \
                 reset_duration = excluded.reset_duration, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(budget.max_limit)
        .bind(&budget.reset_duration)
        .bind(budget.current_usage)
        .bind(budget.last_reset)
        .bind(budget.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(id)
    }

    pub async fn delete_budget_tx(conn: &mut SqliteConnection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM governance_budgets WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- rate limits ----

    pub async fn create_rate_limit(&self, rate_limit: &RateLimit) -> StoreResult<RateLimit> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_rate_limit_tx(&mut tx, rate_limit).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_rate_limit(&id).await
    }

    pub async fn get_rate_limit(&self, id: &str) -> StoreResult<RateLimit> {
        sqlx::query_as::<_, RateLimit>("SELECT * FROM governance_rate_limits WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rate limit {:?}", id)))
    }

    pub async fn list_rate_limits(&self) -> StoreResult<Vec<RateLimit>> {
        Ok(
            sqlx::query_as::<_, RateLimit>("SELECT * FROM governance_rate_limits ORDER BY id")
                .fetch_all(self.pool().inner())
                .await?,
        )
    }

    pub async fn upsert_rate_limit_tx(
        conn: &mut SqliteConnection,
        rate_limit: &RateLimit,
    ) -> StoreResult<String> {
        rate_limit.validate().map_err(StoreError::Validation)?;
        let id =
            if rate_limit.id.is_empty() { Uuid::new_v4().to_string() } else { rate_limit.id.clone() };
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO governance_rate_limits \
                 (id, token_max_limit, token_reset_duration, request_max_limit, \
                  request_reset_duration, token_current_usage, request_current_usage, \
                  token_last_reset, request_last_reset, config_hash, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 token_max_limit = excluded.token_max_limit, \
                 token_reset_duration = excluded.token_reset_duration, \
                 request_max_limit = excluded.request_max_limit, \
                 request_reset_duration = excluded.request_reset_duration, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(rate_limit.token_max_limit)
        .bind(&rate_limit.token_reset_duration)
        .bind(rate_limit.request_max_limit)
        .bind(&rate_limit.request_reset_duration)
        .bind(rate_limit.token_current_usage)
        .bind(rate_limit.request_current_usage)
        .bind(rate_limit.token_last_reset)
        .bind(rate_limit.request_last_reset)
        .bind(rate_limit.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(id)
    }

    pub async fn delete_rate_limit_tx(conn: &mut SqliteConnection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM governance_rate_limits WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- customers ----

    pub async fn create_customer(&self, customer: &Customer) -> StoreResult<Customer> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_customer_tx(&mut tx, customer).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_customer(&id).await
    }

    pub async fn get_customer(&self, id: &str) -> StoreResult<Customer> {
        sqlx::query_as::<_, Customer>("SELECT * FROM governance_customers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("customer {:?}", id)))
    }

    pub async fn list_customers(&self) -> StoreResult<Vec<Customer>> {
        Ok(
            sqlx::query_as::<_, Customer>("SELECT * FROM governance_customers ORDER BY id")
                .fetch_all(self.pool().inner())
                .await?,
        )
    }

    pub async fn upsert_customer_tx(
        conn: &mut SqliteConnection,
        customer: &Customer,
    ) -> StoreResult<String> {
        customer.validate().map_err(StoreError::Validation)?;
        if let Some(budget_id) = &customer.budget_id {
            ensure_budget_exists(&mut *conn, budget_id).await?;
        }

        let id =
            if customer.id.is_empty() { Uuid::new_v4().to_string() } else { customer.id.clone() };
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO governance_customers \
                 (id, name, budget_id, config_hash, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 budget_id = excluded.budget_id, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&customer.name)
        .bind(&customer.budget_id)
        .bind(customer.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(id)
    }

    pub async fn delete_customer_tx(conn: &mut SqliteConnection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM governance_customers WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- teams ----

    pub async fn create_team(&self, team: &Team) -> StoreResult<Team> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_team_tx(&mut tx, team).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_team(&id).await
    }

    pub async fn get_team(&self, id: &str) -> StoreResult<Team> {
        sqlx::query_as::<_, Team>("SELECT * FROM governance_teams WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("team {:?}", id)))
    }

    pub async fn list_teams(&self) -> StoreResult<Vec<Team>> {
        Ok(sqlx::query_as::<_, Team>("SELECT * FROM governance_teams ORDER BY id")
            .fetch_all(self.pool().inner())
            .await?)
    }

    pub async fn upsert_team_tx(conn: &mut SqliteConnection, team: &Team) -> StoreResult<String> {
        team.validate().map_err(StoreError::Validation)?;
        if let Some(customer_id) = &team.customer_id {
            let exists: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM governance_customers WHERE id = ?")
                    .bind(customer_id)
                    .fetch_one(&mut *conn)
                    .await?;
            if exists == 0 {
                return Err(StoreError::Validation(format!(
                    "team {:?} references missing customer {:?}",
                    team.name, customer_id
                )));
            }
        }
        if let Some(budget_id) = &team.budget_id {
            ensure_budget_exists(&mut *conn, budget_id).await?;
        }

        let id = if team.id.is_empty() { Uuid::new_v4().to_string() } else { team.id.clone() };
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO governance_teams \
                 (id, name, customer_id, budget_id, profile, config, claims, config_hash, \
                  created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 customer_id = excluded.customer_id, \
                 budget_id = excluded.budget_id, \
                 profile = excluded.profile, \
                 config = excluded.config, \
                 claims = excluded.claims, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&team.name)
        .bind(&team.customer_id)
        .bind(&team.budget_id)
        .bind(team.profile.as_ref().map(to_json_text))
        .bind(team.config.as_ref().map(to_json_text))
        .bind(team.claims.as_ref().map(to_json_text))
        .bind(team.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(id)
    }

    pub async fn delete_team_tx(conn: &mut SqliteConnection, id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM governance_teams WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- model configs ----

    pub async fn upsert_model_config(&self, config: &ModelConfig) -> StoreResult<ModelConfig> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_model_config_tx(&mut tx, config).await?;
        tx.commit().await.map_err(StoreError::from)?;
        sqlx::query_as::<_, ModelConfig>("SELECT * FROM governance_model_configs WHERE id = ?")
            .bind(&id)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("model config {:?}", id)))
    }

    pub async fn list_model_configs(&self) -> StoreResult<Vec<ModelConfig>> {
        Ok(sqlx::query_as::<_, ModelConfig>(
            "SELECT * FROM governance_model_configs ORDER BY model_name",
        )
        .fetch_all(self.pool().inner())
        .await?)
    }

    pub async fn upsert_model_config_tx(
        conn: &mut SqliteConnection,
        config: &ModelConfig,
    ) -> StoreResult<String> {
        config.validate().map_err(StoreError::Validation)?;
        let id = if config.id.is_empty() { Uuid::new_v4().to_string() } else { config.id.clone() };
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO governance_model_configs \
                 (id, model_name, provider, config_hash, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 model_name = excluded.model_name, \
                 provider = excluded.provider, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&config.model_name)
        .bind(&config.provider)
        .bind(config.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(id)
    }

    // ---- virtual keys ----

    /// Insert a new virtual key with its provider and MCP configs.
    pub async fn create_virtual_key(&self, vk: &VirtualKey) -> StoreResult<VirtualKey> {
        let mut tx = self.begin().await?;
        let id = Self::upsert_virtual_key_tx(&mut tx, vk).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_virtual_key_by_id(&id).await
    }

    /// Upsert a virtual key by name, replacing its child configs.
    pub async fn update_virtual_key(&self, vk: &VirtualKey) -> StoreResult<VirtualKey> {
        self.create_virtual_key(vk).await
    }

    pub async fn get_virtual_key(&self, name: &str) -> StoreResult<VirtualKey> {
        let vk = sqlx::query_as::<_, VirtualKey>(
            "SELECT * FROM governance_virtual_keys WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(self.pool().inner())
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("virtual key {:?}", name)))?;
        self.finish_virtual_key(vk).await
    }

    pub async fn get_virtual_key_by_id(&self, id: &str) -> StoreResult<VirtualKey> {
        let vk =
            sqlx::query_as::<_, VirtualKey>("SELECT * FROM governance_virtual_keys WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool().inner())
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("virtual key {:?}", id)))?;
        self.finish_virtual_key(vk).await
    }

    async fn finish_virtual_key(&self, mut vk: VirtualKey) -> StoreResult<VirtualKey> {
        hooks::after_load_virtual_key(&mut vk)?;
        let mut graph = self.load_virtual_key_graph().await?;
        vk.provider_configs = graph.provider_configs.remove(&vk.id).unwrap_or_default();
        vk.mcp_configs = graph.mcp_configs.remove(&vk.id).unwrap_or_default();
        Ok(vk)
    }

    /// The governance aggregate: every virtual key with its transitive
    /// relationships preloaded. This is the reconciliation read path.
    pub async fn list_virtual_keys(&self) -> StoreResult<Vec<VirtualKey>> {
        let mut vks =
            sqlx::query_as::<_, VirtualKey>("SELECT * FROM governance_virtual_keys ORDER BY name")
                .fetch_all(self.pool().inner())
                .await?;

        let mut graph = self.load_virtual_key_graph().await?;
        for vk in &mut vks {
            hooks::after_load_virtual_key(vk)?;
            vk.provider_configs = graph.provider_configs.remove(&vk.id).unwrap_or_default();
            vk.mcp_configs = graph.mcp_configs.remove(&vk.id).unwrap_or_default();
        }
        Ok(vks)
    }

    /// Virtual keys projected to non-secret columns (no bearer token).
    pub async fn list_redacted_virtual_keys(&self) -> StoreResult<Vec<VirtualKey>> {
        let mut vks = sqlx::query_as::<_, VirtualKey>(
            "SELECT id, name, description, '' AS value, is_active, team_id, customer_id, \
                    budget_id, rate_limit_id, config_hash, encryption_status, \
                    created_at, updated_at \
             FROM governance_virtual_keys ORDER BY name",
        )
        .fetch_all(self.pool().inner())
        .await?;

        let mut graph = self.load_virtual_key_graph().await?;
        for vk in &mut vks {
            vk.provider_configs = graph.provider_configs.remove(&vk.id).unwrap_or_default();
            vk.mcp_configs = graph.mcp_configs.remove(&vk.id).unwrap_or_default();
        }
        Ok(vks)
    }

    pub async fn delete_virtual_key(&self, name: &str) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let deleted = Self::delete_virtual_key_tx(&mut tx, name).await?;
        tx.commit().await.map_err(StoreError::from)?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("virtual key {:?}", name)))
        }
    }

    /// Upsert a virtual key and replace its children. Validates ownership
    /// exclusivity, referenced governance rows, and that every key id in
    /// the provider configs resolves to a stored key. Returns the id.
    pub async fn upsert_virtual_key_tx(
        conn: &mut SqliteConnection,
        vk: &VirtualKey,
    ) -> StoreResult<String> {
        vk.validate().map_err(StoreError::Validation)?;

        if let Some(team_id) = &vk.team_id {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM governance_teams WHERE id = ?")
                .bind(team_id)
                .fetch_one(&mut *conn)
                .await?;
            if exists == 0 {
                return Err(StoreError::Validation(format!(
                    "virtual key {:?} references missing team {:?}",
                    vk.name, team_id
                )));
            }
        }
        if let Some(customer_id) = &vk.customer_id {
            let exists: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM governance_customers WHERE id = ?")
                    .bind(customer_id)
                    .fetch_one(&mut *conn)
                    .await?;
            if exists == 0 {
                return Err(StoreError::Validation(format!(
                    "virtual key {:?} references missing customer {:?}",
                    vk.name, customer_id
                )));
            }
        }
        if let Some(budget_id) = &vk.budget_id {
            ensure_budget_exists(&mut *conn, budget_id).await?;
        }

        // Every referenced key must exist before any join row is written.
        let mut unresolved = Vec::new();
        for pc in &vk.provider_configs {
            for key_id in &pc.key_ids {
                let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM config_keys WHERE key_id = ?")
                    .bind(key_id)
                    .fetch_one(&mut *conn)
                    .await?;
                if exists == 0 {
                    unresolved.push(key_id.clone());
                }
            }
        }
        if !unresolved.is_empty() {
            unresolved.sort();
            unresolved.dedup();
            return Err(StoreError::UnresolvedKeys(unresolved));
        }

        let id = if vk.id.is_empty() {
            // An upsert by name must reuse the existing row id.
            let existing: Option<String> =
                sqlx::query_scalar("SELECT id FROM governance_virtual_keys WHERE name = ?")
                    .bind(&vk.name)
                    .fetch_optional(&mut *conn)
                    .await?;
            existing.unwrap_or_else(|| Uuid::new_v4().to_string())
        } else {
            vk.id.clone()
        };

        let row = hooks::before_save_virtual_key(vk)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO governance_virtual_keys \
                 (id, name, description, value, is_active, team_id, customer_id, budget_id, \
                  rate_limit_id, config_hash, encryption_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 name = excluded.name, \
                 description = excluded.description, \
                 value = excluded.value, \
                 is_active = excluded.is_active, \
                 team_id = excluded.team_id, \
                 customer_id = excluded.customer_id, \
                 budget_id = excluded.budget_id, \
                 rate_limit_id = excluded.rate_limit_id, \
                 config_hash = excluded.config_hash, \
                 encryption_status = excluded.encryption_status, \
                 updated_at = excluded.updated_at",
        )
        .bind(&id)
        .bind(&row.name)
        .bind(&row.description)
        .bind(&row.value)
        .bind(row.is_active)
        .bind(&row.team_id)
        .bind(&row.customer_id)
        .bind(&row.budget_id)
        .bind(&row.rate_limit_id)
        .bind(&row.config_hash)
        .bind(&row.encryption_status)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        // Children are replaced wholesale; their ids are not business keys.
        sqlx::query(
            "DELETE FROM governance_virtual_key_provider_config_keys \
             WHERE virtual_key_provider_config_id IN \
                 (SELECT id FROM governance_virtual_key_provider_configs WHERE virtual_key_id = ?)",
        )
        .bind(&id)
        .execute(&mut *conn)
        .await?;
        sqlx::query("DELETE FROM governance_virtual_key_provider_configs WHERE virtual_key_id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM governance_virtual_key_mcp_configs WHERE virtual_key_id = ?")
            .bind(&id)
            .execute(&mut *conn)
            .await?;

        for pc in &vk.provider_configs {
            let result = sqlx::query(
                "INSERT INTO governance_virtual_key_provider_configs \
                     (virtual_key_id, provider, weight, allowed_models, budget_id, rate_limit_id, \
                      created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&pc.provider)
            .bind(pc.weight)
            .bind(to_json_text(&pc.allowed_models))
            .bind(&pc.budget_id)
            .bind(&pc.rate_limit_id)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            let pc_id = result.last_insert_rowid();

            let mut seen: HashSet<&String> = HashSet::new();
            for key_id in &pc.key_ids {
                if !seen.insert(key_id) {
                    continue;
                }
                sqlx::query(
                    "INSERT INTO governance_virtual_key_provider_config_keys \
                         (virtual_key_provider_config_id, key_id) \
                     VALUES (?, ?)",
                )
                .bind(pc_id)
                .bind(key_id)
                .execute(&mut *conn)
                .await?;
            }
        }

        for mc in &vk.mcp_configs {
            sqlx::query(
                "INSERT INTO governance_virtual_key_mcp_configs \
                     (virtual_key_id, mcp_client_id, tools_to_execute, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&mc.mcp_client_id)
            .bind(to_json_text(&mc.tools_to_execute))
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        Ok(id)
    }

    pub async fn delete_virtual_key_tx(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> StoreResult<bool> {
        // Children cascade via foreign keys.
        let result = sqlx::query("DELETE FROM governance_virtual_keys WHERE name = ?")
            .bind(name)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_virtual_key_graph(&self) -> StoreResult<VirtualKeyGraph> {
        let mut provider_configs = sqlx::query_as::<_, VirtualKeyProviderConfig>(
            "SELECT * FROM governance_virtual_key_provider_configs ORDER BY id",
        )
        .fetch_all(self.pool().inner())
        .await?;

        let join_rows = sqlx::query_as::<_, VirtualKeyProviderConfigKey>(
            "SELECT virtual_key_provider_config_id, key_id \
             FROM governance_virtual_key_provider_config_keys \
             ORDER BY virtual_key_provider_config_id, key_id",
        )
        .fetch_all(self.pool().inner())
        .await?;
        let mut keys_by_pc: HashMap<i64, Vec<String>> = HashMap::new();
        for row in join_rows {
            keys_by_pc.entry(row.virtual_key_provider_config_id).or_default().push(row.key_id);
        }

        let mut pcs_by_vk: HashMap<String, Vec<VirtualKeyProviderConfig>> = HashMap::new();
        for pc in provider_configs.drain(..) {
            let mut pc = pc;
            pc.key_ids = keys_by_pc.remove(&pc.id).unwrap_or_default();
            pcs_by_vk.entry(pc.virtual_key_id.clone()).or_default().push(pc);
        }

        let mcp_rows = sqlx::query_as::<_, VirtualKeyMcpConfig>(
            "SELECT * FROM governance_virtual_key_mcp_configs ORDER BY id",
        )
        .fetch_all(self.pool().inner())
        .await?;
        let mut mcps_by_vk: HashMap<String, Vec<VirtualKeyMcpConfig>> = HashMap::new();
        for mc in mcp_rows {
            mcps_by_vk.entry(mc.virtual_key_id.clone()).or_default().push(mc);
        }

        Ok(VirtualKeyGraph {
            provider_configs: pcs_by_vk,
            mcp_configs: mcps_by_vk,
        })
    }
}

struct VirtualKeyGraph {
    provider_configs: HashMap<String, Vec<VirtualKeyProviderConfig>>,
    mcp_configs: HashMap<String, Vec<VirtualKeyMcpConfig>>,
}

async fn ensure_budget_exists(conn: &mut SqliteConnection, budget_id: &str) -> StoreResult<()> {
    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM governance_budgets WHERE id = ?")
        .bind(budget_id)
        .fetch_one(conn)
        .await?;
    if exists == 0 {
        return Err(StoreError::Validation(format!("budget {:?} does not exist", budget_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::migrations::MigrationRunner;
    use crate::database::pool::{ConnectionPool, DatabaseConfig};
    use crate::models::{Key, Provider};

    async fn store() -> ConfigStore {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        MigrationRunner::with_declared_schema(pool.clone()).run().await.unwrap();
        ConfigStore::new(pool)
    }

    async fn seed_provider_keys(store: &ConfigStore) {
        store
            .create_provider(&Provider {
                name: "openai".to_string(),
                keys: vec![
                    Key {
                        key_id: "k1".to_string(),
                        name: "k1-name".to_string(),
                        value: "sk-1".to_string(),
                        ..Default::default()
                    },
                    Key {
                        key_id: "k2".to_string(),
                        name: "k2-name".to_string(),
                        value: "sk-2".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn sample_vk() -> VirtualKey {
        VirtualKey {
            name: "analytics".to_string(),
            value: "vk-token".to_string(),
            provider_configs: vec![VirtualKeyProviderConfig {
                provider: "openai".to_string(),
                weight: 1.0,
                allowed_models: vec!["gpt-4o".to_string()],
                key_ids: vec!["k1".to_string(), "k2".to_string()],
                ..Default::default()
            }],
            mcp_configs: vec![VirtualKeyMcpConfig {
                mcp_client_id: "mcp-1".to_string(),
                tools_to_execute: vec!["search".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_virtual_key_round_trip_with_graph() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        seed_provider_keys(&store).await;

        let created = store.create_virtual_key(&sample_vk()).await.unwrap();
        assert!(!created.id.is_empty());
        assert_eq!(created.provider_configs.len(), 1);
        assert_eq!(created.provider_configs[0].key_ids, vec!["k1", "k2"]);
        assert_eq!(created.mcp_configs.len(), 1);

        let fetched = store.get_virtual_key("analytics").await.unwrap();
        assert_eq!(fetched.value, "vk-token");
        assert_eq!(fetched.provider_configs[0].allowed_models, vec!["gpt-4o"]);
    }

    #[tokio::test]
    async fn test_unresolved_key_references() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        seed_provider_keys(&store).await;

        let mut vk = sample_vk();
        vk.provider_configs[0].key_ids.push("ghost".to_string());
        let err = store.create_virtual_key(&vk).await.unwrap_err();
        match err {
            StoreError::UnresolvedKeys(ids) => assert_eq!(ids, vec!["ghost"]),
            other => panic!("expected UnresolvedKeys, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_by_name_reuses_row_id() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        seed_provider_keys(&store).await;

        let created = store.create_virtual_key(&sample_vk()).await.unwrap();
        let mut changed = sample_vk();
        changed.description = "updated".to_string();
        let updated = store.update_virtual_key(&changed).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.description, "updated");
    }

    #[tokio::test]
    async fn test_budget_reference_validation() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let customer = Customer {
            name: "acme".to_string(),
            budget_id: Some("missing-budget".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            store.create_customer(&customer).await,
            Err(StoreError::Validation(_))
        ));

        let budget = store
            .create_budget(&Budget {
                max_limit: 100.0,
                reset_duration: "1M".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let customer = Customer {
            name: "acme".to_string(),
            budget_id: Some(budget.id.clone()),
            ..Default::default()
        };
        assert!(store.create_customer(&customer).await.is_ok());
    }

    #[tokio::test]
    async fn test_team_requires_existing_customer() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let team = Team {
            name: "ml".to_string(),
            customer_id: Some("ghost".to_string()),
            ..Default::default()
        };
        assert!(matches!(store.create_team(&team).await, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_budget_upsert_preserves_usage() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        let budget = store
            .create_budget(&Budget {
                max_limit: 100.0,
                reset_duration: "1M".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        sqlx::query("UPDATE governance_budgets SET current_usage = 42.5 WHERE id = ?")
            .bind(&budget.id)
            .execute(store.pool().inner())
            .await
            .unwrap();

        let mut changed = budget.clone();
        changed.max_limit = 200.0;
        let updated = store.create_budget(&changed).await.unwrap();
        assert_eq!(updated.max_limit, 200.0);
        assert_eq!(updated.current_usage, 42.5);
    }

    #[tokio::test]
    async fn test_redacted_virtual_keys_hide_token() {
        let _codec = crate::crypto::codec::test_guard();
        let store = store().await;
        seed_provider_keys(&store).await;
        store.create_virtual_key(&sample_vk()).await.unwrap();

        let redacted = store.list_redacted_virtual_keys().await.unwrap();
        assert_eq!(redacted.len(), 1);
        assert_eq!(redacted[0].value, "");
        assert_eq!(redacted[0].provider_configs.len(), 1);
    }
}
