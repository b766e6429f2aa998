//! Plugin registration CRUD.

use chrono::Utc;
use sqlx::SqliteConnection;

use crate::hash::ConfigHash;
use crate::models::{to_json_text, Plugin};

use super::{ConfigStore, StoreError, StoreResult};

impl ConfigStore {
    /// Upsert a plugin by name.
    pub async fn upsert_plugin(&self, plugin: &Plugin) -> StoreResult<Plugin> {
        let mut tx = self.begin().await?;
        Self::upsert_plugin_tx(&mut tx, plugin).await?;
        tx.commit().await.map_err(StoreError::from)?;
        self.get_plugin(&plugin.name).await
    }

    pub async fn get_plugin(&self, name: &str) -> StoreResult<Plugin> {
        sqlx::query_as::<_, Plugin>("SELECT * FROM config_plugins WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool().inner())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("plugin {:?}", name)))
    }

    pub async fn list_plugins(&self) -> StoreResult<Vec<Plugin>> {
        Ok(sqlx::query_as::<_, Plugin>("SELECT * FROM config_plugins ORDER BY name")
            .fetch_all(self.pool().inner())
            .await?)
    }

    pub async fn delete_plugin(&self, name: &str) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        let deleted = Self::delete_plugin_tx(&mut tx, name).await?;
        tx.commit().await.map_err(StoreError::from)?;
        if deleted {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("plugin {:?}", name)))
        }
    }

    pub async fn upsert_plugin_tx(conn: &mut SqliteConnection, plugin: &Plugin) -> StoreResult<()> {
        plugin.validate().map_err(StoreError::Validation)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO config_plugins \
                 (name, enabled, path, config, version, config_hash, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET \
                 enabled = excluded.enabled, \
                 path = excluded.path, \
                 config = excluded.config, \
                 version = excluded.version, \
                 config_hash = excluded.config_hash, \
                 updated_at = excluded.updated_at",
        )
        .bind(&plugin.name)
        .bind(plugin.enabled)
        .bind(&plugin.path)
        .bind(to_json_text(&plugin.config))
        .bind(&plugin.version)
        .bind(plugin.compute_config_hash())
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn delete_plugin_tx(conn: &mut SqliteConnection, name: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM config_plugins WHERE name = ?")
            .bind(name)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
