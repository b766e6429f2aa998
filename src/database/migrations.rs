//! # Schema Migration Framework
//!
//! Append-only, ordered, idempotent migrations. Each migration has a
//! globally unique string id and runs exactly once inside its own
//! transaction, recorded in the `schema_migrations` bookkeeping table.
//! Ids recorded in the table that the running binary does not declare are
//! tolerated — a downgraded binary must still boot.
//!
//! Migrations must be idempotent *within themselves* as well: partial
//! reruns across mixed database versions are possible, so DDL checks for
//! existing tables/columns/indexes before creating them.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use std::collections::HashSet;

use super::pool::ConnectionPool;
use super::{DatabaseError, Result};

/// A single migration step.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Globally unique id, recorded in the bookkeeping table.
    fn id(&self) -> &str;

    /// Apply the migration inside the provided transaction.
    async fn up(&self, conn: &mut SqliteConnection) -> Result<()>;

    /// Best-effort rollback. Optional.
    async fn down(&self, _conn: &mut SqliteConnection) -> Result<()> {
        Err(DatabaseError::Migration(format!("migration {} is not reversible", self.id())))
    }

    /// Whether [`Migration::down`] is implemented.
    fn is_reversible(&self) -> bool {
        false
    }
}

/// Migration defined by raw SQL statements.
pub struct SqlMigration {
    id: String,
    up_statements: Vec<String>,
    down_statements: Vec<String>,
}

impl SqlMigration {
    pub fn new(
        id: impl Into<String>,
        up_statements: Vec<&str>,
        down_statements: Vec<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            up_statements: up_statements.into_iter().map(String::from).collect(),
            down_statements: down_statements.into_iter().map(String::from).collect(),
        }
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn id(&self) -> &str {
        &self.id
    }

    async fn up(&self, conn: &mut SqliteConnection) -> Result<()> {
        for statement in &self.up_statements {
            sqlx::query(statement).execute(&mut *conn).await.map_err(|e| {
                DatabaseError::Migration(format!("migration {} failed: {}", self.id, e))
            })?;
        }
        Ok(())
    }

    async fn down(&self, conn: &mut SqliteConnection) -> Result<()> {
        if self.down_statements.is_empty() {
            return Err(DatabaseError::Migration(format!(
                "migration {} is not reversible",
                self.id
            )));
        }
        for statement in &self.down_statements {
            sqlx::query(statement).execute(&mut *conn).await.map_err(|e| {
                DatabaseError::Migration(format!("rollback of {} failed: {}", self.id, e))
            })?;
        }
        Ok(())
    }

    fn is_reversible(&self) -> bool {
        !self.down_statements.is_empty()
    }
}

/// Migration that adds a column only when it is missing.
pub struct AddColumnMigration {
    id: String,
    table: String,
    column: String,
    definition: String,
}

impl AddColumnMigration {
    pub fn new(
        id: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            column: column.into(),
            definition: definition.into(),
        }
    }
}

#[async_trait]
impl Migration for AddColumnMigration {
    fn id(&self) -> &str {
        &self.id
    }

    async fn up(&self, conn: &mut SqliteConnection) -> Result<()> {
        if has_column(conn, &self.table, &self.column).await? {
            return Ok(());
        }
        let statement =
            format!("ALTER TABLE {} ADD COLUMN {} {}", self.table, self.column, self.definition);
        sqlx::query(&statement)
            .execute(conn)
            .await
            .map_err(|e| DatabaseError::Migration(format!("migration {} failed: {}", self.id, e)))?;
        Ok(())
    }
}

/// Outcome of one runner invocation.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Ids applied by this run, in order.
    pub applied: Vec<String>,
    /// Ids already recorded and skipped.
    pub skipped: usize,
    /// Recorded ids the binary does not declare (downgrade situation).
    pub unknown: Vec<String>,
}

/// Ordered migration runner.
pub struct MigrationRunner {
    pool: ConnectionPool,
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    /// Create a runner over an ordered migration list.
    pub fn new(pool: ConnectionPool, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self { pool, migrations }
    }

    /// Runner with the crate's declared schema.
    pub fn with_declared_schema(pool: ConnectionPool) -> Self {
        Self::new(pool, super::schema::declared_migrations())
    }

    /// Ensure the bookkeeping table exists.
    async fn ensure_bookkeeping(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                 id VARCHAR(255) PRIMARY KEY,\
                 ran_at TIMESTAMP NOT NULL\
             )",
        )
        .execute(self.pool.inner())
        .await
        .map_err(|e| DatabaseError::Migration(format!("failed to create schema_migrations: {}", e)))?;
        Ok(())
    }

    /// Load the set of recorded migration ids.
    async fn applied_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT id FROM schema_migrations")
            .fetch_all(self.pool.inner())
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to read schema_migrations: {}", e)))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(DatabaseError::Sqlx))
            .collect()
    }

    /// Run every pending migration in declaration order.
    pub async fn run(&self) -> Result<MigrationReport> {
        self.ensure_bookkeeping().await?;
        let applied = self.applied_ids().await?;

        let declared: HashSet<&str> = self.migrations.iter().map(|m| m.id()).collect();
        let mut report = MigrationReport::default();
        for recorded in &applied {
            if !declared.contains(recorded.as_str()) {
                report.unknown.push(recorded.clone());
            }
        }
        if !report.unknown.is_empty() {
            log::warn!(
                "schema_migrations records {} migration(s) this binary does not declare: {:?}",
                report.unknown.len(),
                report.unknown
            );
        }

        for migration in &self.migrations {
            if applied.contains(migration.id()) {
                report.skipped += 1;
                continue;
            }

            log::info!("running migration {}", migration.id());
            let mut tx = self.pool.begin().await?;
            migration.up(&mut tx).await?;
            sqlx::query("INSERT INTO schema_migrations (id, ran_at) VALUES (?, ?)")
                .bind(migration.id())
                .bind(Utc::now())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    DatabaseError::Migration(format!("failed to record {}: {}", migration.id(), e))
                })?;
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Migration(format!("failed to commit {}: {}", migration.id(), e)))?;
            report.applied.push(migration.id().to_string());
        }

        if !report.applied.is_empty() {
            log::info!("applied {} migration(s): {:?}", report.applied.len(), report.applied);
        }
        Ok(report)
    }

    /// Roll back one recorded migration by id. Best-effort.
    pub async fn rollback(&self, id: &str) -> Result<()> {
        let migration = self
            .migrations
            .iter()
            .find(|m| m.id() == id)
            .ok_or_else(|| DatabaseError::Migration(format!("migration {} not declared", id)))?;
        if !migration.is_reversible() {
            return Err(DatabaseError::Migration(format!("migration {} is not reversible", id)));
        }

        let mut tx = self.pool.begin().await?;
        migration.down(&mut tx).await?;
        sqlx::query("DELETE FROM schema_migrations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to unrecord {}: {}", id, e)))?;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Migration(format!("failed to commit rollback of {}: {}", id, e)))?;
        Ok(())
    }
}

/// Add a column unless it already exists.
pub async fn add_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if has_column(conn, table, column).await? {
        return Ok(());
    }
    let statement = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
    sqlx::query(&statement).execute(conn).await?;
    Ok(())
}

/// Drop a column if it exists. Requires SQLite 3.35+; PostgreSQL supports
/// this natively.
pub async fn drop_column(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<()> {
    if !has_column(conn, table, column).await? {
        return Ok(());
    }
    let statement = format!("ALTER TABLE {} DROP COLUMN {}", table, column);
    sqlx::query(&statement).execute(conn).await?;
    Ok(())
}

/// Rename a table if the old name still exists.
pub async fn rename_table(conn: &mut SqliteConnection, from: &str, to: &str) -> Result<()> {
    if !has_table(conn, from).await? {
        return Ok(());
    }
    let statement = format!("ALTER TABLE {} RENAME TO {}", from, to);
    sqlx::query(&statement).execute(conn).await?;
    Ok(())
}

/// Create an index; `IF NOT EXISTS` keeps it rerunnable.
pub async fn create_index(
    conn: &mut SqliteConnection,
    index: &str,
    table: &str,
    columns: &str,
    unique: bool,
) -> Result<()> {
    let uniqueness = if unique { "UNIQUE " } else { "" };
    let statement =
        format!("CREATE {}INDEX IF NOT EXISTS {} ON {}({})", uniqueness, index, table, columns);
    sqlx::query(&statement).execute(conn).await?;
    Ok(())
}

/// Drop an index; `IF EXISTS` keeps it rerunnable.
pub async fn drop_index(conn: &mut SqliteConnection, index: &str) -> Result<()> {
    let statement = format!("DROP INDEX IF EXISTS {}", index);
    sqlx::query(&statement).execute(conn).await?;
    Ok(())
}

/// Whether a table exists.
pub async fn has_table(conn: &mut SqliteConnection, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_one(conn)
        .await?;
    Ok(row.try_get::<i64, _>("n")? > 0)
}

/// Whether a column exists on a table.
pub async fn has_column(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(conn)
        .await?;
    Ok(row.try_get::<i64, _>("n")? > 0)
}

/// Whether a named index exists.
pub async fn has_index(conn: &mut SqliteConnection, index: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'index' AND name = ?")
        .bind(index)
        .fetch_one(conn)
        .await?;
    Ok(row.try_get::<i64, _>("n")? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::pool::DatabaseConfig;

    #[tokio::test]
    async fn test_runner_applies_in_order_once() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(SqlMigration::new(
                "0001_first",
                vec!["CREATE TABLE IF NOT EXISTS first (id INTEGER PRIMARY KEY)"],
                vec!["DROP TABLE IF EXISTS first"],
            )),
            Box::new(SqlMigration::new(
                "0002_second",
                vec!["CREATE TABLE IF NOT EXISTS second (id INTEGER PRIMARY KEY)"],
                vec!["DROP TABLE IF EXISTS second"],
            )),
        ];
        let runner = MigrationRunner::new(pool.clone(), migrations);

        let report = runner.run().await.unwrap();
        assert_eq!(report.applied, vec!["0001_first", "0002_second"]);
        assert_eq!(report.skipped, 0);

        // Second run is a no-op.
        let report = runner.run().await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_unknown_recorded_ids_are_tolerated() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        let runner = MigrationRunner::new(pool.clone(), Vec::new());
        runner.run().await.unwrap();

        sqlx::query("INSERT INTO schema_migrations (id, ran_at) VALUES ('9999_from_the_future', ?)")
            .bind(Utc::now())
            .execute(pool.inner())
            .await
            .unwrap();

        let report = runner.run().await.unwrap();
        assert_eq!(report.unknown, vec!["9999_from_the_future"]);
    }

    #[tokio::test]
    async fn test_add_column_is_idempotent() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        sqlx::query("CREATE TABLE things (id INTEGER PRIMARY KEY)")
            .execute(pool.inner())
            .await
            .unwrap();

        let migration =
            AddColumnMigration::new("0003_add_flag", "things", "flag", "BOOLEAN NOT NULL DEFAULT 0");
        let mut conn = pool.acquire().await.unwrap();
        migration.up(&mut conn).await.unwrap();
        // Rerun against the already-upgraded table.
        migration.up(&mut conn).await.unwrap();
        assert!(has_column(&mut conn, "things", "flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_ddl_helpers_are_rerunnable() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        sqlx::query("CREATE TABLE old_name (id INTEGER PRIMARY KEY, junk TEXT)")
            .execute(pool.inner())
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        add_column(&mut conn, "old_name", "extra", "TEXT").await.unwrap();
        add_column(&mut conn, "old_name", "extra", "TEXT").await.unwrap();
        drop_column(&mut conn, "old_name", "junk").await.unwrap();
        drop_column(&mut conn, "old_name", "junk").await.unwrap();
        create_index(&mut conn, "idx_old_name_extra", "old_name", "extra", false).await.unwrap();
        create_index(&mut conn, "idx_old_name_extra", "old_name", "extra", false).await.unwrap();
        drop_index(&mut conn, "idx_old_name_extra").await.unwrap();
        rename_table(&mut conn, "old_name", "new_name").await.unwrap();
        rename_table(&mut conn, "old_name", "new_name").await.unwrap();

        assert!(has_table(&mut conn, "new_name").await.unwrap());
        assert!(has_column(&mut conn, "new_name", "extra").await.unwrap());
        assert!(!has_column(&mut conn, "new_name", "junk").await.unwrap());
    }

    #[tokio::test]
    async fn test_schema_inspection_helpers() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        sqlx::query("CREATE TABLE probe (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(pool.inner())
            .await
            .unwrap();
        sqlx::query("CREATE INDEX idx_probe_name ON probe(name)")
            .execute(pool.inner())
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(has_table(&mut conn, "probe").await.unwrap());
        assert!(!has_table(&mut conn, "absent").await.unwrap());
        assert!(has_column(&mut conn, "probe", "name").await.unwrap());
        assert!(!has_column(&mut conn, "probe", "absent").await.unwrap());
        assert!(has_index(&mut conn, "idx_probe_name").await.unwrap());
        assert!(!has_index(&mut conn, "idx_absent").await.unwrap());
    }
}
