//! # Connection Pool Management
//!
//! Async connection pooling with explicit sizing, SQLite pragma setup,
//! and a lightweight health check.

use parking_lot::RwLock;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{DatabaseError, Result};

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://gateway.db" or "sqlite::memory:")
    pub url: String,

    /// Maximum number of idle connections kept in the pool
    pub max_idle_connections: u32,

    /// Maximum number of open connections
    pub max_open_connections: u32,

    /// Connection acquire timeout in seconds
    pub connect_timeout: u64,

    /// Busy timeout for SQLite in milliseconds
    pub busy_timeout_ms: u64,

    /// Enable WAL mode for SQLite
    pub enable_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://modelgate.db".to_string(),
            max_idle_connections: 2,
            max_open_connections: 25,
            connect_timeout: 30,
            busy_timeout_ms: 60_000,
            enable_wal: true,
        }
    }
}

impl DatabaseConfig {
    /// Config for the in-memory test driver.
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            ..Default::default()
        }
    }

    /// Whether this config points at an in-memory SQLite database.
    ///
    /// In-memory databases exist per connection, so the pool must be forced
    /// to a single connection or every connection would see a distinct
    /// database and distributed-lock semantics would silently break.
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total queries executed through the pool wrappers
    pub total_queries: u64,

    /// Total query errors
    pub total_errors: u64,

    /// Last health check time
    pub last_health_check: Option<Instant>,

    /// Health check status
    pub is_healthy: bool,
}

/// Connection pool with health monitoring
#[derive(Clone)]
pub struct ConnectionPool {
    pool: SqlitePool,
    config: DatabaseConfig,
    stats: Arc<RwLock<PoolStats>>,
}

impl ConnectionPool {
    /// Create a new connection pool.
    ///
    /// The SQLite file is created if absent, opened with WAL journaling,
    /// `synchronous=NORMAL`, a 60 s busy timeout, and foreign keys on.
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        let mut connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .synchronous(SqliteSynchronous::Normal);

        if config.enable_wal && !config.is_in_memory() {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        let max_open = if config.is_in_memory() { 1 } else { config.max_open_connections };
        let min_idle = if config.is_in_memory() {
            1
        } else {
            config.max_idle_connections.min(max_open)
        };

        let pool = SqlitePoolOptions::new()
            .min_connections(min_idle)
            .max_connections(max_open)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))?;

        let stats = PoolStats {
            is_healthy: true,
            ..Default::default()
        };

        Ok(Self {
            pool,
            config,
            stats: Arc::new(RwLock::new(stats)),
        })
    }

    /// Get a reference to the underlying SQLx pool
    pub fn inner(&self) -> &SqlitePool {
        &self.pool
    }

    /// The config this pool was opened with
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Acquire a connection from the pool
    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))
    }

    /// Begin a transaction
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| DatabaseError::ConnectionPool(e.to_string()))
    }

    /// Execute a query and record statistics
    pub async fn execute<'q, Q>(&self, query: Q) -> Result<sqlx::sqlite::SqliteQueryResult>
    where
        Q: sqlx::Execute<'q, sqlx::Sqlite> + 'q,
    {
        use sqlx::Executor;
        let result = (&self.pool).execute(query).await.map_err(|e| {
            self.stats.write().total_errors += 1;
            DatabaseError::Sqlx(e)
        })?;
        self.stats.write().total_queries += 1;
        Ok(result)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.read().clone()
    }

    /// Perform a health check with a trivial query
    pub async fn health_check(&self) -> Result<bool> {
        let result = sqlx::query("SELECT 1").fetch_one(&self.pool).await;
        let is_healthy = result.is_ok();

        {
            let mut stats = self.stats.write();
            stats.last_health_check = Some(Instant::now());
            stats.is_healthy = is_healthy;
        }

        if let Err(e) = result {
            log::warn!("database health check failed: {}", e);
        }

        Ok(is_healthy)
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_pool_creation() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_pool_is_single_connection() {
        let config = DatabaseConfig::in_memory();
        assert!(config.is_in_memory());

        let pool = ConnectionPool::new(config).await.unwrap();

        // A table created through one checkout must be visible through the
        // next; with more than one connection each would be a separate db.
        sqlx::query("CREATE TABLE visibility_probe (id INTEGER PRIMARY KEY)")
            .execute(pool.inner())
            .await
            .unwrap();
        let row = sqlx::query("SELECT COUNT(*) FROM visibility_probe")
            .fetch_one(pool.inner())
            .await;
        assert!(row.is_ok());
    }

    #[tokio::test]
    async fn test_health_check() {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        assert!(pool.health_check().await.unwrap());
        assert!(pool.stats().is_healthy);
    }
}
