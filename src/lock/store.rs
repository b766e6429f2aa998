//! Lock row storage.
//!
//! Every operation here is a single atomic statement; the database is the
//! arbiter of ownership. Acquisition is a plain INSERT whose primary-key
//! constraint rejects a second holder — the portable fallback for dialects
//! without conditional insert — with expired rows removed beforehand by
//! the caller via [`LockStore::cleanup_expired_by_key`].

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::database::pool::ConnectionPool;
use crate::database::DbErrorKind;

use super::LockResult;

/// One lock row.
#[derive(Debug, Clone, FromRow)]
pub struct DistributedLock {
    pub lock_key: String,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DistributedLock {
    /// Whether this row currently grants ownership.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Storage operations over `distributed_locks`.
#[derive(Clone)]
pub struct LockStore {
    pool: ConnectionPool,
}

impl LockStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Create the lock table if this database predates the migration that
    /// owns it. Boot runs this before taking the initialization lock,
    /// because migrations themselves run under that lock.
    pub async fn ensure_schema(&self) -> LockResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS distributed_locks (\
                 lock_key VARCHAR(255) PRIMARY KEY,\
                 holder_id VARCHAR(255) NOT NULL,\
                 expires_at TIMESTAMP NOT NULL,\
                 created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP\
             )",
        )
        .execute(self.pool.inner())
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_distributed_locks_expires_at \
             ON distributed_locks(expires_at)",
        )
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Insert a lock row. Returns `false` when a row for the key already
    /// exists (the unique violation is the "held" signal), `true` on
    /// successful insert.
    pub async fn try_acquire(&self, lock: &DistributedLock) -> LockResult<bool> {
        let result = sqlx::query(
            "INSERT INTO distributed_locks (lock_key, holder_id, expires_at, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&lock.lock_key)
        .bind(&lock.holder_id)
        .bind(lock.expires_at)
        .bind(lock.created_at)
        .execute(self.pool.inner())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => match crate::database::classify(&e) {
                DbErrorKind::UniqueViolation { .. } => Ok(false),
                _ => Err(e.into()),
            },
        }
    }

    /// Fetch a lock row by key.
    pub async fn get(&self, lock_key: &str) -> LockResult<Option<DistributedLock>> {
        let row = sqlx::query_as::<_, DistributedLock>(
            "SELECT lock_key, holder_id, expires_at, created_at \
             FROM distributed_locks WHERE lock_key = ?",
        )
        .bind(lock_key)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(row)
    }

    /// Move a held lock's expiry forward. Only updates a row whose holder
    /// matches *and* which is still live; zero rows updated means the
    /// caller no longer holds the lock.
    pub async fn update_expiry(
        &self,
        lock_key: &str,
        holder_id: &str,
        new_expiry: DateTime<Utc>,
    ) -> LockResult<bool> {
        let result = sqlx::query(
            "UPDATE distributed_locks SET expires_at = ? \
             WHERE lock_key = ? AND holder_id = ? AND expires_at > ?",
        )
        .bind(new_expiry)
        .bind(lock_key)
        .bind(holder_id)
        .bind(Utc::now())
        .execute(self.pool.inner())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a lock row, but only for the matching holder. Returns whether
    /// a row was deleted.
    pub async fn release(&self, lock_key: &str, holder_id: &str) -> LockResult<bool> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE lock_key = ? AND holder_id = ?")
            .bind(lock_key)
            .bind(holder_id)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every expired lock row. Returns the count removed.
    pub async fn cleanup_expired_all(&self) -> LockResult<u64> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at <= ?")
            .bind(Utc::now())
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete an expired row for one key, if any.
    pub async fn cleanup_expired_by_key(&self, lock_key: &str) -> LockResult<u64> {
        let result =
            sqlx::query("DELETE FROM distributed_locks WHERE lock_key = ? AND expires_at <= ?")
                .bind(lock_key)
                .bind(Utc::now())
                .execute(self.pool.inner())
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::pool::DatabaseConfig;
    use chrono::Duration;

    async fn store() -> LockStore {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        let store = LockStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    fn row(key: &str, holder: &str, ttl_secs: i64) -> DistributedLock {
        let now = Utc::now();
        DistributedLock {
            lock_key: key.to_string(),
            holder_id: holder.to_string(),
            expires_at: now + Duration::seconds(ttl_secs),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_second_insert_reports_held() {
        let store = store().await;
        assert!(store.try_acquire(&row("job", "h1", 30)).await.unwrap());
        assert!(!store.try_acquire(&row("job", "h2", 30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_requires_matching_holder() {
        let store = store().await;
        store.try_acquire(&row("job", "h1", 30)).await.unwrap();

        assert!(!store.release("job", "h2").await.unwrap());
        assert!(store.get("job").await.unwrap().is_some());

        assert!(store.release("job", "h1").await.unwrap());
        assert!(store.get("job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_expiry_requires_live_row() {
        let store = store().await;
        store.try_acquire(&row("live", "h1", 30)).await.unwrap();
        store.try_acquire(&row("dead", "h2", -5)).await.unwrap();

        let new_expiry = Utc::now() + Duration::seconds(60);
        assert!(store.update_expiry("live", "h1", new_expiry).await.unwrap());
        // Wrong holder.
        assert!(!store.update_expiry("live", "h9", new_expiry).await.unwrap());
        // Expired row cannot be resurrected.
        assert!(!store.update_expiry("dead", "h2", new_expiry).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = store().await;
        store.try_acquire(&row("a", "h1", -10)).await.unwrap();
        store.try_acquire(&row("b", "h2", -10)).await.unwrap();
        store.try_acquire(&row("c", "h3", 60)).await.unwrap();

        assert_eq!(store.cleanup_expired_by_key("a").await.unwrap(), 1);
        assert_eq!(store.cleanup_expired_all().await.unwrap(), 1);
        assert!(store.get("c").await.unwrap().is_some());
    }
}
