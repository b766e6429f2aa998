//! Lock handles and the manager that mints them.
//!
//! A [`Lock`] moves through `Unacquired → Acquired → (Released | Expired)`;
//! a successful extend self-loops on `Acquired`. The holder id is fixed at
//! mint, so re-acquiring after release takes a fresh handle. The local
//! `acquired` flag is an optimization for fast-failing `unlock`; ownership
//! questions are always settled against the database.

use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::database::pool::ConnectionPool;

use super::store::{DistributedLock, LockStore};
use super::{LockError, LockResult};

/// TTL and retry policy applied to every handle the manager mints.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// How long an acquired lock lives without extension.
    pub ttl: Duration,
    /// Sleep between attempts in [`Lock::lock`].
    pub retry_interval: Duration,
    /// Extra attempts after the first in [`Lock::lock`].
    pub max_retries: u32,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_secs(1),
            max_retries: 10,
        }
    }
}

/// Factory for [`Lock`] handles.
#[derive(Clone)]
pub struct LockManager {
    store: LockStore,
    config: LockManagerConfig,
}

impl LockManager {
    pub fn new(pool: ConnectionPool, config: LockManagerConfig) -> Self {
        Self {
            store: LockStore::new(pool),
            config,
        }
    }

    pub fn with_defaults(pool: ConnectionPool) -> Self {
        Self::new(pool, LockManagerConfig::default())
    }

    /// Mint a handle for a named critical section. The holder id is a
    /// fresh UUID owned by this handle alone.
    pub fn lock(&self, lock_key: &str) -> LockResult<Lock> {
        if lock_key.trim().is_empty() {
            return Err(LockError::EmptyLockKey);
        }
        Ok(Lock {
            store: self.store.clone(),
            lock_key: lock_key.to_string(),
            holder_id: Uuid::new_v4().to_string(),
            ttl: self.config.ttl,
            retry_interval: self.config.retry_interval,
            max_retries: self.config.max_retries,
            acquired: false,
        })
    }

    /// Access to the underlying store, for GC sweeps.
    pub fn store(&self) -> &LockStore {
        &self.store
    }
}

/// A handle on one named lock.
pub struct Lock {
    store: LockStore,
    lock_key: String,
    holder_id: String,
    ttl: Duration,
    retry_interval: Duration,
    max_retries: u32,
    acquired: bool,
}

impl Lock {
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    fn ttl_from_now(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(30))
    }

    /// One acquisition attempt. Expired rows for this key are swept first,
    /// best-effort; the insert is the arbiter.
    pub async fn try_lock(&mut self) -> LockResult<bool> {
        if let Err(e) = self.store.cleanup_expired_by_key(&self.lock_key).await {
            log::warn!("expired-lock cleanup for {:?} failed: {}", self.lock_key, e);
        }

        let now = Utc::now();
        let row = DistributedLock {
            lock_key: self.lock_key.clone(),
            holder_id: self.holder_id.clone(),
            expires_at: self.ttl_from_now(),
            created_at: now,
        };

        let inserted = self.store.try_acquire(&row).await?;
        if inserted {
            self.acquired = true;
        }
        Ok(inserted)
    }

    /// Block until acquired, cancellation, or retry exhaustion. Makes up to
    /// `max_retries + 1` attempts with a fixed sleep between them.
    pub async fn lock(&mut self, cancel: &CancellationToken) -> LockResult<()> {
        let attempts = self.max_retries + 1;
        for attempt in 0..attempts {
            if self.try_lock().await? {
                return Ok(());
            }
            if attempt + 1 < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LockError::Cancelled),
                    _ = tokio::time::sleep(self.retry_interval) => {}
                }
            }
        }
        Err(LockError::NotAcquired(self.lock_key.clone()))
    }

    /// Like [`Lock::lock`] but with exponential backoff between attempts:
    /// `1 << min(i, 5)` seconds, capping the sleep at 32 s.
    pub async fn lock_with_retry(
        &mut self,
        cancel: &CancellationToken,
        max_retries: u32,
    ) -> LockResult<()> {
        let attempts = max_retries + 1;
        for attempt in 0..attempts {
            if self.try_lock().await? {
                return Ok(());
            }
            if attempt + 1 < attempts {
                let backoff = Duration::from_secs(1u64 << attempt.min(5));
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LockError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        Err(LockError::NotAcquired(self.lock_key.clone()))
    }

    /// Release the lock. Fast-fails on an unacquired handle without
    /// touching the database; otherwise deletes only on holder match. A
    /// cancelled or failed unlock leaves the remote row in place — callers
    /// should retry with a fresh context.
    pub async fn unlock(&mut self) -> LockResult<()> {
        if !self.acquired {
            return Err(LockError::NotHeld(self.lock_key.clone()));
        }

        let released = self.store.release(&self.lock_key, &self.holder_id).await?;
        self.acquired = false;
        if released {
            Ok(())
        } else {
            Err(LockError::NotHeld(self.lock_key.clone()))
        }
    }

    /// Push the expiry to `now + ttl`. Only a live row with this handle's
    /// holder id is extended; an expired-but-unstolen row is not
    /// resurrected. On a definitive loss the local flag clears; transient
    /// database errors preserve it so a later unlock can still try.
    pub async fn extend(&mut self) -> LockResult<()> {
        if !self.acquired {
            return Err(LockError::NotHeld(self.lock_key.clone()));
        }

        let extended = self
            .store
            .update_expiry(&self.lock_key, &self.holder_id, self.ttl_from_now())
            .await?;
        if extended {
            return Ok(());
        }

        // Distinguish "expired while still ours" from "stolen or gone".
        let row = self.store.get(&self.lock_key).await?;
        self.acquired = false;
        match row {
            Some(row) if row.holder_id == self.holder_id && !row.is_live(Utc::now()) => {
                Err(LockError::Expired(self.lock_key.clone()))
            }
            _ => Err(LockError::NotHeld(self.lock_key.clone())),
        }
    }

    /// Whether this handle currently owns the lock, per the database — a
    /// missing row, a foreign holder, or an elapsed TTL all answer no.
    /// Transient errors surface without touching the local flag.
    pub async fn is_held(&mut self) -> LockResult<bool> {
        let row = self.store.get(&self.lock_key).await?;
        let held = matches!(
            &row,
            Some(row) if row.holder_id == self.holder_id && row.is_live(Utc::now())
        );
        if !held {
            self.acquired = false;
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::pool::{ConnectionPool, DatabaseConfig};

    async fn manager() -> LockManager {
        let pool = ConnectionPool::new(DatabaseConfig::in_memory()).await.unwrap();
        let manager = LockManager::new(
            pool,
            LockManagerConfig {
                ttl: Duration::from_millis(200),
                retry_interval: Duration::from_millis(20),
                max_retries: 3,
            },
        );
        manager.store().ensure_schema().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_try_lock_mutual_exclusion() {
        let manager = manager().await;
        let mut first = manager.lock("job-A").unwrap();
        let mut second = manager.lock("job-A").unwrap();

        assert!(first.try_lock().await.unwrap());
        assert!(!second.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_is_preempted() {
        let manager = manager().await;
        let mut first = manager.lock("job-A").unwrap();
        assert!(first.try_lock().await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;

        let mut third = manager.lock("job-A").unwrap();
        assert!(third.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_then_not_held() {
        let manager = manager().await;
        let mut lock = manager.lock("job-B").unwrap();
        assert!(lock.try_lock().await.unwrap());

        lock.unlock().await.unwrap();
        assert!(matches!(lock.unlock().await, Err(LockError::NotHeld(_))));

        let mut fresh = manager.lock("job-B").unwrap();
        assert!(fresh.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_lock_waits_for_release() {
        let manager = manager().await;
        let mut holder = manager.lock("job-C").unwrap();
        assert!(holder.try_lock().await.unwrap());

        let manager_clone = manager.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            // Dropping the row by holder release, not expiry.
            let mut holder = holder;
            holder.unlock().await.unwrap();
        });

        let mut waiter = manager_clone.lock("job-C").unwrap();
        let cancel = CancellationToken::new();
        waiter.lock(&cancel).await.unwrap();
        release.await.unwrap();
        assert!(waiter.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_exhaustion() {
        let manager = manager().await;
        let mut holder = manager.lock("job-D").unwrap();
        assert!(holder.try_lock().await.unwrap());
        // Keep the row alive past the waiter's whole retry budget.
        let extender = tokio::spawn(async move {
            let mut holder = holder;
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = holder.extend().await;
            }
        });

        let mut waiter = manager.lock("job-D").unwrap();
        let cancel = CancellationToken::new();
        let result = waiter.lock(&cancel).await;
        assert!(matches!(result, Err(LockError::NotAcquired(_))));
        extender.abort();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let manager = manager().await;
        let mut holder = manager.lock("job-E").unwrap();
        assert!(holder.try_lock().await.unwrap());
        let _ = holder.extend().await;

        let mut waiter = manager.lock("job-E").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = waiter.lock(&cancel).await;
        assert!(matches!(result, Err(LockError::Cancelled)));
    }

    #[tokio::test]
    async fn test_extend_advances_expiry() {
        let manager = manager().await;
        let mut lock = manager.lock("job-F").unwrap();
        assert!(lock.try_lock().await.unwrap());

        let before = manager.store().get("job-F").await.unwrap().unwrap().expires_at;
        tokio::time::sleep(Duration::from_millis(50)).await;
        lock.extend().await.unwrap();
        let after = manager.store().get("job-F").await.unwrap().unwrap().expires_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_extend_after_expiry_reports_expired() {
        let manager = manager().await;
        let mut lock = manager.lock("job-G").unwrap();
        assert!(lock.try_lock().await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let result = lock.extend().await;
        assert!(matches!(result, Err(LockError::Expired(_))));

        // The definitive loss cleared the local flag.
        assert!(matches!(lock.unlock().await, Err(LockError::NotHeld(_))));
    }

    #[tokio::test]
    async fn test_is_held_consults_database() {
        let manager = manager().await;
        let mut lock = manager.lock("job-H").unwrap();
        assert!(lock.try_lock().await.unwrap());
        assert!(lock.is_held().await.unwrap());

        // Steal the row out from under the handle.
        manager.store().release("job-H", lock.holder_id()).await.unwrap();
        assert!(!lock.is_held().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_key_is_programmer_error() {
        let manager = manager().await;
        assert!(matches!(manager.lock("  "), Err(LockError::EmptyLockKey)));
    }
}
