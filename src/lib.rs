//! # ModelGate Configuration Control Plane
//!
//! The durable, reconcilable, concurrency-safe configuration core shared
//! by every gateway replica over one relational database.
//!
//! ## Architecture
//!
//! - `crypto`: envelope encryption of secret strings, process-wide codec
//! - `database`: connection pooling, dialect error classification, the
//!   ordered migration framework and the declared schema
//! - `models`: row types for providers, keys, governance, MCP, plugins
//! - `hash`: deterministic `config_hash` fingerprints, the drift primitive
//! - `hooks`: pre-save encryption and post-load decryption per entity
//! - `lock`: database-backed distributed mutual exclusion with TTL
//! - `store`: transactional CRUD plus the startup encryption sweep
//! - `reconcile`: declarative-source diffing under the distributed lock

#![warn(clippy::all)]

pub mod crypto;
pub mod database;
pub mod duration;
pub mod envref;
pub mod hash;
pub mod hooks;
pub mod lock;
pub mod models;
pub mod reconcile;
pub mod store;

use tokio_util::sync::CancellationToken;

// Re-export the main entry points.
pub use database::{ConnectionPool, DatabaseConfig, MigrationRunner};
pub use lock::{LockManager, LockManagerConfig};
pub use reconcile::{DeclarativeConfig, Reconciler};
pub use store::ConfigStore;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The critical section boot serializes on across replicas.
pub const INIT_LOCK_KEY: &str = "gateway-config-init";

/// Boot error for [`bootstrap`].
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Database(#[from] database::DatabaseError),
    #[error(transparent)]
    Lock(#[from] lock::LockError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),
}

/// Bring a database to readiness and hand back the store.
///
/// Opens the pool, takes the initialization lock (creating the lock table
/// first if this database predates it), runs migrations, sweeps legacy
/// plaintext rows into encrypted form, and releases the lock. Safe to run
/// concurrently from many replicas; exactly one does the work at a time.
///
/// Pass `encryption_key` to enable encryption at rest; `None` leaves the
/// codec disabled and rows stored as `plain_text`.
pub async fn bootstrap(
    config: DatabaseConfig,
    encryption_key: Option<&str>,
) -> Result<ConfigStore, BootstrapError> {
    if let Some(key) = encryption_key {
        match crypto::init(key) {
            Ok(()) | Err(crypto::CryptoError::AlreadyInitialized) => {}
            Err(e) => return Err(e.into()),
        }
    }

    let pool = ConnectionPool::new(config).await?;
    let locks = LockManager::with_defaults(pool.clone());
    locks.store().ensure_schema().await?;

    let mut init_lock = locks.lock(INIT_LOCK_KEY)?;
    let cancel = CancellationToken::new();
    init_lock.lock(&cancel).await?;

    let result = async {
        MigrationRunner::with_declared_schema(pool.clone()).run().await?;
        let store = ConfigStore::new(pool.clone());
        store::encrypt_existing_plaintext(&store).await?;
        Ok::<_, BootstrapError>(store)
    }
    .await;

    if let Err(e) = init_lock.unlock().await {
        log::warn!("failed to release initialization lock: {}", e);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_in_memory() {
        let store = bootstrap(DatabaseConfig::in_memory(), None).await.unwrap();
        store.health().await.unwrap();

        // The initialization lock was released.
        let locks = LockManager::with_defaults(store.pool().clone());
        let mut lock = locks.lock(INIT_LOCK_KEY).unwrap();
        assert!(lock.try_lock().await.unwrap());
    }
}
