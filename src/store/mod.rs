//! # Config Store
//!
//! Transactional CRUD over every configuration entity, plus the startup
//! encryption sweep.
//!
//! Every mutating operation comes in two shapes: a method on
//! [`ConfigStore`] that opens and commits its own transaction, and an
//! associated `*_tx` function that enlists in a caller-provided connection
//! or transaction handle. Multi-entity work (reconciliation, provider+keys
//! writes) composes the `*_tx` functions inside one transaction.
//!
//! Read paths run load hooks (decryption, sub-struct reconstruction) before
//! returning; `*_redacted_*` variants project only non-secret columns and
//! skip decryption entirely.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::database::pool::ConnectionPool;
use crate::database::{DatabaseError, DbErrorKind};

/// Store error types — the caller-visible taxonomy.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Requested entity absent
    #[error("{0} not found")]
    NotFound(String),

    /// Unique constraint violation; names the conflicting field
    #[error("an entry with the same {field} already exists")]
    AlreadyExists {
        /// Offending column, parsed from the dialect error
        field: String,
    },

    /// Provider-config key references that resolve to no stored key
    #[error("unresolved key ids: {0:?}")]
    UnresolvedKeys(Vec<String>),

    /// Entity-level invariant violated
    #[error("validation failed: {0}")]
    Validation(String),

    /// Encryption codec failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Pool or migration failure
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Wrapped driver error with unmodified local state; safe to retry
    #[error("transient database error: {0}")]
    Transient(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match crate::database::classify(&e) {
            DbErrorKind::UniqueViolation { column } => StoreError::AlreadyExists { field: column },
            DbErrorKind::NotFound => StoreError::NotFound("row".to_string()),
            DbErrorKind::Other => StoreError::Transient(e),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub mod governance;
pub mod mcp;
pub mod misc;
pub mod plugins;
pub mod providers;
pub mod startup;

pub use startup::{encrypt_existing_plaintext, EncryptionSweepReport};

/// Transactional store over all configuration entities.
#[derive(Clone)]
pub struct ConfigStore {
    pool: ConnectionPool,
}

impl ConfigStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Open a transaction for callers composing multiple `*_tx` operations.
    pub async fn begin(&self) -> StoreResult<sqlx::Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Liveness probe against the backing database.
    pub async fn health(&self) -> StoreResult<()> {
        let healthy = self.pool.health_check().await?;
        if healthy {
            Ok(())
        } else {
            Err(StoreError::Transient(sqlx::Error::PoolClosed))
        }
    }
}
