//! # Distributed Lock Manager
//!
//! Database-backed mutual exclusion shared by every gateway replica.
//! A lock is one row in `distributed_locks`: at most one row per key, live
//! while `expires_at > now`. Holders are identified by a UUID minted per
//! handle, so release and extend only ever touch rows the caller owns.
//! Expired rows are garbage-collected opportunistically before acquisition
//! attempts; a holder whose TTL lapses is silently preempted by the next
//! acquirer.

use thiserror::Error;

/// Lock error types
#[derive(Error, Debug)]
pub enum LockError {
    /// Programmer error: a lock key must be non-empty
    #[error("lock key cannot be empty")]
    EmptyLockKey,

    /// Bounded acquisition exhausted its retries
    #[error("lock {0:?} not acquired after retries")]
    NotAcquired(String),

    /// Release or extend against a row the caller does not own
    #[error("lock {0:?} is not held by this handle")]
    NotHeld(String),

    /// The held row's TTL elapsed before it could be extended
    #[error("lock {0:?} expired")]
    Expired(String),

    /// The caller's cancellation token fired while waiting
    #[error("lock operation cancelled")]
    Cancelled,

    /// Transient database error; local state is unmodified
    #[error("lock storage error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

pub mod manager;
pub mod store;

pub use manager::{Lock, LockManager, LockManagerConfig};
pub use store::{DistributedLock, LockStore};
