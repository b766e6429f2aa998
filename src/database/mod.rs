//! # Database Layer
//!
//! Connection pooling, dialect error classification, and the ordered
//! migration framework the control plane boots through.
//!
//! The wired driver is SQLite (the embedded and test driver); all SQL text
//! is kept portable to PostgreSQL and the error classifier understands both
//! dialects' unique-violation shapes, so pointing the same statements at a
//! Postgres pool is a wiring change, not a store change.

use thiserror::Error;

/// Database error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Connection pool error
    #[error("connection pool error: {0}")]
    ConnectionPool(String),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(String),

    /// SQLx error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

pub mod error;
pub mod migrations;
pub mod pool;
pub mod schema;

pub use error::{classify, DbErrorKind};
pub use migrations::{
    has_column, has_index, has_table, Migration, MigrationReport, MigrationRunner, SqlMigration,
};
pub use pool::{ConnectionPool, DatabaseConfig, PoolStats};
