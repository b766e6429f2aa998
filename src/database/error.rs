//! Dialect error classification.
//!
//! Write paths need to tell a unique-constraint violation (user error,
//! report the conflicting column) from everything else (transient, retry).
//! Driver error codes are consulted first; message parsing is the fallback
//! for drivers that do not expose codes.

use sqlx::Error as SqlxError;

/// What a database error means to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Unique constraint violated; `column` is the best-effort offending
    /// column name.
    UniqueViolation { column: String },
    /// The requested row does not exist.
    NotFound,
    /// Anything else: connection loss, syntax, serialization. Retryable
    /// from the caller's point of view.
    Other,
}

// SQLite extended result codes for uniqueness.
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
// PostgreSQL SQLSTATE for unique_violation.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Classify a sqlx error into caller-facing kinds.
pub fn classify(err: &SqlxError) -> DbErrorKind {
    if matches!(err, SqlxError::RowNotFound) {
        return DbErrorKind::NotFound;
    }

    let Some(db_err) = err.as_database_error() else {
        return DbErrorKind::Other;
    };

    let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
    let message = db_err.message().to_string();

    let is_unique = matches!(
        code.as_str(),
        SQLITE_CONSTRAINT_UNIQUE | SQLITE_CONSTRAINT_PRIMARYKEY | PG_UNIQUE_VIOLATION
    ) || message.contains("UNIQUE constraint failed")
        || message.contains("duplicate key value violates unique constraint");

    if is_unique {
        DbErrorKind::UniqueViolation {
            column: extract_column(&message),
        }
    } else {
        DbErrorKind::Other
    }
}

/// Pull the offending column name out of a dialect-specific message.
///
/// SQLite: `UNIQUE constraint failed: config_keys.name`
/// PostgreSQL: `duplicate key value violates unique constraint
/// "idx_config_keys_name"` — the trailing index-name segment is the best
/// available signal.
fn extract_column(message: &str) -> String {
    if let Some(rest) = message.strip_prefix("UNIQUE constraint failed: ") {
        // Possibly several "table.column" entries; report the first column.
        let first = rest.split(',').next().unwrap_or(rest).trim();
        return first.rsplit('.').next().unwrap_or(first).to_string();
    }

    if let Some(start) = message.find('"') {
        let rest = &message[start + 1..];
        if let Some(end) = rest.find('"') {
            let constraint = &rest[..end];
            // Conventional index names end in the column: idx_<table>_<column>.
            return constraint.rsplit('_').next().unwrap_or(constraint).to_string();
        }
    }

    "unknown".to_string()
}
