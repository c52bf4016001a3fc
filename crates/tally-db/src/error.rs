//! # Database Error Types
//!
//! Error types for local store operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)      CoreError (payload decode)            │
//! │       │                               │                                 │
//! │       ▼                               ▼                                 │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (tally-sync) ← Corrupt becomes LocalStorageCorruption        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Sync status / operator                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tally_core::{CoreError, EntityTable};
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Record not found in the local store.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Two records claiming the same server id
    /// - A second queue row for one record (coalescing bypassed)
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// A stored row could not be decoded.
    ///
    /// Fatal to that record only. Callers isolate it and carry on.
    #[error("Corrupt {table} record {id}: {reason}")]
    Corrupt {
        table: String,
        id: String,
        reason: String,
    },

    /// The record is waiting for manual conflict resolution.
    #[error("{table} record {id} has an unresolved conflict")]
    RecordInConflict { table: String, id: String },

    /// Caller passed data that does not fit the target table.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a Corrupt error for a row that failed to decode.
    pub fn corrupt(table: EntityTable, id: impl Into<String>, reason: impl ToString) -> Self {
        DbError::Corrupt {
            table: table.to_string(),
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Wraps a payload decode failure for the given row.
    pub fn from_core(table: EntityTable, id: impl Into<String>, err: CoreError) -> Self {
        DbError::corrupt(table, id, err)
    }

    /// Payload offered for `expected` belongs to another table.
    pub fn table_mismatch(expected: EntityTable, actual: EntityTable) -> Self {
        DbError::InvalidInput(
            CoreError::TableMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            }
            .to_string(),
        )
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, DbError::Corrupt { .. })
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → UNIQUE → UniqueViolation, else QueryFailed
/// sqlx::Error::ColumnDecode   → DbError::Corrupt
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // SQLite: "UNIQUE constraint failed: <table>.<column>"
                if let Some(field) = msg.split("UNIQUE constraint failed: ").nth(1) {
                    DbError::UniqueViolation {
                        field: field.to_string(),
                        value: "unknown".to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::ColumnDecode { index, source } => DbError::Corrupt {
                table: "unknown".to_string(),
                id: index,
                reason: source.to_string(),
            },

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;
