//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  └── CoreError        - Decoding and identity failures                 │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  └── SyncError        - Network, conflict and cycle failures           │
//! │                                                                         │
//! │  Flow: CoreError → DbError → SyncError → status / operator             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A table name that is not one of the syncable entity tables.
    ///
    /// ## When This Occurs
    /// - A server change names a table this client does not store
    /// - A queue row was written by a newer client version
    #[error("Unknown entity table: {0}")]
    UnknownTable(String),

    /// Unknown queue operation name.
    #[error("Unknown sync operation: {0}")]
    UnknownOperation(String),

    /// A payload could not be decoded into the typed schema for its table.
    ///
    /// ## When This Occurs
    /// - A stored JSON column was truncated or hand-edited
    /// - The server sent a field with the wrong type
    #[error("Invalid {table} payload: {reason}")]
    InvalidPayload { table: String, reason: String },

    /// Payload carried for a different table than expected.
    #[error("Payload table mismatch: expected {expected}, got {actual}")]
    TableMismatch { expected: String, actual: String },
}

impl CoreError {
    /// Creates an InvalidPayload error.
    pub fn invalid_payload(table: impl Into<String>, reason: impl ToString) -> Self {
        CoreError::InvalidPayload {
            table: table.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
