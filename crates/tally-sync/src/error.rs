//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Retryable     │  │     Per-record          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network        │  │  ServerRejected         │ │
//! │  │  MissingDeviceId│  │   Unavailable   │  │  Conflict               │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  LocalStorageCorruption │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │  Fatal (cycle)  │  │     Internal                                │  │
//! │  │                 │  │                                             │  │
//! │  │ IdentityMismatch│  │  Cancelled, ShuttingDown, ChannelError      │  │
//! │  │ DatabaseError   │  │                                             │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
///
/// ## Design Principles
/// - Each variant includes enough context for debugging
/// - Errors are categorized for different handling strategies
/// - All errors are `Send + Sync` for async compatibility
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Invalid remote URL.
    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The remote store could not be reached (or answered 5xx).
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// A remote call did not finish in time.
    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    /// The remote refused a change (validation, 4xx other than 409).
    #[error("Server rejected change (status {status}): {message}")]
    ServerRejected { status: u16, message: String },

    /// Both sides changed the record; routed to the conflict resolver.
    #[error("Conflict on {table} record {id}")]
    Conflict { table: String, id: String },

    // =========================================================================
    // Local Store Errors
    // =========================================================================
    /// A stored record no longer decodes. Fatal to that record only.
    #[error("Local storage corruption in {table} record {id}: {reason}")]
    LocalStorageCorruption {
        table: String,
        id: String,
        reason: String,
    },

    /// Client id / server id mapping contradicts what is already stored.
    /// Aborts the cycle without advancing the checkpoint.
    #[error("Identity mismatch for {table} {client_id} -> {server_id}: {reason}")]
    IdentityMismatch {
        table: String,
        client_id: String,
        server_id: String,
        reason: String,
    },

    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// An operator resolution that cannot be applied (no open conflict,
    /// or keeping a record the server has deleted).
    #[error("Cannot resolve conflict: {0}")]
    InvalidResolution(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Failed to serialize or parse a wire message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// The running cycle was cancelled between commits.
    #[error("Sync cycle cancelled")]
    Cancelled,

    /// Coordinator is shutting down.
    #[error("Sync coordinator is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal coordinator error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tally_db::DbError> for SyncError {
    fn from(err: tally_db::DbError) -> Self {
        match err {
            tally_db::DbError::Corrupt { table, id, reason } => {
                SyncError::LocalStorageCorruption { table, id, reason }
            }
            other => SyncError::DatabaseError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::from(tally_db::DbError::from(err))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried after backoff.
    ///
    /// ## Retryable Errors
    /// - Network failures and 5xx answers
    /// - Timeouts
    ///
    /// ## Non-Retryable Errors
    /// - Server rejections (the record needs an operator edit)
    /// - Configuration errors
    /// - Local corruption and identity mismatches
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_) | SyncError::Timeout(_)
        )
    }

    /// Returns true if the whole cycle must stop without advancing the
    /// checkpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::IdentityMismatch { .. } | SyncError::DatabaseError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::NetworkUnavailable("connection refused".into()).is_retryable());
        assert!(SyncError::Timeout(15).is_retryable());

        assert!(!SyncError::ServerRejected {
            status: 422,
            message: "bad sku".into()
        }
        .is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::MissingDeviceId.is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        let mismatch = SyncError::IdentityMismatch {
            table: "customers".into(),
            client_id: "c-1".into(),
            server_id: "srv-2".into(),
            reason: "already mapped to srv-1".into(),
        };
        assert!(mismatch.is_fatal());
        assert!(mismatch.to_string().contains("c-1"));

        assert!(!SyncError::Timeout(1).is_fatal());
        assert!(!SyncError::LocalStorageCorruption {
            table: "sales".into(),
            id: "s-1".into(),
            reason: "bad json".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_corrupt_db_error_maps_to_local_corruption() {
        let err: SyncError = tally_db::DbError::corrupt(
            tally_core::EntityTable::Sales,
            "s-1",
            "expected value at line 1",
        )
        .into();
        assert!(matches!(err, SyncError::LocalStorageCorruption { ref id, .. } if id == "s-1"));

        let err: SyncError = tally_db::DbError::PoolExhausted.into();
        assert!(matches!(err, SyncError::DatabaseError(_)));
    }
}
