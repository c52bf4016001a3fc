//! # Domain Types
//!
//! Sync metadata shared by the local store, the queue and the coordinator.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Domain Types                               │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Record      │   │ SyncQueueEntry  │   │  ConflictEntry  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  meta (SyncMeta)│   │  seq / revision │   │  client_data    │       │
//! │  │  payload        │   │  operation      │   │  server_data    │       │
//! │  │  base           │   │  record_id      │   │  resolution     │       │
//! │  │  deleted        │   │  state          │   │  fields         │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   SyncStatus    │   │  SyncOperation  │   │ SyncCheckpoint  │       │
//! │  │  synced         │   │  create         │   │  last_synced_at │       │
//! │  │  pending        │   │  update         │   └─────────────────┘       │
//! │  │  failed         │   │  delete         │                              │
//! │  │  conflict       │   └─────────────────┘                              │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual Identity
//! Every record has a `client_id` minted where it was created and, once the
//! server has accepted it, a `server_id`. The client id is the local primary
//! key forever; the server id is what other records and the wire refer to
//! after reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;
use uuid::Uuid;

use crate::error::CoreError;
use crate::payload::EntityPayload;

// =============================================================================
// Entity Table
// =============================================================================

/// A syncable entity table.
///
/// The string form is both the SQLite table name and the wire `table` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum EntityTable {
    Customers,
    Products,
    Sales,
    Repairs,
}

impl EntityTable {
    /// All syncable tables, in dependency order (referenced tables first).
    pub const ALL: [EntityTable; 4] = [
        EntityTable::Customers,
        EntityTable::Products,
        EntityTable::Sales,
        EntityTable::Repairs,
    ];

    /// Returns the table name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Customers => "customers",
            EntityTable::Products => "products",
            EntityTable::Sales => "sales",
            EntityTable::Repairs => "repairs",
        }
    }

    /// Tables whose payloads may reference records of `self`.
    pub fn referenced_by(&self) -> &'static [EntityTable] {
        match self {
            EntityTable::Customers => &[EntityTable::Sales, EntityTable::Repairs],
            EntityTable::Products => &[EntityTable::Sales],
            EntityTable::Sales => &[EntityTable::Repairs],
            EntityTable::Repairs => &[],
        }
    }
}

impl fmt::Display for EntityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityTable {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customers" => Ok(EntityTable::Customers),
            "products" => Ok(EntityTable::Products),
            "sales" => Ok(EntityTable::Sales),
            "repairs" => Ok(EntityTable::Repairs),
            other => Err(CoreError::UnknownTable(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Status
// =============================================================================

/// Per-record sync state.
///
/// ## Lifecycle
/// ```text
///   local mutation            push ok
///   ─────────────► pending ─────────────► synced
///                   │  ▲                    ▲
///        push error │  │ operator resave    │ operator keeps server
///                   ▼  │                    │
///                  failed      conflict ────┘
///                   pending ──► conflict (manual resolution)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Matches the server; no queue entry.
    Synced,
    /// Has exactly one active queue entry.
    Pending,
    /// Last push failed; see `last_sync_error`.
    Failed,
    /// Waiting for an operator to pick a side.
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// The kind of mutation a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Outcome of folding a new mutation into an un-sent queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// Replace the entry in place with this operation and the new payload.
    Replace(SyncOperation),
    /// The record never reached the server: drop the entry and the record.
    CancelBoth,
}

impl SyncOperation {
    /// Folds `incoming` into an existing entry carrying `existing`.
    ///
    /// ```text
    /// existing \ new │ create  │ update  │ delete
    /// ───────────────┼─────────┼─────────┼────────────
    /// create         │ create  │ create  │ cancel both
    /// update         │ update  │ update  │ delete
    /// delete         │ update  │ update  │ delete
    /// ```
    pub fn coalesce(existing: SyncOperation, incoming: SyncOperation) -> Coalesced {
        use SyncOperation::*;

        match (existing, incoming) {
            (Create, Delete) => Coalesced::CancelBoth,
            (Create, _) => Coalesced::Replace(Create),
            (_, Delete) => Coalesced::Replace(Delete),
            (_, _) => Coalesced::Replace(Update),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncOperation::Create),
            "update" => Ok(SyncOperation::Update),
            "delete" => Ok(SyncOperation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// Sync metadata carried by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncMeta {
    pub sync_status: SyncStatus,

    /// Minted by the creating client. Local primary key.
    pub client_id: String,

    /// Assigned by the server on first accepted create. Immutable once set.
    pub server_id: Option<String>,

    #[ts(as = "String")]
    pub client_created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub client_updated_at: DateTime<Utc>,

    /// Server timestamp of the version this client last reconciled with.
    #[ts(as = "Option<String>")]
    pub server_synced_at: Option<DateTime<Utc>>,

    /// Consecutive failed push attempts of the pending mutation.
    pub sync_attempts: i64,

    pub last_sync_error: Option<String>,
}

impl SyncMeta {
    /// Metadata for a record created locally, not yet pushed.
    pub fn new_local(client_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        SyncMeta {
            sync_status: SyncStatus::Pending,
            client_id: client_id.into(),
            server_id: None,
            client_created_at: now,
            client_updated_at: now,
            server_synced_at: None,
            sync_attempts: 0,
            last_sync_error: None,
        }
    }

    /// Metadata for a record first seen in a server change.
    ///
    /// The server id doubles as the local client id.
    pub fn from_server(server_id: impl Into<String>, server_ts: DateTime<Utc>) -> Self {
        let id = server_id.into();
        SyncMeta {
            sync_status: SyncStatus::Synced,
            client_id: id.clone(),
            server_id: Some(id),
            client_created_at: server_ts,
            client_updated_at: server_ts,
            server_synced_at: Some(server_ts),
            sync_attempts: 0,
            last_sync_error: None,
        }
    }
}

/// A syncable record: typed payload plus sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Record {
    pub meta: SyncMeta,

    pub payload: EntityPayload,

    /// Last server-acknowledged version, the common ancestor for merges.
    pub base: Option<EntityPayload>,

    /// Tombstone: deleted locally, delete not yet acknowledged.
    pub deleted: bool,
}

impl Record {
    /// Creates a new local record with a freshly minted client id.
    pub fn new_local(payload: EntityPayload) -> Self {
        Self::with_client_id(Uuid::new_v4().to_string(), payload)
    }

    /// Creates a new local record with a caller-chosen client id.
    pub fn with_client_id(client_id: impl Into<String>, payload: EntityPayload) -> Self {
        Record {
            meta: SyncMeta::new_local(client_id, Utc::now()),
            payload,
            base: None,
            deleted: false,
        }
    }

    #[inline]
    pub fn table(&self) -> EntityTable {
        self.payload.table()
    }

    #[inline]
    pub fn client_id(&self) -> &str {
        &self.meta.client_id
    }

    /// The id the server knows this record by: server id when assigned,
    /// otherwise the client id.
    pub fn remote_id(&self) -> &str {
        self.meta
            .server_id
            .as_deref()
            .unwrap_or(&self.meta.client_id)
    }

    #[inline]
    pub fn status(&self) -> SyncStatus {
        self.meta.sync_status
    }
}

// =============================================================================
// Sync Queue
// =============================================================================

/// Whether a queue entry is in automatic retry rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Active,
    /// Needs an operator: rejected, retries exhausted, or manual conflict.
    Parked,
}

/// A pending local mutation awaiting transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueEntry {
    /// Queue position; coalescing keeps it.
    pub seq: i64,
    pub table: EntityTable,
    pub operation: SyncOperation,
    /// Client id until reconciled, then the server id.
    pub record_id: String,
    /// Absent for deletes.
    pub payload: Option<EntityPayload>,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Bumped on every coalesced replacement.
    pub revision: i64,
    pub state: QueueState,
}

// =============================================================================
// Conflicts
// =============================================================================

/// How a conflict was (or must be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    ClientWins,
    ServerWins,
    Manual,
}

/// A recorded conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub id: i64,
    pub table: EntityTable,
    /// Local client id of the record.
    pub record_id: String,
    pub client_data: Option<Value>,
    /// Absent when the server deleted the record.
    pub server_data: Option<Value>,
    pub server_updated_at: DateTime<Utc>,
    pub resolution: ResolutionKind,
    /// Fields changed differently on both sides.
    pub fields: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Checkpoint & Counts
// =============================================================================

/// Server timestamp of the most recent fully committed pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncCheckpoint {
    #[ts(as = "Option<String>")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    /// No pull has completed yet: the next pull is a full pull.
    pub fn is_initial(&self) -> bool {
        self.last_synced_at.is_none()
    }
}

/// Record counts shown to the operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncCounts {
    pub pending: i64,
    pub failed: i64,
    pub conflict: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Customer;

    #[test]
    fn test_table_round_trip_names() {
        for table in EntityTable::ALL {
            assert_eq!(table.as_str().parse::<EntityTable>().unwrap(), table);
        }
        assert!("invoices".parse::<EntityTable>().is_err());
    }

    #[test]
    fn test_coalesce_rules() {
        use SyncOperation::*;

        assert_eq!(SyncOperation::coalesce(Create, Update), Coalesced::Replace(Create));
        assert_eq!(SyncOperation::coalesce(Create, Delete), Coalesced::CancelBoth);
        assert_eq!(SyncOperation::coalesce(Update, Update), Coalesced::Replace(Update));
        assert_eq!(SyncOperation::coalesce(Update, Delete), Coalesced::Replace(Delete));
        assert_eq!(SyncOperation::coalesce(Delete, Create), Coalesced::Replace(Update));
    }

    #[test]
    fn test_remote_id_prefers_server_id() {
        let mut record = Record::with_client_id(
            "c-1",
            EntityPayload::Customer(Customer {
                name: "Ada".into(),
                phone: None,
                email: None,
                notes: None,
                loyalty_points: 0,
            }),
        );
        assert_eq!(record.remote_id(), "c-1");
        assert_eq!(record.status(), SyncStatus::Pending);

        record.meta.server_id = Some("srv-1".into());
        assert_eq!(record.remote_id(), "srv-1");
        assert_eq!(record.client_id(), "c-1");
    }

    #[test]
    fn test_server_meta_is_synced() {
        let meta = SyncMeta::from_server("srv-7", Utc::now());
        assert_eq!(meta.client_id, "srv-7");
        assert_eq!(meta.server_id.as_deref(), Some("srv-7"));
        assert_eq!(meta.sync_status, SyncStatus::Synced);
    }
}
