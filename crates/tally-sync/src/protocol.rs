//! # Sync Protocol Messages
//!
//! JSON wire types exchanged with the remote store.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol (JSON, camelCase)                    │
//! │                                                                         │
//! │  PUSH (one change per request)                                         │
//! │  ─────────────────────────────                                         │
//! │  CLIENT ───► SyncRequest  { changes: [ClientChange] }                  │
//! │  SERVER ◄─── SyncResponse { serverTimestamp, results: [ChangeResult] } │
//! │                                                                         │
//! │  PULL                                                                  │
//! │  ────                                                                  │
//! │  CLIENT ───► SyncRequest  { lastSyncedAt?, changes: [] }               │
//! │  SERVER ◄─── SyncResponse { serverTimestamp, changes: [ServerChange] } │
//! │                                                                         │
//! │  CONFLICT (HTTP 409)                                                   │
//! │  ───────────────────                                                   │
//! │  SERVER ◄─── SyncResponse { conflicts: [WireConflict] }                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! ```json
//! {
//!   "lastSyncedAt": "2024-05-01T10:00:00Z",
//!   "changes": [
//!     { "table": "customers", "operation": "create", "id": "c-1",
//!       "data": { "name": "Ada" }, "clientTimestamp": "2024-05-01T09:59:00Z" }
//!   ]
//! }
//! ```
//!
//! `baseSyncedAt` on a change and `results` on a response are optional
//! extensions; servers that do not know them ignore or omit them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tally_core::{
    CoreResult, EntityPayload, EntityTable, Record, ResolutionKind, SyncOperation, SyncQueueEntry,
};

// =============================================================================
// Request
// =============================================================================

/// Body of every call to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Pull cursor. Absent on the first pull and on pushes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub changes: Vec<ClientChange>,
}

impl SyncRequest {
    /// A push of a single change.
    pub fn push(change: ClientChange) -> Self {
        SyncRequest {
            last_synced_at: None,
            changes: vec![change],
        }
    }

    /// A pull of everything after `since`.
    pub fn pull(since: Option<DateTime<Utc>>) -> Self {
        SyncRequest {
            last_synced_at: since,
            changes: Vec::new(),
        }
    }
}

/// A local mutation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientChange {
    pub table: EntityTable,
    pub operation: SyncOperation,

    /// Client id for creates (the server keys creates by it), server id
    /// otherwise.
    pub id: String,

    /// Untagged payload object. Absent for deletes.
    #[serde(default)]
    pub data: Option<Value>,

    pub client_timestamp: DateTime<Utc>,

    /// Server timestamp the edit was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_synced_at: Option<DateTime<Utc>>,
}

impl ClientChange {
    /// Builds the wire change for a queue entry.
    ///
    /// `record` is the entry's local record when it still exists; it
    /// supplies the client timestamp and the base the edit was made on.
    pub fn from_entry(entry: &SyncQueueEntry, record: Option<&Record>) -> Self {
        ClientChange {
            table: entry.table,
            operation: entry.operation,
            id: entry.record_id.clone(),
            data: entry.payload.as_ref().map(EntityPayload::to_data),
            client_timestamp: record
                .map(|r| r.meta.client_updated_at)
                .unwrap_or(entry.enqueued_at),
            base_synced_at: record.and_then(|r| r.meta.server_synced_at),
        }
    }
}

// =============================================================================
// Response
// =============================================================================

/// Body of every answer from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub server_timestamp: DateTime<Utc>,

    #[serde(default)]
    pub changes: Vec<ServerChange>,

    #[serde(default)]
    pub conflicts: Vec<WireConflict>,

    #[serde(default)]
    pub results: Vec<ChangeResult>,
}

/// A server-side change since the client's checkpoint.
///
/// `table` stays a string so one change for an unknown table fails alone
/// instead of failing the whole response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerChange {
    pub table: String,
    pub operation: SyncOperation,

    /// Server id.
    pub id: String,

    #[serde(default)]
    pub data: Option<Value>,

    pub server_timestamp: DateTime<Utc>,
}

impl ServerChange {
    pub fn entity_table(&self) -> CoreResult<EntityTable> {
        self.table.parse()
    }

    /// The server's version of the record, `None` for a delete.
    pub fn server_data(&self) -> Option<&Value> {
        match self.operation {
            SyncOperation::Delete => None,
            SyncOperation::Create | SyncOperation::Update => self.data.as_ref(),
        }
    }
}

/// A conflict the server detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireConflict {
    pub table: String,
    pub id: String,

    #[serde(default)]
    pub client_data: Option<Value>,

    /// Absent when the server deleted the record.
    #[serde(default)]
    pub server_data: Option<Value>,

    pub resolution: ResolutionKind,

    /// When the server version was written. Falls back to the response's
    /// `serverTimestamp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
}

/// Per-change outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Applied,
    Rejected,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeResult {
    /// The id the change was sent with.
    pub id: String,
    pub status: ChangeStatus,

    /// Server-assigned id for an applied create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tally_core::{Customer, QueueState};

    fn customer_entry() -> SyncQueueEntry {
        SyncQueueEntry {
            seq: 1,
            table: EntityTable::Customers,
            operation: SyncOperation::Create,
            record_id: "c-1".into(),
            payload: Some(EntityPayload::Customer(Customer {
                name: "Ada".into(),
                phone: None,
                email: None,
                notes: None,
                loyalty_points: 0,
            })),
            enqueued_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 0).unwrap(),
            attempts: 0,
            last_error: None,
            revision: 1,
            state: QueueState::Active,
        }
    }

    #[test]
    fn test_push_request_uses_camel_case() {
        let change = ClientChange::from_entry(&customer_entry(), None);
        let value = serde_json::to_value(SyncRequest::push(change)).unwrap();

        assert_eq!(
            value,
            json!({
                "changes": [{
                    "table": "customers",
                    "operation": "create",
                    "id": "c-1",
                    "data": {
                        "name": "Ada",
                        "phone": null,
                        "email": null,
                        "notes": null,
                        "loyalty_points": 0
                    },
                    "clientTimestamp": "2024-05-01T09:59:00Z"
                }]
            })
        );
    }

    #[test]
    fn test_change_takes_timestamps_from_record() {
        let entry = customer_entry();
        let mut record = Record::with_client_id("c-1", entry.payload.clone().unwrap());
        let synced = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        record.meta.server_synced_at = Some(synced);

        let change = ClientChange::from_entry(&entry, Some(&record));
        assert_eq!(change.client_timestamp, record.meta.client_updated_at);
        assert_eq!(change.base_synced_at, Some(synced));
    }

    #[test]
    fn test_minimal_response_defaults() {
        let response: SyncResponse =
            serde_json::from_str(r#"{ "serverTimestamp": "2024-05-01T10:00:00Z" }"#).unwrap();

        assert!(response.changes.is_empty());
        assert!(response.conflicts.is_empty());
        assert!(response.results.is_empty());
    }

    #[test]
    fn test_pull_response_with_unknown_table_still_parses() {
        let response: SyncResponse = serde_json::from_value(json!({
            "serverTimestamp": "2024-05-01T10:00:00Z",
            "changes": [
                { "table": "invoices", "operation": "update", "id": "i-1",
                  "data": {}, "serverTimestamp": "2024-05-01T09:00:00Z" },
                { "table": "customers", "operation": "delete", "id": "srv-1",
                  "data": { "name": "gone" }, "serverTimestamp": "2024-05-01T09:30:00Z" }
            ],
            "conflicts": [
                { "table": "customers", "id": "srv-2", "serverData": { "name": "Bob" },
                  "resolution": "manual" }
            ],
            "results": [
                { "id": "c-9", "status": "applied", "serverId": "srv-9" }
            ]
        }))
        .unwrap();

        assert!(response.changes[0].entity_table().is_err());
        assert_eq!(
            response.changes[1].entity_table().unwrap(),
            EntityTable::Customers
        );
        // A delete carries no server version even if data was sent.
        assert_eq!(response.changes[1].server_data(), None);
        assert_eq!(response.conflicts[0].resolution, ResolutionKind::Manual);
        assert_eq!(response.results[0].status, ChangeStatus::Applied);
        assert_eq!(response.results[0].server_id.as_deref(), Some("srv-9"));
    }
}
