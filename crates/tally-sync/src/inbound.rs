//! # Inbound Handler
//!
//! The pull phase of a sync cycle: applies server-side changes since the
//! checkpoint to the local store.
//!
//! ## Per-Change Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       ServerChange → local store                        │
//! │                                                                         │
//! │  1. table known?              no ──► per-record failure                │
//! │  2. lock (table, client id), begin write transaction                   │
//! │  3. re-read local record inside the transaction                        │
//! │  4. apply_server_version_in                                            │
//! │       no pending mutation ──► apply directly                           │
//! │       pending mutation    ──► conflict resolver                        │
//! │  5. COMMIT                                                             │
//! │                                                                         │
//! │  A corrupt local row is replaced by the server version (Repaired).    │
//! │  A failed change is recorded and skipped; the rest still apply.       │
//! │  Any failure keeps the checkpoint where it was, so the next pull       │
//! │  fetches the whole batch again.                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use tally_db::{Database, RecordRepository};

use crate::apply::{apply_server_version_in, repair_corrupt_in, ApplyOutcome, ServerVersion};
use crate::error::{SyncError, SyncResult};
use crate::protocol::ServerChange;

/// A server change that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub table: String,
    pub id: String,
    pub error: String,
}

/// Outcome counts of one pull phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub received: usize,
    /// Inserted, overwritten or removed without local edits in the way.
    pub applied: usize,
    pub ignored: usize,
    /// Changes that met local edits (merged, kept, replaced or parked).
    pub conflicts: usize,
    /// Records now waiting for an operator.
    pub manual: usize,
    /// Corrupt local rows replaced by the server version.
    pub repaired: usize,
    pub failures: Vec<RecordFailure>,
}

impl InboundReport {
    /// True when every change was applied or deliberately skipped.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies pulled changes.
pub struct InboundHandler {
    db: Database,
    cancel: Arc<AtomicBool>,
}

impl InboundHandler {
    pub fn new(db: Database, cancel: Arc<AtomicBool>) -> Self {
        InboundHandler { db, cancel }
    }

    /// Applies `changes` in order, one transaction per change.
    ///
    /// ## Errors
    /// Fatal errors and cancellation stop the phase. Everything else is a
    /// per-record failure in the report.
    pub async fn apply_changes(&self, changes: &[ServerChange]) -> SyncResult<InboundReport> {
        let mut report = InboundReport {
            received: changes.len(),
            ..Default::default()
        };

        for change in changes {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }

            match self.apply_one(change).await {
                Ok(outcome) => {
                    match &outcome {
                        ApplyOutcome::Inserted
                        | ApplyOutcome::Overwritten
                        | ApplyOutcome::Removed
                        | ApplyOutcome::BothDeleted => report.applied += 1,
                        ApplyOutcome::Ignored | ApplyOutcome::ConflictRefreshed => {
                            report.ignored += 1
                        }
                        ApplyOutcome::Manual { .. } => {
                            report.conflicts += 1;
                            report.manual += 1;
                        }
                        ApplyOutcome::Repaired { .. } => report.repaired += 1,
                        other if other.is_conflict() => report.conflicts += 1,
                        _ => {}
                    }
                    debug!(table = %change.table, id = %change.id, ?outcome, "Applied server change");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(table = %change.table, id = %change.id, error = %e, "Server change not applied");
                    report.failures.push(RecordFailure {
                        table: change.table.clone(),
                        id: change.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            received = report.received,
            applied = report.applied,
            ignored = report.ignored,
            conflicts = report.conflicts,
            repaired = report.repaired,
            failed = report.failures.len(),
            "Pull phase finished"
        );
        Ok(report)
    }

    async fn apply_one(&self, change: &ServerChange) -> SyncResult<ApplyOutcome> {
        let table = change
            .entity_table()
            .map_err(|e| SyncError::SerializationFailed(e.to_string()))?;

        let client_id = self
            .db
            .records()
            .find_client_id(table, &change.id)
            .await?
            .unwrap_or_else(|| change.id.clone());

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;
        let version = ServerVersion {
            id: &change.id,
            data: change.server_data(),
            updated_at: change.server_timestamp,
        };
        let now = Utc::now();
        let outcome = match RecordRepository::fetch_in(&mut tx, table, &change.id).await {
            Ok(record) => apply_server_version_in(&mut tx, table, record, &version, now).await?,
            Err(e) if e.is_corrupt() => {
                repair_corrupt_in(&mut tx, table, &version, &e.to_string(), now).await?
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        Ok(outcome)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use chrono::{DateTime, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tally_core::{EntityTable, SyncOperation, SyncStatus};
    use tally_db::DbConfig;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn upsert(table: &str, id: &str, data: serde_json::Value, minute: u32) -> ServerChange {
        ServerChange {
            table: table.into(),
            operation: SyncOperation::Update,
            id: id.into(),
            data: Some(data),
            server_timestamp: at(minute),
        }
    }

    async fn handler() -> (Database, InboundHandler) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let handler = InboundHandler::new(db.clone(), Arc::new(AtomicBool::new(false)));
        (db, handler)
    }

    #[tokio::test]
    async fn test_bad_change_fails_alone() {
        let (db, handler) = handler().await;
        let changes = vec![
            upsert("customers", "srv-1", fixtures::customer("Ada").to_data(), 1),
            upsert("customers", "srv-2", fixtures::customer("Bob").to_data(), 2),
            upsert("customers", "srv-3", json!({ "name": ["not", "a", "name"] }), 3),
            upsert("invoices", "srv-4", json!({}), 4),
            upsert("customers", "srv-5", fixtures::customer("Eve").to_data(), 5),
        ];

        let report = handler.apply_changes(&changes).await.unwrap();
        assert_eq!(report.received, 5);
        assert_eq!(report.applied, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].id, "srv-3");
        assert_eq!(report.failures[1].table, "invoices");
        assert!(!report.is_clean());

        let eve = db.records().get(EntityTable::Customers, "srv-5").await.unwrap().unwrap();
        assert_eq!(eve.status(), SyncStatus::Synced);
        assert_eq!(eve.meta.server_id.as_deref(), Some("srv-5"));
    }

    #[tokio::test]
    async fn test_reapplying_a_batch_is_harmless() {
        let (db, handler) = handler().await;
        let changes = vec![
            upsert("products", "srv-p1", fixtures::product("Cola", 299).to_data(), 1),
            ServerChange {
                table: "products".into(),
                operation: SyncOperation::Delete,
                id: "srv-p9".into(),
                data: None,
                server_timestamp: at(2),
            },
        ];

        let first = handler.apply_changes(&changes).await.unwrap();
        assert_eq!(first.applied, 1);
        assert_eq!(first.ignored, 1);

        let second = handler.apply_changes(&changes).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.ignored, 2);
        assert!(second.is_clean());

        let products = db.records().query(EntityTable::Products, |_| true).await.unwrap();
        assert_eq!(products.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_gives_way_to_server_delete() {
        let (db, handler) = handler().await;
        let changes = vec![upsert("customers", "srv-1", fixtures::customer("Ada").to_data(), 1)];
        handler.apply_changes(&changes).await.unwrap();

        db.records()
            .update(EntityTable::Customers, "srv-1", fixtures::customer("Ada L"))
            .await
            .unwrap();
        sqlx::query("UPDATE customers SET data = 'not json' WHERE client_id = 'srv-1'")
            .execute(db.pool())
            .await
            .unwrap();

        let delete = ServerChange {
            table: "customers".into(),
            operation: SyncOperation::Delete,
            id: "srv-1".into(),
            data: None,
            server_timestamp: at(5),
        };
        let report = handler.apply_changes(&[delete]).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.repaired, 1);
        assert!(db.records().find_client_id(EntityTable::Customers, "srv-1").await.unwrap().is_none());
        assert!(db.queue().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_between_changes() {
        let (db, handler) = handler().await;
        handler.cancel.store(true, Ordering::SeqCst);

        let changes = vec![upsert("customers", "srv-1", fixtures::customer("Ada").to_data(), 1)];
        let err = handler.apply_changes(&changes).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(db.records().get(EntityTable::Customers, "srv-1").await.unwrap().is_none());
    }
}
