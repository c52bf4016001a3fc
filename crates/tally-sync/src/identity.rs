//! # Identity Reconciler
//!
//! Once the server accepts a create, the record's client id is mapped to its
//! new server id and every reference to the client id in the local store is
//! rewritten.
//!
//! ## Reconciliation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │          reconcile(customers, "c-1" → "srv-7")  (one transaction)       │
//! │                                                                         │
//! │  1. id_mappings        c-1 → srv-7        (mismatch ⇒ IdentityMismatch)│
//! │  2. customers row      server_id = srv-7                               │
//! │  3. sync_queue         record_id c-1 → srv-7                           │
//! │  4. sales / repairs    customer_id c-1 → srv-7   (payload and base)    │
//! │  5. queued payloads    customer_id c-1 → srv-7                         │
//! │  6. sync_conflicts     client_data customer_id c-1 → srv-7             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reconciling the same pair again is a no-op.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tally_core::EntityTable;
use tally_db::{
    ConflictRepository, Database, IdentityRepository, RecordRepository, SqliteConnection,
    SyncQueueRepository,
};

use crate::error::{SyncError, SyncResult};

/// What a reconciliation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Mapping recorded; `rewritten` references now carry the server id.
    Reconciled { rewritten: usize },

    /// The pair was already recorded.
    AlreadyReconciled,

    /// Mapping recorded, but the record itself is gone locally (deleted
    /// while its create was in flight). The server copy needs a delete.
    Orphaned { rewritten: usize },
}

/// Maps client ids to server ids and rewrites references.
pub struct IdentityReconciler;

impl IdentityReconciler {
    /// Reconciles inside the caller's transaction.
    ///
    /// ## Errors
    /// `IdentityMismatch` when the client id is already mapped elsewhere,
    /// the server id already belongs to another record, or the record
    /// already carries a different server id.
    pub async fn reconcile_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        client_id: &str,
        server_id: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<ReconcileOutcome> {
        let mismatch = |reason: String| SyncError::IdentityMismatch {
            table: table.to_string(),
            client_id: client_id.to_string(),
            server_id: server_id.to_string(),
            reason,
        };

        if let Some(existing) = IdentityRepository::lookup_in(conn, table, client_id).await? {
            if existing == server_id {
                debug!(table = %table, client_id, server_id, "Already reconciled");
                return Ok(ReconcileOutcome::AlreadyReconciled);
            }
            return Err(mismatch(format!("client id already mapped to {}", existing)));
        }

        if let Some(owner) = IdentityRepository::owner_of_in(conn, table, server_id).await? {
            if owner != client_id {
                return Err(mismatch(format!("server id already owned by {}", owner)));
            }
        }

        let record = RecordRepository::fetch_by_client_id_in(conn, table, client_id).await?;
        if let Some(record) = &record {
            if let Some(existing) = record.meta.server_id.as_deref() {
                if existing != server_id {
                    return Err(mismatch(format!("record already has server id {}", existing)));
                }
            }
        }

        // A pull can land the server's copy before the create is acked;
        // that copy is keyed by the server id and duplicates this record.
        if client_id != server_id {
            if let Some(duplicate) =
                RecordRepository::fetch_by_client_id_in(conn, table, server_id).await?
            {
                warn!(
                    table = %table,
                    client_id,
                    server_id,
                    duplicate_status = %duplicate.status(),
                    "Dropping pulled duplicate of reconciled record"
                );
                SyncQueueRepository::remove_for_record_in(conn, table, server_id, None).await?;
                RecordRepository::remove_row_in(conn, table, server_id).await?;
            }
        }

        let found = match record {
            Some(mut record) => {
                record.meta.server_id = Some(server_id.to_string());
                RecordRepository::upsert_in(conn, &record).await?;
                true
            }
            None => false,
        };
        IdentityRepository::insert_in(conn, table, client_id, server_id, now).await?;
        SyncQueueRepository::rewrite_record_id_in(conn, table, client_id, server_id).await?;

        let rewritten = Self::rewrite_references_in(conn, table, client_id, server_id).await?;

        info!(table = %table, client_id, server_id, rewritten, "Identity reconciled");
        Ok(if found {
            ReconcileOutcome::Reconciled { rewritten }
        } else {
            ReconcileOutcome::Orphaned { rewritten }
        })
    }

    /// Reconciles in its own transaction, under the record's lock.
    pub async fn reconcile(
        db: &Database,
        table: EntityTable,
        client_id: &str,
        server_id: &str,
    ) -> SyncResult<ReconcileOutcome> {
        let _guard = db.locks().lock(table, client_id).await;
        let mut tx = db.begin_write().await?;
        let outcome = Self::reconcile_in(&mut tx, table, client_id, server_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Rewrites `from` to `to` everywhere a record of `target` can be
    /// referenced. Returns the number of rows touched.
    async fn rewrite_references_in(
        conn: &mut SqliteConnection,
        target: EntityTable,
        from: &str,
        to: &str,
    ) -> SyncResult<usize> {
        let mut touched = 0usize;

        for &table in target.referenced_by() {
            for mut record in RecordRepository::records_mentioning_in(conn, table, from).await? {
                let mut count = record.payload.rewrite_references(target, from, to);
                if let Some(base) = record.base.as_mut() {
                    count += base.rewrite_references(target, from, to);
                }
                if count > 0 {
                    RecordRepository::upsert_in(conn, &record).await?;
                    touched += 1;
                }
            }

            for entry in SyncQueueRepository::entries_mentioning_in(conn, table, from).await? {
                let Some(mut payload) = entry.payload else {
                    continue;
                };
                if payload.rewrite_references(target, from, to) > 0 {
                    SyncQueueRepository::replace_payload_in(conn, entry.seq, &payload).await?;
                    touched += 1;
                }
            }
        }

        touched += ConflictRepository::rewrite_references_in(conn, target, from, to).await? as usize;
        Ok(touched)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
