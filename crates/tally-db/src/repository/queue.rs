//! # Sync Queue Repository
//!
//! Pending local mutations awaiting transmission, one entry per record.
//!
//! ## The Queue
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Sync Queue Lifecycle                                 │
//! │                                                                         │
//! │  LOCAL MUTATION (create / update / remove)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │  1. write the record row                                        │   │
//! │  │  2. enqueue_in: entry exists for (table, record_id)?            │   │
//! │  │       no  → INSERT (new seq)                  → Appended        │   │
//! │  │       yes → coalesce in place (same seq, revision + 1)          │   │
//! │  │             create + delete → DELETE entry    → Cancelled       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COORDINATOR                                                           │
//! │  dequeue_batch(max) ── active entries, seq order                       │
//! │       │                                                                 │
//! │       ├── success   → ack(seq, revision sent)                          │
//! │       │                 same revision → Removed                        │
//! │       │                 newer revision → Superseded (entry stays)      │
//! │       │                 entry gone     → AlreadyAcked                  │
//! │       ├── retryable → fail: attempts + 1, last_error                   │
//! │       └── terminal  → park: out of rotation until the operator acts    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::{decode_ts, encode_ts};
use tally_core::{
    Coalesced, EntityPayload, EntityTable, QueueState, SyncOperation, SyncQueueEntry,
};

const COLUMNS: &str =
    "seq, entity_table, operation, record_id, payload, enqueued_at, attempts, last_error, revision, state";

// =============================================================================
// Outcomes
// =============================================================================

/// What `enqueue_in` did with a new mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New entry at the tail of the queue.
    Appended(i64),
    /// Folded into the existing entry at this position.
    Coalesced(i64),
    /// A delete met a create that never reached the server; both are gone.
    Cancelled,
}

/// What `ack` did with an entry the remote accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The entry was removed.
    Removed,
    /// A newer mutation coalesced in while this one was in flight. The entry
    /// stays; a sent create has been turned into an update.
    Superseded,
    /// No entry with that seq remains.
    AlreadyAcked,
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct QueueRow {
    seq: i64,
    entity_table: String,
    operation: String,
    record_id: String,
    payload: Option<String>,
    enqueued_at: String,
    attempts: i64,
    last_error: Option<String>,
    revision: i64,
    state: String,
}

impl QueueRow {
    fn corrupt(&self, reason: impl ToString) -> DbError {
        DbError::Corrupt {
            table: "sync_queue".to_string(),
            id: self.seq.to_string(),
            reason: reason.to_string(),
        }
    }

    fn into_entry(self) -> DbResult<SyncQueueEntry> {
        let table: EntityTable = self.entity_table.parse().map_err(|e| self.corrupt(e))?;
        let operation: SyncOperation = self.operation.parse().map_err(|e| self.corrupt(e))?;
        let state = match self.state.as_str() {
            "active" => QueueState::Active,
            "parked" => QueueState::Parked,
            other => return Err(self.corrupt(format!("unknown state '{}'", other))),
        };
        let payload = match &self.payload {
            Some(json) => Some(
                EntityPayload::from_json_str(table, json).map_err(|e| self.corrupt(e))?,
            ),
            None => None,
        };
        let enqueued_at = decode_ts(&self.enqueued_at).map_err(|e| self.corrupt(e))?;

        Ok(SyncQueueEntry {
            seq: self.seq,
            table,
            operation,
            record_id: self.record_id,
            payload,
            enqueued_at,
            attempts: self.attempts,
            last_error: self.last_error,
            revision: self.revision,
            state,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the sync queue.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    db: Database,
}

impl SyncQueueRepository {
    /// Creates a new SyncQueueRepository.
    pub fn new(db: Database) -> Self {
        SyncQueueRepository { db }
    }

    // -------------------------------------------------------------------------
    // Transaction-scoped operations
    // -------------------------------------------------------------------------

    /// Appends a mutation, coalescing with an un-sent entry for the same
    /// record.
    ///
    /// Coalescing resets `attempts`, clears `last_error` and re-activates a
    /// parked entry: new content gets a fresh retry budget.
    pub async fn enqueue_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        operation: SyncOperation,
        record_id: &str,
        payload: Option<&EntityPayload>,
        now: DateTime<Utc>,
    ) -> DbResult<EnqueueOutcome> {
        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT seq, operation FROM sync_queue WHERE entity_table = ?1 AND record_id = ?2",
        )
        .bind(table.as_str())
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;

        let payload_json = payload.map(EntityPayload::to_json_string);

        let Some((seq, existing_op)) = existing else {
            let seq: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO sync_queue (
                    entity_table, operation, record_id, payload, enqueued_at,
                    attempts, last_error, revision, state
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, 1, 'active')
                RETURNING seq
                "#,
            )
            .bind(table.as_str())
            .bind(operation.as_str())
            .bind(record_id)
            .bind(&payload_json)
            .bind(encode_ts(now))
            .fetch_one(&mut *conn)
            .await?;

            debug!(table = %table, record_id = %record_id, seq, op = %operation, "Enqueued");
            return Ok(EnqueueOutcome::Appended(seq));
        };

        let existing_op: SyncOperation = existing_op
            .parse()
            .map_err(|e| DbError::corrupt(table, record_id, e))?;

        match SyncOperation::coalesce(existing_op, operation) {
            Coalesced::CancelBoth => {
                sqlx::query("DELETE FROM sync_queue WHERE seq = ?1")
                    .bind(seq)
                    .execute(&mut *conn)
                    .await?;

                debug!(table = %table, record_id = %record_id, seq, "Create cancelled by delete");
                Ok(EnqueueOutcome::Cancelled)
            }
            Coalesced::Replace(merged) => {
                sqlx::query(
                    r#"
                    UPDATE sync_queue SET
                        operation = ?2,
                        payload = ?3,
                        attempts = 0,
                        last_error = NULL,
                        revision = revision + 1,
                        state = 'active'
                    WHERE seq = ?1
                    "#,
                )
                .bind(seq)
                .bind(merged.as_str())
                .bind(&payload_json)
                .execute(&mut *conn)
                .await?;

                debug!(
                    table = %table,
                    record_id = %record_id,
                    seq,
                    from = %existing_op,
                    to = %merged,
                    "Coalesced into existing entry"
                );
                Ok(EnqueueOutcome::Coalesced(seq))
            }
        }
    }

    /// Acknowledges an entry the remote accepted at `sent_revision`.
    pub async fn ack_in(
        conn: &mut SqliteConnection,
        seq: i64,
        sent_revision: i64,
    ) -> DbResult<AckOutcome> {
        let current: Option<(i64, String)> =
            sqlx::query_as("SELECT revision, operation FROM sync_queue WHERE seq = ?1")
                .bind(seq)
                .fetch_optional(&mut *conn)
                .await?;

        let Some((revision, operation)) = current else {
            return Ok(AckOutcome::AlreadyAcked);
        };

        if revision == sent_revision {
            sqlx::query("DELETE FROM sync_queue WHERE seq = ?1")
                .bind(seq)
                .execute(&mut *conn)
                .await?;
            return Ok(AckOutcome::Removed);
        }

        // The server now has the record; whatever follows is an update.
        if operation == SyncOperation::Create.as_str() {
            sqlx::query("UPDATE sync_queue SET operation = 'update' WHERE seq = ?1")
                .bind(seq)
                .execute(&mut *conn)
                .await?;
        }

        debug!(seq, sent_revision, revision, "Ack superseded by newer mutation");
        Ok(AckOutcome::Superseded)
    }

    /// Records a failed attempt of the revision that was sent.
    ///
    /// ## Returns
    /// The new attempt count, or `None` when the entry is gone or was
    /// replaced by a newer mutation (which starts with a fresh budget).
    pub async fn fail_in(
        conn: &mut SqliteConnection,
        seq: i64,
        sent_revision: i64,
        error: &str,
    ) -> DbResult<Option<i64>> {
        let attempts: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sync_queue SET
                attempts = attempts + 1,
                last_error = ?3
            WHERE seq = ?1 AND revision = ?2
            RETURNING attempts
            "#,
        )
        .bind(seq)
        .bind(sent_revision)
        .bind(error)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(attempts)
    }

    /// Takes an entry out of automatic retry rotation.
    pub async fn park_in(conn: &mut SqliteConnection, seq: i64, reason: &str) -> DbResult<()> {
        sqlx::query("UPDATE sync_queue SET state = 'parked', last_error = ?2 WHERE seq = ?1")
            .bind(seq)
            .bind(reason)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Puts a parked entry back into rotation with a fresh retry budget.
    pub async fn reactivate_in(conn: &mut SqliteConnection, seq: i64) -> DbResult<()> {
        sqlx::query(
            "UPDATE sync_queue SET state = 'active', attempts = 0, last_error = NULL WHERE seq = ?1",
        )
        .bind(seq)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn entry_for_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        record_id: &str,
    ) -> DbResult<Option<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE entity_table = ?1 AND record_id = ?2",
            COLUMNS
        );
        let row: Option<QueueRow> = sqlx::query_as(&sql)
            .bind(table.as_str())
            .bind(record_id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(QueueRow::into_entry).transpose()
    }

    /// Replaces the payload without touching revision or position.
    pub async fn replace_payload_in(
        conn: &mut SqliteConnection,
        seq: i64,
        payload: &EntityPayload,
    ) -> DbResult<()> {
        sqlx::query("UPDATE sync_queue SET payload = ?2 WHERE seq = ?1")
            .bind(seq)
            .bind(payload.to_json_string())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Points entries for `from` at `to` (client id to server id).
    pub async fn rewrite_record_id_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        from: &str,
        to: &str,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_queue SET record_id = ?3 WHERE entity_table = ?1 AND record_id = ?2",
        )
        .bind(table.as_str())
        .bind(from)
        .bind(to)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Entries in `table` whose payload text contains `needle`.
    ///
    /// A coarse text filter; callers decode and check real references.
    pub async fn entries_mentioning_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        needle: &str,
    ) -> DbResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE entity_table = ?1 AND instr(payload, ?2) > 0 ORDER BY seq",
            COLUMNS
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(table.as_str())
            .bind(needle)
            .fetch_all(&mut *conn)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping undecodable queue entry"),
            }
        }
        Ok(entries)
    }

    pub async fn remove_in(conn: &mut SqliteConnection, seq: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM sync_queue WHERE seq = ?1")
            .bind(seq)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Drops any entry for a record known by either of its ids.
    pub async fn remove_for_record_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        client_id: &str,
        server_id: Option<&str>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_queue WHERE entity_table = ?1 AND (record_id = ?2 OR record_id = ?3)",
        )
        .bind(table.as_str())
        .bind(client_id)
        .bind(server_id.unwrap_or(client_id))
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    // -------------------------------------------------------------------------
    // Standalone operations
    // -------------------------------------------------------------------------

    /// Returns up to `max` active entries, oldest first.
    ///
    /// Entries that no longer decode are parked with the decode error and
    /// left out; they never block the rest of the queue.
    pub async fn dequeue_batch(&self, max: u32) -> DbResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE state = 'active' ORDER BY seq ASC LIMIT ?1",
            COLUMNS
        );
        let rows: Vec<QueueRow> = sqlx::query_as(&sql)
            .bind(max)
            .fetch_all(self.db.pool())
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for row in rows {
            let seq = row.seq;
            match row.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(e) => corrupt.push((seq, e.to_string())),
            }
        }

        if !corrupt.is_empty() {
            let mut tx = self.db.begin_write().await?;
            for (seq, reason) in &corrupt {
                warn!(seq, reason = %reason, "Parking undecodable queue entry");
                Self::park_in(&mut tx, *seq, reason).await?;
            }
            tx.commit().await?;
        }

        Ok(entries)
    }

    /// Acknowledges a sent entry. See [`AckOutcome`].
    pub async fn ack(&self, entry: &SyncQueueEntry) -> DbResult<AckOutcome> {
        let mut tx = self.db.begin_write().await?;
        let outcome = Self::ack_in(&mut tx, entry.seq, entry.revision).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Records a failed attempt, leaving the entry queued for retry.
    pub async fn fail(&self, entry: &SyncQueueEntry, error: &str) -> DbResult<Option<i64>> {
        let mut tx = self.db.begin_write().await?;
        let attempts = Self::fail_in(&mut tx, entry.seq, entry.revision, error).await?;
        tx.commit().await?;
        Ok(attempts)
    }

    pub async fn park(&self, entry: &SyncQueueEntry, reason: &str) -> DbResult<()> {
        let mut tx = self.db.begin_write().await?;
        Self::park_in(&mut tx, entry.seq, reason).await?;
        tx.commit().await
    }

    pub async fn reactivate(&self, entry: &SyncQueueEntry) -> DbResult<()> {
        let mut tx = self.db.begin_write().await?;
        Self::reactivate_in(&mut tx, entry.seq).await?;
        tx.commit().await
    }

    /// The queue entry for a record, active or parked.
    pub async fn entry_for(
        &self,
        table: EntityTable,
        record_id: &str,
    ) -> DbResult<Option<SyncQueueEntry>> {
        let mut conn = self.db.pool().acquire().await?;
        Self::entry_for_in(&mut conn, table, record_id).await
    }

    /// Every entry, active and parked, in queue order.
    pub async fn list(&self) -> DbResult<Vec<SyncQueueEntry>> {
        let sql = format!("SELECT {} FROM sync_queue ORDER BY seq ASC", COLUMNS);
        let rows: Vec<QueueRow> = sqlx::query_as(&sql).fetch_all(self.db.pool()).await?;
        rows.into_iter().map(QueueRow::into_entry).collect()
    }

    pub async fn count_active(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE state = 'active'")
                .fetch_one(self.db.pool())
                .await?;
        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::repository::fixtures;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    async fn enqueue(
        db: &Database,
        op: SyncOperation,
        record_id: &str,
        payload: Option<EntityPayload>,
    ) -> EnqueueOutcome {
        let mut tx = db.begin_write().await.unwrap();
        let outcome = SyncQueueRepository::enqueue_in(
            &mut tx,
            EntityTable::Customers,
            op,
            record_id,
            payload.as_ref(),
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_edits_coalesce_at_first_position() {
        let db = test_db().await;
        let queue = db.queue();

        let a = enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("A"))).await;
        enqueue(&db, SyncOperation::Update, "c-2", Some(fixtures::customer("Other"))).await;
        let b = enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("B"))).await;

        let EnqueueOutcome::Appended(seq) = a else {
            panic!("expected append, got {:?}", a);
        };
        assert_eq!(b, EnqueueOutcome::Coalesced(seq));

        let batch = queue.dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].record_id, "c-1");
        assert_eq!(batch[0].payload, Some(fixtures::customer("B")));
        assert_eq!(batch[0].revision, 2);
        assert_eq!(batch[1].record_id, "c-2");
    }

    #[tokio::test]
    async fn test_delete_after_create_cancels_both() {
        let db = test_db().await;

        enqueue(&db, SyncOperation::Create, "c-1", Some(fixtures::customer("A"))).await;
        let outcome = enqueue(&db, SyncOperation::Delete, "c-1", None).await;

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert_eq!(db.queue().count_active().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_after_create_stays_create() {
        let db = test_db().await;

        enqueue(&db, SyncOperation::Create, "c-1", Some(fixtures::customer("A"))).await;
        enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("B"))).await;

        let entry = db
            .queue()
            .entry_for(EntityTable::Customers, "c-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.operation, SyncOperation::Create);
        assert_eq!(entry.payload, Some(fixtures::customer("B")));
    }

    #[tokio::test]
    async fn test_acked_entry_is_never_dequeued_again() {
        let db = test_db().await;
        let queue = db.queue();

        enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("A"))).await;
        let entry = queue.dequeue_batch(10).await.unwrap().remove(0);

        assert_eq!(queue.ack(&entry).await.unwrap(), AckOutcome::Removed);
        assert_eq!(queue.ack(&entry).await.unwrap(), AckOutcome::AlreadyAcked);
        assert!(queue.dequeue_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_of_stale_revision_keeps_newer_mutation() {
        let db = test_db().await;
        let queue = db.queue();

        enqueue(&db, SyncOperation::Create, "c-1", Some(fixtures::customer("A"))).await;
        let in_flight = queue.dequeue_batch(10).await.unwrap().remove(0);

        // Edited while the create was on the wire
        enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("B"))).await;

        assert_eq!(queue.ack(&in_flight).await.unwrap(), AckOutcome::Superseded);

        let survivor = queue.dequeue_batch(10).await.unwrap().remove(0);
        assert_eq!(survivor.seq, in_flight.seq);
        assert_eq!(survivor.operation, SyncOperation::Update);
        assert_eq!(survivor.payload, Some(fixtures::customer("B")));
    }

    #[tokio::test]
    async fn test_fail_counts_attempts_and_parked_entries_leave_rotation() {
        let db = test_db().await;
        let queue = db.queue();

        enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("A"))).await;
        let entry = queue.dequeue_batch(10).await.unwrap().remove(0);

        assert_eq!(queue.fail(&entry, "timeout").await.unwrap(), Some(1));
        assert_eq!(queue.fail(&entry, "timeout").await.unwrap(), Some(2));

        let stored = queue
            .entry_for(EntityTable::Customers, "c-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        queue.park(&stored, "rejected").await.unwrap();
        assert!(queue.dequeue_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.count_active().await.unwrap(), 0);

        queue.reactivate(&stored).await.unwrap();
        let back = queue.dequeue_batch(10).await.unwrap().remove(0);
        assert_eq!(back.attempts, 0);
        assert_eq!(back.state, QueueState::Active);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_parked_not_returned() {
        let db = test_db().await;
        let queue = db.queue();

        enqueue(&db, SyncOperation::Update, "c-1", Some(fixtures::customer("A"))).await;
        enqueue(&db, SyncOperation::Update, "c-2", Some(fixtures::customer("B"))).await;

        sqlx::query("UPDATE sync_queue SET payload = '{\"name\": 42' WHERE record_id = 'c-1'")
            .execute(db.pool())
            .await
            .unwrap();

        let batch = queue.dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record_id, "c-2");
        assert_eq!(queue.count_active().await.unwrap(), 1);
    }
}
