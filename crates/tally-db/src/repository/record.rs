//! # Record Repository
//!
//! The local store: entity rows plus the mutation API the UI writes through.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    update(sales, id, payload)                           │
//! │                                                                         │
//! │  1. locks.lock(sales, client_id)     ← serializes with sync cycle      │
//! │  2. db.begin_write()                 ← single writer                   │
//! │  3. re-read row inside the tx                                          │
//! │     ├── conflict?  → RecordInConflict (operator must resolve first)    │
//! │     └── deleted?   → NotFound                                          │
//! │  4. canonicalize references (client ids with a mapping → server ids)  │
//! │  5. upsert row   (status pending, attempts reset)                      │
//! │  6. enqueue_in   (coalesces with any un-sent entry)                    │
//! │  7. COMMIT       ← row and queue entry become durable together         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::identity::IdentityRepository;
use crate::repository::queue::{EnqueueOutcome, SyncQueueRepository};
use crate::repository::{decode_opt_ts, decode_ts, encode_ts};
use tally_core::{
    EntityPayload, EntityTable, Record, SyncCounts, SyncMeta, SyncOperation, SyncStatus,
};

const COLUMNS: &str = "client_id, server_id, data, base_data, deleted, sync_status, \
                       client_created_at, client_updated_at, server_synced_at, \
                       sync_attempts, last_sync_error";

/// What `remove` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Record kept as a tombstone until the server acknowledges the delete.
    Tombstoned,
    /// Record never reached the server; it and its create are gone.
    Discarded,
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, FromRow)]
struct RecordRow {
    client_id: String,
    server_id: Option<String>,
    data: String,
    base_data: Option<String>,
    deleted: bool,
    sync_status: SyncStatus,
    client_created_at: String,
    client_updated_at: String,
    server_synced_at: Option<String>,
    sync_attempts: i64,
    last_sync_error: Option<String>,
}

impl RecordRow {
    fn into_record(self, table: EntityTable) -> DbResult<Record> {
        let id = self.client_id.clone();
        let corrupt = |reason: String| DbError::corrupt(table, id.clone(), reason);

        let payload = EntityPayload::from_json_str(table, &self.data)
            .map_err(|e| corrupt(e.to_string()))?;
        let base = self
            .base_data
            .as_deref()
            .map(|json| EntityPayload::from_json_str(table, json))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Record {
            meta: SyncMeta {
                sync_status: self.sync_status,
                client_id: self.client_id,
                server_id: self.server_id,
                client_created_at: decode_ts(&self.client_created_at)
                    .map_err(|e| corrupt(e.to_string()))?,
                client_updated_at: decode_ts(&self.client_updated_at)
                    .map_err(|e| corrupt(e.to_string()))?,
                server_synced_at: decode_opt_ts(self.server_synced_at.as_deref())
                    .map_err(|e| corrupt(e.to_string()))?,
                sync_attempts: self.sync_attempts,
                last_sync_error: self.last_sync_error,
            },
            payload,
            base,
            deleted: self.deleted,
        })
    }
}

/// Client timestamps never go backwards for one record.
fn touch(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

fn check_table(table: EntityTable, payload: &EntityPayload) -> DbResult<()> {
    if payload.table() != table {
        return Err(DbError::table_mismatch(table, payload.table()));
    }
    Ok(())
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for entity records.
///
/// ## Thread Safety
/// Cheap to clone. Writers on the same record are serialized by the
/// database's record locks.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    db: Database,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(db: Database) -> Self {
        RecordRepository { db }
    }

    // -------------------------------------------------------------------------
    // Transaction-scoped operations
    // -------------------------------------------------------------------------

    /// Fetches by client id or server id. A client id match wins.
    pub async fn fetch_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        id: &str,
    ) -> DbResult<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE client_id = ?1 OR server_id = ?1 \
             ORDER BY (client_id = ?1) DESC LIMIT 1",
            COLUMNS,
            table.as_str()
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|r| r.into_record(table)).transpose()
    }

    pub async fn fetch_by_client_id_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        client_id: &str,
    ) -> DbResult<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE client_id = ?1",
            COLUMNS,
            table.as_str()
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(client_id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(|r| r.into_record(table)).transpose()
    }

    /// `(client_id, server_id)` of the row matching `id`. Only the id
    /// columns are read, so this works on rows whose payload is corrupt.
    pub async fn ids_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        id: &str,
    ) -> DbResult<Option<(String, Option<String>)>> {
        let sql = format!(
            "SELECT client_id, server_id FROM {} WHERE client_id = ?1 OR server_id = ?1 \
             ORDER BY (client_id = ?1) DESC LIMIT 1",
            table.as_str()
        );
        let ids: Option<(String, Option<String>)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(ids)
    }

    /// Inserts or replaces a row keyed by client id.
    pub async fn upsert_in(conn: &mut SqliteConnection, record: &Record) -> DbResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} ({})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(client_id) DO UPDATE SET
                server_id = excluded.server_id,
                data = excluded.data,
                base_data = excluded.base_data,
                deleted = excluded.deleted,
                sync_status = excluded.sync_status,
                client_updated_at = excluded.client_updated_at,
                server_synced_at = excluded.server_synced_at,
                sync_attempts = excluded.sync_attempts,
                last_sync_error = excluded.last_sync_error
            "#,
            record.table().as_str(),
            COLUMNS
        );

        let meta = &record.meta;
        sqlx::query(&sql)
            .bind(&meta.client_id)
            .bind(&meta.server_id)
            .bind(record.payload.to_json_string())
            .bind(record.base.as_ref().map(EntityPayload::to_json_string))
            .bind(record.deleted)
            .bind(meta.sync_status)
            .bind(encode_ts(meta.client_created_at))
            .bind(encode_ts(meta.client_updated_at))
            .bind(meta.server_synced_at.map(encode_ts))
            .bind(meta.sync_attempts)
            .bind(&meta.last_sync_error)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    pub async fn remove_row_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        client_id: &str,
    ) -> DbResult<bool> {
        let sql = format!("DELETE FROM {} WHERE client_id = ?1", table.as_str());
        let result = sqlx::query(&sql)
            .bind(client_id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records in `table` whose payload or base text contains `needle`.
    ///
    /// A coarse text filter; callers decode and check real references.
    /// Rows that no longer decode are skipped.
    pub async fn records_mentioning_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        needle: &str,
    ) -> DbResult<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE instr(data, ?1) > 0 OR instr(COALESCE(base_data, ''), ?1) > 0",
            COLUMNS,
            table.as_str()
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql)
            .bind(needle)
            .fetch_all(&mut *conn)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_record(table) {
                Ok(record) => records.push(record),
                Err(e) => warn!(table = %table, error = %e, "Skipping corrupt record"),
            }
        }
        Ok(records)
    }

    /// Rewrites references that already have a server id mapping.
    pub async fn canonicalize_references_in(
        conn: &mut SqliteConnection,
        payload: &mut EntityPayload,
    ) -> DbResult<usize> {
        let mut rewritten = 0;
        for reference in payload.references() {
            if let Some(server_id) =
                IdentityRepository::lookup_in(conn, reference.table, &reference.id).await?
            {
                rewritten += payload.rewrite_references(reference.table, &reference.id, &server_id);
            }
        }
        Ok(rewritten)
    }

    // -------------------------------------------------------------------------
    // Store primitives
    // -------------------------------------------------------------------------

    /// Gets a record by client id or server id.
    pub async fn get(&self, table: EntityTable, id: &str) -> DbResult<Option<Record>> {
        let mut conn = self.db.pool().acquire().await?;
        Self::fetch_in(&mut conn, table, id).await
    }

    /// Client id of the record known locally as `id`, if any.
    pub async fn find_client_id(&self, table: EntityTable, id: &str) -> DbResult<Option<String>> {
        let mut conn = self.db.pool().acquire().await?;
        Ok(Self::ids_in(&mut conn, table, id)
            .await?
            .map(|(client_id, _)| client_id))
    }

    /// Upserts a record as-is, without queueing anything.
    pub async fn put(&self, table: EntityTable, record: &Record) -> DbResult<()> {
        check_table(table, &record.payload)?;

        let _guard = self.db.locks().lock(table, record.client_id()).await;
        let mut tx = self.db.begin_write().await?;
        Self::upsert_in(&mut tx, record).await?;
        tx.commit().await
    }

    /// Upserts several records in one transaction: all or nothing.
    pub async fn bulk_put(&self, table: EntityTable, records: &[Record]) -> DbResult<()> {
        for record in records {
            check_table(table, &record.payload)?;
        }

        let _guards = self
            .db
            .locks()
            .lock_many(records.iter().map(|r| (table, r.client_id())))
            .await;
        let mut tx = self.db.begin_write().await?;
        for record in records {
            Self::upsert_in(&mut tx, record).await?;
        }
        tx.commit().await?;

        debug!(table = %table, count = records.len(), "Bulk put committed");
        Ok(())
    }

    /// Live records matching `predicate`. Tombstones are excluded and
    /// corrupt rows are skipped with a warning.
    ///
    /// ## Example
    /// ```rust,ignore
    /// let active = db
    ///     .records()
    ///     .query(EntityTable::Products, |r| matches!(&r.payload, EntityPayload::Product(p) if p.is_active))
    ///     .await?;
    /// ```
    pub async fn query<F>(&self, table: EntityTable, predicate: F) -> DbResult<Vec<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let sql = format!(
            "SELECT {} FROM {} WHERE deleted = 0 ORDER BY client_created_at ASC",
            COLUMNS,
            table.as_str()
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(self.db.pool()).await?;

        let mut records = Vec::new();
        for row in rows {
            match row.into_record(table) {
                Ok(record) if predicate(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(table = %table, error = %e, "Skipping corrupt record"),
            }
        }
        Ok(records)
    }

    /// Removes a record and any queue entry for it, without telling the
    /// server. Use [`RecordRepository::remove`] for a synced delete.
    pub async fn delete(&self, table: EntityTable, id: &str) -> DbResult<bool> {
        let Some(record) = self.get(table, id).await? else {
            return Ok(false);
        };

        let _guard = self.db.locks().lock(table, record.client_id()).await;
        let mut tx = self.db.begin_write().await?;
        SyncQueueRepository::remove_for_record_in(
            &mut tx,
            table,
            record.client_id(),
            record.meta.server_id.as_deref(),
        )
        .await?;
        let removed = Self::remove_row_in(&mut tx, table, record.client_id()).await?;
        tx.commit().await?;

        Ok(removed)
    }

    /// Pending, failed and conflict totals across all tables.
    pub async fn counts(&self) -> DbResult<SyncCounts> {
        let union = EntityTable::ALL
            .iter()
            .map(|t| format!("SELECT sync_status FROM {}", t.as_str()))
            .collect::<Vec<_>>()
            .join(" UNION ALL ");
        let sql = format!(
            "SELECT \
               COALESCE(SUM(sync_status = 'pending'), 0), \
               COALESCE(SUM(sync_status = 'failed'), 0), \
               COALESCE(SUM(sync_status = 'conflict'), 0) \
             FROM ({})",
            union
        );

        let (pending, failed, conflict): (i64, i64, i64) =
            sqlx::query_as(&sql).fetch_one(self.db.pool()).await?;

        Ok(SyncCounts {
            pending,
            failed,
            conflict,
        })
    }

    // -------------------------------------------------------------------------
    // Mutation API
    // -------------------------------------------------------------------------

    /// Creates a record with a freshly minted client id.
    pub async fn create(&self, payload: EntityPayload) -> DbResult<Record> {
        self.insert_local(Record::new_local(payload)).await
    }

    /// Inserts a locally created record and enqueues its create.
    pub async fn insert_local(&self, mut record: Record) -> DbResult<Record> {
        let table = record.table();
        let client_id = record.client_id().to_string();

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;

        if Self::fetch_by_client_id_in(&mut tx, table, &client_id)
            .await?
            .is_some()
        {
            return Err(DbError::UniqueViolation {
                field: format!("{}.client_id", table),
                value: client_id,
            });
        }

        Self::canonicalize_references_in(&mut tx, &mut record.payload).await?;
        record.meta = SyncMeta::new_local(client_id.as_str(), Utc::now());
        record.base = None;
        record.deleted = false;

        Self::upsert_in(&mut tx, &record).await?;
        SyncQueueRepository::enqueue_in(
            &mut tx,
            table,
            SyncOperation::Create,
            &client_id,
            Some(&record.payload),
            record.meta.client_created_at,
        )
        .await?;
        tx.commit().await?;

        info!(table = %table, record_id = %client_id, "Record created");
        Ok(record)
    }

    /// Replaces a record's payload and enqueues the update.
    ///
    /// ## Errors
    /// * `NotFound` - no live record with that id
    /// * `RecordInConflict` - an open conflict must be resolved first
    pub async fn update(
        &self,
        table: EntityTable,
        id: &str,
        mut payload: EntityPayload,
    ) -> DbResult<Record> {
        check_table(table, &payload)?;
        let client_id = self.client_id_of(table, id).await?;

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;

        let mut record = Self::fetch_by_client_id_in(&mut tx, table, &client_id)
            .await?
            .filter(|r| !r.deleted)
            .ok_or_else(|| DbError::not_found(table.as_str(), id))?;

        if record.status() == SyncStatus::Conflict {
            return Err(DbError::RecordInConflict {
                table: table.to_string(),
                id: client_id,
            });
        }

        Self::canonicalize_references_in(&mut tx, &mut payload).await?;
        record.payload = payload;
        record.meta.client_updated_at = touch(record.meta.client_updated_at);
        record.meta.sync_status = SyncStatus::Pending;
        record.meta.sync_attempts = 0;
        record.meta.last_sync_error = None;

        Self::upsert_in(&mut tx, &record).await?;
        SyncQueueRepository::enqueue_in(
            &mut tx,
            table,
            SyncOperation::Update,
            record.remote_id(),
            Some(&record.payload),
            record.meta.client_updated_at,
        )
        .await?;
        tx.commit().await?;

        debug!(table = %table, record_id = %client_id, "Record updated");
        Ok(record)
    }

    /// Deletes a record through the sync queue.
    pub async fn remove(&self, table: EntityTable, id: &str) -> DbResult<RemoveOutcome> {
        let client_id = self.client_id_of(table, id).await?;

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;

        let mut record = Self::fetch_by_client_id_in(&mut tx, table, &client_id)
            .await?
            .filter(|r| !r.deleted)
            .ok_or_else(|| DbError::not_found(table.as_str(), id))?;

        if record.status() == SyncStatus::Conflict {
            return Err(DbError::RecordInConflict {
                table: table.to_string(),
                id: client_id,
            });
        }

        let now = touch(record.meta.client_updated_at);
        let outcome = SyncQueueRepository::enqueue_in(
            &mut tx,
            table,
            SyncOperation::Delete,
            record.remote_id(),
            None,
            now,
        )
        .await?;

        let removed = match outcome {
            EnqueueOutcome::Cancelled => {
                Self::remove_row_in(&mut tx, table, &client_id).await?;
                RemoveOutcome::Discarded
            }
            EnqueueOutcome::Appended(_) | EnqueueOutcome::Coalesced(_) => {
                record.deleted = true;
                record.meta.client_updated_at = now;
                record.meta.sync_status = SyncStatus::Pending;
                record.meta.sync_attempts = 0;
                record.meta.last_sync_error = None;
                Self::upsert_in(&mut tx, &record).await?;
                RemoveOutcome::Tombstoned
            }
        };
        tx.commit().await?;

        debug!(table = %table, record_id = %client_id, outcome = ?removed, "Record removed");
        Ok(removed)
    }

    async fn client_id_of(&self, table: EntityTable, id: &str) -> DbResult<String> {
        self.get(table, id)
            .await?
            .map(|r| r.meta.client_id)
            .ok_or_else(|| DbError::not_found(table.as_str(), id))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
