//! # Applying Server Versions
//!
//! Shared by the pull phase and by pushes the server answered with a
//! conflict: given the server's version of one record, decide what the local
//! store ends up holding.
//!
//! ## Decision Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  local record            queue entry     server says     → outcome      │
//! │  ──────────────────────  ──────────────  ─────────────   ────────────── │
//! │  none                    -               data            Inserted       │
//! │  none                    -               deleted         Ignored        │
//! │  none                    delete          data            Ignored        │
//! │  status = conflict       parked          anything        ConflictRefr.  │
//! │  present                 none            newer data      Overwritten    │
//! │  present                 none            deleted         Removed        │
//! │  present                 none            not newer       Ignored        │
//! │  tombstone               delete          deleted         BothDeleted    │
//! │  tombstone               delete          newer data      ServerWon      │
//! │  live                    update          deleted         Manual         │
//! │  live                    create/update   data            resolve(...)   │
//! │  corrupt row             dropped         anything        Repaired       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every function here runs inside the caller's write transaction, with the
//! record lock held.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use tally_core::{
    resolve, ConflictInput, EntityPayload, EntityTable, Record, Resolution, ResolutionKind,
    SyncMeta, SyncOperation, SyncQueueEntry, SyncStatus,
};
use tally_db::{
    ConflictRepository, NewConflict, RecordRepository, SqliteConnection, SyncQueueRepository,
};

use crate::error::{SyncError, SyncResult};

/// The server's side of one record.
#[derive(Debug, Clone, Copy)]
pub struct ServerVersion<'a> {
    /// Server id.
    pub id: &'a str,

    /// `None` when the server deleted the record.
    pub data: Option<&'a Value>,

    pub updated_at: DateTime<Utc>,
}

/// What happened to the local record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First time this record was seen locally.
    Inserted,
    /// No local edits; the server version replaced the local one.
    Overwritten,
    /// No local edits; the server deleted the record.
    Removed,
    /// Nothing to do (unknown delete, or a version already applied).
    Ignored,
    /// The record awaits an operator; the conflict now shows this version.
    ConflictRefreshed,
    /// Local edits stand and will be pushed.
    ClientKept,
    /// Disjoint edits merged; the merge is queued for push.
    Merged,
    /// The server version replaced the local edits.
    ServerWon,
    /// Overlapping edits; the record is parked in `conflict`.
    Manual { fields: Vec<String> },
    /// Deleted on both sides.
    BothDeleted,
    /// The local row no longer decoded; the server version replaced it.
    Repaired { reason: String },
}

impl ApplyOutcome {
    /// True when local edits met a server edit.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::ClientKept
                | ApplyOutcome::Merged
                | ApplyOutcome::ServerWon
                | ApplyOutcome::Manual { .. }
        )
    }
}

fn decode(table: EntityTable, id: &str, data: &Value) -> SyncResult<EntityPayload> {
    EntityPayload::from_data(table, data.clone()).map_err(|e| {
        SyncError::SerializationFailed(format!("server version of {} {}: {}", table, id, e))
    })
}

/// Applies the server's version of a record.
///
/// `record` is the local record as read inside the same transaction.
pub async fn apply_server_version_in(
    conn: &mut SqliteConnection,
    table: EntityTable,
    record: Option<Record>,
    server: &ServerVersion<'_>,
    now: DateTime<Utc>,
) -> SyncResult<ApplyOutcome> {
    let server_payload = server
        .data
        .map(|data| decode(table, server.id, data))
        .transpose()?;

    let Some(record) = record else {
        let Some(payload) = server_payload else {
            return Ok(ApplyOutcome::Ignored);
        };
        // Deleted locally while its create was in flight; the delete is queued.
        if SyncQueueRepository::entry_for_in(conn, table, server.id)
            .await?
            .is_some_and(|entry| entry.operation == SyncOperation::Delete)
        {
            debug!(table = %table, record_id = %server.id, "Skipped record with a queued delete");
            return Ok(ApplyOutcome::Ignored);
        }

        let record = Record {
            meta: SyncMeta::from_server(server.id, server.updated_at),
            base: Some(payload.clone()),
            payload,
            deleted: false,
        };
        RecordRepository::upsert_in(conn, &record).await?;
        debug!(table = %table, record_id = %server.id, "Inserted server record");
        return Ok(ApplyOutcome::Inserted);
    };

    if record.status() == SyncStatus::Conflict {
        if let Some(open) =
            ConflictRepository::open_for_in(conn, table, record.client_id()).await?
        {
            ConflictRepository::update_server_in(conn, open.id, server.data, server.updated_at)
                .await?;
            debug!(table = %table, record_id = %record.client_id(), "Refreshed open conflict");
            return Ok(ApplyOutcome::ConflictRefreshed);
        }
        warn!(table = %table, record_id = %record.client_id(), "Conflict status without open conflict");
    }

    match SyncQueueRepository::entry_for_in(conn, table, record.remote_id()).await? {
        None => overwrite_in(conn, record, server_payload, server).await,
        Some(entry) => settle_in(conn, record, entry, server_payload, server, now).await,
    }
}

/// Replaces a local row that no longer decodes with the server's version.
///
/// The row's queued mutation and open conflict go with it: neither can be
/// trusted once the record itself is unreadable. A server delete leaves
/// nothing behind.
pub async fn repair_corrupt_in(
    conn: &mut SqliteConnection,
    table: EntityTable,
    server: &ServerVersion<'_>,
    reason: &str,
    now: DateTime<Utc>,
) -> SyncResult<ApplyOutcome> {
    let server_payload = server
        .data
        .map(|data| decode(table, server.id, data))
        .transpose()?;

    let Some((client_id, server_id)) = RecordRepository::ids_in(conn, table, server.id).await?
    else {
        return Err(SyncError::DatabaseError(format!(
            "corrupt {} {} vanished before repair",
            table, server.id
        )));
    };

    let dropped =
        SyncQueueRepository::remove_for_record_in(conn, table, &client_id, server_id.as_deref())
            .await?;
    if let Some(open) = ConflictRepository::open_for_in(conn, table, &client_id).await? {
        ConflictRepository::resolve_in(conn, open.id, ResolutionKind::ServerWins, now).await?;
    }
    RecordRepository::remove_row_in(conn, table, &client_id).await?;

    if let Some(payload) = server_payload {
        let mut meta = SyncMeta::from_server(server.id, server.updated_at);
        meta.client_id = client_id.clone();
        let record = Record {
            meta,
            base: Some(payload.clone()),
            payload,
            deleted: false,
        };
        RecordRepository::upsert_in(conn, &record).await?;
    }

    warn!(
        table = %table,
        record_id = %client_id,
        dropped_entries = dropped,
        reason,
        "Replaced corrupt local record with the server version"
    );
    Ok(ApplyOutcome::Repaired {
        reason: reason.to_string(),
    })
}

/// No pending local mutation: the server version wins outright.
async fn overwrite_in(
    conn: &mut SqliteConnection,
    mut record: Record,
    server_payload: Option<EntityPayload>,
    server: &ServerVersion<'_>,
) -> SyncResult<ApplyOutcome> {
    if record
        .meta
        .server_synced_at
        .is_some_and(|synced| server.updated_at <= synced)
    {
        return Ok(ApplyOutcome::Ignored);
    }

    let table = record.table();
    let Some(payload) = server_payload else {
        RecordRepository::remove_row_in(conn, table, record.client_id()).await?;
        debug!(table = %table, record_id = %record.client_id(), "Removed record deleted on server");
        return Ok(ApplyOutcome::Removed);
    };

    mark_synced(&mut record, payload, server.updated_at);
    RecordRepository::upsert_in(conn, &record).await?;
    Ok(ApplyOutcome::Overwritten)
}

/// A pending local mutation met a server change.
async fn settle_in(
    conn: &mut SqliteConnection,
    mut record: Record,
    entry: SyncQueueEntry,
    server_payload: Option<EntityPayload>,
    server: &ServerVersion<'_>,
    now: DateTime<Utc>,
) -> SyncResult<ApplyOutcome> {
    let table = record.table();
    let client_value = record.payload.to_data();

    let Some(server_payload) = server_payload else {
        if record.deleted {
            SyncQueueRepository::remove_in(conn, entry.seq).await?;
            RecordRepository::remove_row_in(conn, table, record.client_id()).await?;
            debug!(table = %table, record_id = %record.client_id(), "Deleted on both sides");
            return Ok(ApplyOutcome::BothDeleted);
        }
        return park_manual_in(conn, record, &entry, None, Vec::new(), server.updated_at, now)
            .await;
    };

    let newer = record
        .meta
        .server_synced_at
        .map_or(true, |synced| server.updated_at > synced);

    if record.deleted {
        if !newer {
            return Ok(ApplyOutcome::ClientKept);
        }
        log_settled(
            conn,
            &record,
            client_value,
            &server_payload,
            server,
            ResolutionKind::ServerWins,
            Vec::new(),
            now,
        )
        .await?;
        take_server_in(conn, record, &entry, server_payload, server.updated_at).await?;
        return Ok(ApplyOutcome::ServerWon);
    }

    let base_value = record.base.as_ref().map(EntityPayload::to_data);
    let server_value = server_payload.to_data();
    let verdict = resolve(&ConflictInput {
        table,
        base: base_value.as_ref(),
        client: &client_value,
        client_updated_at: record.meta.client_updated_at,
        base_synced_at: record.meta.server_synced_at,
        server: &server_value,
        server_updated_at: server.updated_at,
    });

    match verdict {
        Resolution::ClientWins => {
            if newer {
                record.base = Some(server_payload);
                record.meta.server_synced_at = Some(server.updated_at);
                RecordRepository::upsert_in(conn, &record).await?;
            }
            Ok(ApplyOutcome::ClientKept)
        }
        Resolution::ServerWins => {
            log_settled(
                conn,
                &record,
                client_value,
                &server_payload,
                server,
                ResolutionKind::ServerWins,
                Vec::new(),
                now,
            )
            .await?;
            take_server_in(conn, record, &entry, server_payload, server.updated_at).await?;
            Ok(ApplyOutcome::ServerWon)
        }
        Resolution::Merged {
            data,
            client_fields,
            server_fields,
        } => {
            let merged = decode(table, server.id, &data)?;
            let mut fields = client_fields;
            fields.extend(server_fields);
            fields.sort();

            log_settled(
                conn,
                &record,
                client_value,
                &server_payload,
                server,
                ResolutionKind::ClientWins,
                fields,
                now,
            )
            .await?;

            record.payload = merged;
            record.base = Some(server_payload);
            record.meta.server_synced_at = Some(server.updated_at);
            record.meta.client_updated_at = now.max(record.meta.client_updated_at);
            record.meta.sync_status = SyncStatus::Pending;
            record.meta.sync_attempts = 0;
            record.meta.last_sync_error = None;
            RecordRepository::upsert_in(conn, &record).await?;
            SyncQueueRepository::enqueue_in(
                conn,
                table,
                SyncOperation::Update,
                record.remote_id(),
                Some(&record.payload),
                record.meta.client_updated_at,
            )
            .await?;

            info!(table = %table, record_id = %record.client_id(), "Merged disjoint edits");
            Ok(ApplyOutcome::Merged)
        }
        Resolution::Manual { fields } => {
            park_manual_in(
                conn,
                record,
                &entry,
                Some(server_value),
                fields,
                server.updated_at,
                now,
            )
            .await
        }
    }
}

/// Replaces local state with the server's and drops the pending mutation.
async fn take_server_in(
    conn: &mut SqliteConnection,
    mut record: Record,
    entry: &SyncQueueEntry,
    payload: EntityPayload,
    server_updated_at: DateTime<Utc>,
) -> SyncResult<()> {
    mark_synced(&mut record, payload, server_updated_at);
    RecordRepository::upsert_in(conn, &record).await?;
    SyncQueueRepository::remove_in(conn, entry.seq).await?;
    Ok(())
}

pub(crate) fn mark_synced(record: &mut Record, payload: EntityPayload, server_updated_at: DateTime<Utc>) {
    record.base = Some(payload.clone());
    record.payload = payload;
    record.deleted = false;
    record.meta.sync_status = SyncStatus::Synced;
    record.meta.server_synced_at = Some(server_updated_at);
    record.meta.sync_attempts = 0;
    record.meta.last_sync_error = None;
}

async fn park_manual_in(
    conn: &mut SqliteConnection,
    mut record: Record,
    entry: &SyncQueueEntry,
    server_value: Option<Value>,
    fields: Vec<String>,
    server_updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SyncResult<ApplyOutcome> {
    let table = record.table();
    let reason = if server_value.is_none() {
        "conflict: deleted on server".to_string()
    } else {
        format!("conflict on fields: {}", fields.join(", "))
    };

    record.meta.sync_status = SyncStatus::Conflict;
    record.meta.last_sync_error = Some(reason.clone());
    RecordRepository::upsert_in(conn, &record).await?;
    SyncQueueRepository::park_in(conn, entry.seq, &reason).await?;
    ConflictRepository::record_in(
        conn,
        &NewConflict {
            table,
            record_id: record.client_id().to_string(),
            client_data: Some(record.payload.to_data()),
            server_data: server_value,
            server_updated_at,
            resolution: ResolutionKind::Manual,
            fields: fields.clone(),
        },
        now,
    )
    .await?;

    warn!(
        table = %table,
        record_id = %record.client_id(),
        fields = ?fields,
        "Conflict needs manual resolution"
    );
    Ok(ApplyOutcome::Manual { fields })
}

#[allow(clippy::too_many_arguments)]
async fn log_settled(
    conn: &mut SqliteConnection,
    record: &Record,
    client_value: Value,
    server_payload: &EntityPayload,
    server: &ServerVersion<'_>,
    resolution: ResolutionKind,
    fields: Vec<String>,
    now: DateTime<Utc>,
) -> SyncResult<()> {
    ConflictRepository::record_in(
        conn,
        &NewConflict {
            table: record.table(),
            record_id: record.client_id().to_string(),
            client_data: Some(client_value),
            server_data: Some(server_payload.to_data()),
            server_updated_at: server.updated_at,
            resolution,
            fields,
        },
        now,
    )
    .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
