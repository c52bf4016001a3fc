//! # Local Store Schema
//!
//! The schema lives in `migrations/sqlite` and is compiled into the binary.
//!
//! ## Tables Created by `001_local_store.sql`
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Entity tables (one row per record, same sync columns on each)         │
//! │    customers · products · sales · repairs                               │
//! │    client_id PK, server_id UNIQUE, data, base_data, deleted,            │
//! │    sync_status, client_created_at, client_updated_at,                   │
//! │    server_synced_at, sync_attempts, last_sync_error                     │
//! │                                                                         │
//! │  sync_queue       seq-ordered pending mutations, one per record         │
//! │  id_mappings      (table, client_id) → server_id                        │
//! │  sync_conflicts   conflict log; open while resolved_at IS NULL          │
//! │  sync_checkpoint  single row holding lastSyncedAt                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps are RFC 3339 text with nanoseconds, so comparisons in SQL
//! order correctly.
//!
//! A new syncable table needs the shared sync columns, a `sync_status`
//! index and an `EntityTable` variant. Existing migration files are never
//! edited; changes go in `002_*.sql` and later.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Brings the local store up to the embedded schema. Safe on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    MIGRATOR.run(pool).await?;
    info!(migrations = MIGRATOR.migrations.len(), "Local store schema up to date");
    Ok(())
}

/// `(embedded, applied)` migration counts, for health checks.
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    // sqlx creates its bookkeeping table on the first run.
    let exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;

    let applied: i64 = if exists == 0 {
        0
    } else {
        sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await?
    };

    Ok((total, applied as usize))
}
