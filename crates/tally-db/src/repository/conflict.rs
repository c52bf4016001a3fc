//! # Conflict Log Repository
//!
//! Every detected conflict is logged. Automatically settled ones are
//! written already resolved; `manual` ones stay open until an operator picks
//! a side.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteConnection;
use sqlx::FromRow;
use tracing::warn;

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::{decode_opt_ts, decode_ts, encode_ts};
use tally_core::{ConflictEntry, EntityPayload, EntityTable, ResolutionKind};

const COLUMNS: &str = "id, entity_table, record_id, client_data, server_data, server_updated_at, \
                       resolution, fields, detected_at, resolved_at";

/// A conflict about to be logged.
#[derive(Debug, Clone)]
pub struct NewConflict {
    pub table: EntityTable,
    pub record_id: String,
    pub client_data: Option<Value>,
    pub server_data: Option<Value>,
    pub server_updated_at: DateTime<Utc>,
    pub resolution: ResolutionKind,
    pub fields: Vec<String>,
}

#[derive(Debug, FromRow)]
struct ConflictRow {
    id: i64,
    entity_table: String,
    record_id: String,
    client_data: Option<String>,
    server_data: Option<String>,
    server_updated_at: String,
    resolution: ResolutionKind,
    fields: String,
    detected_at: String,
    resolved_at: Option<String>,
}

impl ConflictRow {
    fn into_entry(self) -> DbResult<ConflictEntry> {
        let id = self.id;
        let corrupt = |reason: String| DbError::Corrupt {
            table: "sync_conflicts".to_string(),
            id: id.to_string(),
            reason,
        };

        let json = |raw: Option<String>| -> DbResult<Option<Value>> {
            raw.map(|text| serde_json::from_str(&text))
                .transpose()
                .map_err(|e| corrupt(e.to_string()))
        };

        Ok(ConflictEntry {
            id,
            table: self.entity_table.parse().map_err(|e: tally_core::CoreError| corrupt(e.to_string()))?,
            record_id: self.record_id,
            client_data: json(self.client_data)?,
            server_data: json(self.server_data)?,
            server_updated_at: decode_ts(&self.server_updated_at)
                .map_err(|e| corrupt(e.to_string()))?,
            resolution: self.resolution,
            fields: serde_json::from_str(&self.fields).map_err(|e| corrupt(e.to_string()))?,
            detected_at: decode_ts(&self.detected_at).map_err(|e| corrupt(e.to_string()))?,
            resolved_at: decode_opt_ts(self.resolved_at.as_deref())
                .map_err(|e| corrupt(e.to_string()))?,
        })
    }
}

fn encode_json(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

/// Repository for the conflict log.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    db: Database,
}

impl ConflictRepository {
    pub fn new(db: Database) -> Self {
        ConflictRepository { db }
    }

    /// Logs a conflict. Non-manual conflicts are logged as resolved.
    pub async fn record_in(
        conn: &mut SqliteConnection,
        conflict: &NewConflict,
        now: DateTime<Utc>,
    ) -> DbResult<i64> {
        let resolved_at = match conflict.resolution {
            ResolutionKind::Manual => None,
            _ => Some(encode_ts(now)),
        };
        let fields = serde_json::to_string(&conflict.fields)
            .map_err(|e| DbError::Internal(e.to_string()))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_conflicts (
                entity_table, record_id, client_data, server_data, server_updated_at,
                resolution, fields, detected_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id
            "#,
        )
        .bind(conflict.table.as_str())
        .bind(&conflict.record_id)
        .bind(encode_json(&conflict.client_data))
        .bind(encode_json(&conflict.server_data))
        .bind(encode_ts(conflict.server_updated_at))
        .bind(conflict.resolution)
        .bind(fields)
        .bind(encode_ts(now))
        .bind(resolved_at)
        .fetch_one(&mut *conn)
        .await?;

        Ok(id)
    }

    /// The unresolved conflict for a record, if any.
    pub async fn open_for_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        record_id: &str,
    ) -> DbResult<Option<ConflictEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts \
             WHERE entity_table = ?1 AND record_id = ?2 AND resolved_at IS NULL \
             ORDER BY id DESC LIMIT 1",
            COLUMNS
        );
        let row: Option<ConflictRow> = sqlx::query_as(&sql)
            .bind(table.as_str())
            .bind(record_id)
            .fetch_optional(&mut *conn)
            .await?;

        row.map(ConflictRow::into_entry).transpose()
    }

    /// Replaces the server side of an open conflict with a newer version.
    pub async fn update_server_in(
        conn: &mut SqliteConnection,
        id: i64,
        server_data: Option<&Value>,
        server_updated_at: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE sync_conflicts SET server_data = ?2, server_updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(server_data.map(Value::to_string))
        .bind(encode_ts(server_updated_at))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Closes a conflict with the side the operator kept.
    pub async fn resolve_in(
        conn: &mut SqliteConnection,
        id: i64,
        resolution: ResolutionKind,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query("UPDATE sync_conflicts SET resolution = ?2, resolved_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(resolution)
            .bind(encode_ts(now))
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Rewrites references to `from` in the client side of logged conflicts
    /// on tables that can point at `target`.
    pub async fn rewrite_references_in(
        conn: &mut SqliteConnection,
        target: EntityTable,
        from: &str,
        to: &str,
    ) -> DbResult<u64> {
        let mut rewritten = 0;

        for table in target.referenced_by() {
            let rows: Vec<(i64, String)> = sqlx::query_as(
                "SELECT id, client_data FROM sync_conflicts \
                 WHERE entity_table = ?1 AND instr(client_data, ?2) > 0",
            )
            .bind(table.as_str())
            .bind(from)
            .fetch_all(&mut *conn)
            .await?;

            for (id, text) in rows {
                let mut payload = match EntityPayload::from_json_str(*table, &text) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(conflict_id = id, error = %e, "Skipping undecodable conflict data");
                        continue;
                    }
                };
                if payload.rewrite_references(target, from, to) == 0 {
                    continue;
                }

                sqlx::query("UPDATE sync_conflicts SET client_data = ?2 WHERE id = ?1")
                    .bind(id)
                    .bind(payload.to_json_string())
                    .execute(&mut *conn)
                    .await?;
                rewritten += 1;
            }
        }

        Ok(rewritten)
    }

    pub async fn open_for(
        &self,
        table: EntityTable,
        record_id: &str,
    ) -> DbResult<Option<ConflictEntry>> {
        let mut conn = self.db.pool().acquire().await?;
        Self::open_for_in(&mut conn, table, record_id).await
    }

    /// All unresolved conflicts, oldest first.
    pub async fn list_open(&self) -> DbResult<Vec<ConflictEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts WHERE resolved_at IS NULL ORDER BY id ASC",
            COLUMNS
        );
        let rows: Vec<ConflictRow> = sqlx::query_as(&sql).fetch_all(self.db.pool()).await?;
        rows.into_iter().map(ConflictRow::into_entry).collect()
    }

    /// The most recent conflicts, resolved or not.
    pub async fn history(&self, limit: u32) -> DbResult<Vec<ConflictEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts ORDER BY id DESC LIMIT ?1",
            COLUMNS
        );
        let rows: Vec<ConflictRow> = sqlx::query_as(&sql)
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;
        rows.into_iter().map(ConflictRow::into_entry).collect()
    }
}
