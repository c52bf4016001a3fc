//! # Identity Map Repository
//!
//! Persistent `(table, client_id) → server_id` mapping written by the
//! identity reconciler.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;

use crate::error::DbResult;
use crate::repository::encode_ts;
use tally_core::EntityTable;

/// Repository for client/server id mappings.
#[derive(Debug, Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
}

impl IdentityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        IdentityRepository { pool }
    }

    /// Server id assigned to a client id, if reconciled.
    pub async fn lookup_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        client_id: &str,
    ) -> DbResult<Option<String>> {
        let server_id = sqlx::query_scalar(
            "SELECT server_id FROM id_mappings WHERE entity_table = ?1 AND client_id = ?2",
        )
        .bind(table.as_str())
        .bind(client_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(server_id)
    }

    /// Client id that owns a server id, if any.
    pub async fn owner_of_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        server_id: &str,
    ) -> DbResult<Option<String>> {
        let client_id = sqlx::query_scalar(
            "SELECT client_id FROM id_mappings WHERE entity_table = ?1 AND server_id = ?2",
        )
        .bind(table.as_str())
        .bind(server_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(client_id)
    }

    /// Records a mapping. Callers check for an existing one first.
    pub async fn insert_in(
        conn: &mut SqliteConnection,
        table: EntityTable,
        client_id: &str,
        server_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO id_mappings (entity_table, client_id, server_id, reconciled_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(table.as_str())
        .bind(client_id)
        .bind(server_id)
        .bind(encode_ts(now))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    pub async fn lookup(&self, table: EntityTable, client_id: &str) -> DbResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        Self::lookup_in(&mut conn, table, client_id).await
    }

    /// All mappings for a table as `(client_id, server_id)` pairs.
    pub async fn list(&self, table: EntityTable) -> DbResult<Vec<(String, String)>> {
        let pairs = sqlx::query_as(
            "SELECT client_id, server_id FROM id_mappings WHERE entity_table = ?1 ORDER BY reconciled_at",
        )
        .bind(table.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(pairs)
    }
}
