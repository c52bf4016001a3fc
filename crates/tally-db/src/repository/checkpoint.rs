//! # Checkpoint Repository
//!
//! Single-row table holding the server timestamp of the last fully
//! committed pull. Absent row means no pull has completed.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnection;
use tracing::info;

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use crate::repository::{decode_opt_ts, encode_ts};
use tally_core::SyncCheckpoint;

#[derive(Debug, Clone)]
pub struct CheckpointRepository {
    db: Database,
}

impl CheckpointRepository {
    pub fn new(db: Database) -> Self {
        CheckpointRepository { db }
    }

    pub async fn get(&self) -> DbResult<SyncCheckpoint> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_synced_at FROM sync_checkpoint WHERE id = 1")
                .fetch_optional(self.db.pool())
                .await?;

        let last_synced_at = decode_opt_ts(raw.flatten().as_deref()).map_err(|e| {
            DbError::Corrupt {
                table: "sync_checkpoint".to_string(),
                id: "1".to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(SyncCheckpoint { last_synced_at })
    }

    pub async fn advance_in(
        conn: &mut SqliteConnection,
        server_ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoint (id, last_synced_at, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(encode_ts(server_ts))
        .bind(encode_ts(now))
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Moves the checkpoint to `server_ts`.
    pub async fn advance(&self, server_ts: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.db.begin_write().await?;
        Self::advance_in(&mut tx, server_ts, Utc::now()).await?;
        tx.commit().await?;

        info!(last_synced_at = %server_ts, "Checkpoint advanced");
        Ok(())
    }

    /// Forgets the checkpoint; the next pull is a full pull.
    pub async fn reset(&self) -> DbResult<()> {
        let mut tx = self.db.begin_write().await?;
        sqlx::query("DELETE FROM sync_checkpoint")
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;

    #[tokio::test]
    async fn test_checkpoint_starts_empty_and_advances() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let checkpoint = db.checkpoint();

        assert!(checkpoint.get().await.unwrap().is_initial());

        let ts = DateTime::parse_from_rfc3339("2024-06-01T12:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        checkpoint.advance(ts).await.unwrap();
        assert_eq!(checkpoint.get().await.unwrap().last_synced_at, Some(ts));

        checkpoint.reset().await.unwrap();
        assert!(checkpoint.get().await.unwrap().is_initial());
    }
}
