//! # Outbox Processor
//!
//! The push phase of a sync cycle: sends queued local mutations to the
//! remote store and applies each outcome to the local store.
//!
//! ## Push Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Outbox Processor Flow                            │
//! │                                                                         │
//! │  1. Dequeue: up to batch_size active entries, in queue order           │
//! │                                                                         │
//! │  2. Wave: split the batch                                              │
//! │     ├── ready:    every referenced record already has a server id      │
//! │     └── deferred: waits for a create earlier in the batch              │
//! │                                                                         │
//! │  3. Send: ready entries, at most max_concurrency in flight,            │
//! │           each bounded by request_timeout                              │
//! │                                                                         │
//! │  4. Apply each outcome as it arrives (one transaction per entry)       │
//! │     ├── ok        create → reconcile ids, then ack                     │
//! │     │             update/delete → ack                                  │
//! │     ├── 409       server version → resolver                            │
//! │     ├── rejected  park entry, record failed                            │
//! │     └── network   attempts += 1, park after max_attempts               │
//! │                                                                         │
//! │  5. Next wave with the deferred entries, until nothing is ready or a   │
//! │     retryable failure says the remote is unhealthy                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use tally_core::{QueueState, SyncOperation, SyncQueueEntry, SyncStatus};
use tally_db::{AckOutcome, Database, RecordRepository, SyncQueueRepository};

use crate::apply::{apply_server_version_in, ApplyOutcome, ServerVersion};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityReconciler, ReconcileOutcome};
use crate::protocol::ClientChange;
use crate::remote::{PushAck, RemoteError, RemoteStore};

// =============================================================================
// Report
// =============================================================================

/// Outcome counts of one push phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Entries the remote accepted.
    pub pushed: usize,
    /// Entries that failed this time (retryable or not).
    pub failed: usize,
    /// Entries taken out of rotation (rejected or out of retries).
    pub parked: usize,
    /// Entries still waiting for a referenced create.
    pub deferred: usize,
    /// Entries the remote answered with a conflict.
    pub conflicts: usize,
    pub waves: usize,
    /// A network, timeout or server error occurred.
    pub retryable_failure: bool,
    pub last_error: Option<String>,
}

// =============================================================================
// Outbox Processor
// =============================================================================

/// Drains the sync queue into the remote store.
pub struct OutboxProcessor {
    db: Database,
    remote: Arc<dyn RemoteStore>,
    settings: SyncSettings,
    cancel: Arc<AtomicBool>,
}

impl OutboxProcessor {
    pub fn new(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        settings: SyncSettings,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        OutboxProcessor {
            db,
            remote,
            settings,
            cancel,
        }
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Runs the push phase.
    ///
    /// ## Errors
    /// Fatal errors (identity mismatch, database failure) and cancellation.
    /// Per-entry failures are counted in the report instead.
    pub async fn push_pending(&self) -> SyncResult<PushReport> {
        let mut report = PushReport::default();
        let mut batch = self.db.queue().dequeue_batch(self.settings.batch_size).await?;

        if batch.is_empty() {
            debug!("Outbox empty");
            return Ok(report);
        }
        debug!(count = batch.len(), "Pushing outbox batch");

        loop {
            self.check_cancelled()?;

            let mut ready = Vec::new();
            let mut deferred = Vec::new();
            for entry in batch {
                if self.must_defer(&entry).await? {
                    deferred.push(entry);
                } else {
                    ready.push(entry);
                }
            }

            if ready.is_empty() {
                report.deferred = deferred.len();
                break;
            }
            report.waves += 1;

            self.push_wave(ready, &mut report).await?;

            if report.retryable_failure {
                report.deferred = deferred.len();
                break;
            }

            // Reconciliation may have rewritten the deferred payloads.
            batch = Vec::with_capacity(deferred.len());
            for entry in deferred {
                if let Some(fresh) = self
                    .db
                    .queue()
                    .entry_for(entry.table, &entry.record_id)
                    .await?
                    .filter(|e| e.state == QueueState::Active)
                {
                    batch.push(fresh);
                }
            }
            if batch.is_empty() {
                break;
            }
        }

        info!(
            pushed = report.pushed,
            failed = report.failed,
            parked = report.parked,
            deferred = report.deferred,
            conflicts = report.conflicts,
            waves = report.waves,
            "Push phase finished"
        );
        Ok(report)
    }

    /// True when the entry references a record the server does not know yet.
    async fn must_defer(&self, entry: &SyncQueueEntry) -> SyncResult<bool> {
        let Some(payload) = &entry.payload else {
            return Ok(false);
        };

        for reference in payload.references() {
            match self.db.records().get(reference.table, &reference.id).await {
                Ok(Some(target)) if target.meta.server_id.is_none() => {
                    debug!(
                        table = %entry.table,
                        record_id = %entry.record_id,
                        waits_for = %reference.id,
                        "Deferring entry until referenced create is reconciled"
                    );
                    return Ok(true);
                }
                Ok(_) => {}
                Err(e) if e.is_corrupt() => {
                    warn!(error = %e, "Referenced record is corrupt; sending anyway");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    async fn push_wave(
        &self,
        ready: Vec<SyncQueueEntry>,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        let mut prepared = Vec::with_capacity(ready.len());
        for entry in ready {
            let record = match self.db.records().get(entry.table, &entry.record_id).await {
                Ok(record) => record,
                Err(e) if e.is_corrupt() => {
                    self.reject(&entry, &e.to_string()).await?;
                    report.failed += 1;
                    report.parked += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if record.is_none() && entry.operation != SyncOperation::Delete {
                warn!(
                    table = %entry.table,
                    record_id = %entry.record_id,
                    "Dropping queue entry for missing record"
                );
                let mut tx = self.db.begin_write().await?;
                SyncQueueRepository::remove_in(&mut tx, entry.seq).await?;
                tx.commit().await?;
                continue;
            }

            let change = ClientChange::from_entry(&entry, record.as_ref());
            prepared.push((entry, change));
        }

        let timeout = self.settings.request_timeout();
        let remote = &self.remote;
        let mut results = stream::iter(prepared.into_iter().map(|(entry, change)| async move {
            let outcome = match tokio::time::timeout(timeout, remote.push(&change)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RemoteError::Timeout(timeout.as_secs())),
            };
            (entry, change, outcome)
        }))
        .buffer_unordered(self.settings.max_concurrency.max(1));

        while let Some((entry, change, outcome)) = results.next().await {
            self.check_cancelled()?;

            match outcome {
                Ok(ack) => {
                    self.acknowledge(&entry, &ack).await?;
                    report.pushed += 1;
                }
                Err(RemoteError::Conflict {
                    server_data,
                    server_updated_at,
                }) if entry.operation != SyncOperation::Create => {
                    report.conflicts += 1;
                    let version = ServerVersion {
                        id: &change.id,
                        data: server_data.as_ref(),
                        updated_at: server_updated_at,
                    };
                    match self.settle(&entry, &version).await {
                        Ok(outcome) => {
                            debug!(
                                table = %entry.table,
                                record_id = %entry.record_id,
                                ?outcome,
                                "Push conflict settled"
                            );
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(
                                table = %entry.table,
                                record_id = %entry.record_id,
                                error = %e,
                                "Push conflict not settled"
                            );
                            report.failed += 1;
                            report.last_error = Some(e.to_string());
                        }
                    }
                }
                Err(err) if err.is_retryable() => {
                    report.failed += 1;
                    report.retryable_failure = true;
                    report.last_error = Some(err.to_string());
                    if self.retry_later(&entry, &err.to_string()).await? {
                        report.parked += 1;
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    report.parked += 1;
                    report.last_error = Some(err.to_string());
                    self.reject(&entry, &err.to_string()).await?;
                }
            }
        }

        Ok(())
    }

    /// Resolves the client id of the entry's record, falling back to the
    /// entry's own id when the record is gone.
    async fn client_id_of(&self, entry: &SyncQueueEntry) -> SyncResult<String> {
        Ok(self
            .db
            .records()
            .get(entry.table, &entry.record_id)
            .await?
            .map(|r| r.meta.client_id)
            .unwrap_or_else(|| entry.record_id.clone()))
    }

    /// Commits an accepted push: reconcile (creates), ack, mark synced.
    async fn acknowledge(&self, entry: &SyncQueueEntry, ack: &PushAck) -> SyncResult<()> {
        let table = entry.table;
        let client_id = self.client_id_of(entry).await?;
        let now = Utc::now();

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;

        if entry.operation == SyncOperation::Create {
            let reconciled =
                IdentityReconciler::reconcile_in(&mut tx, table, &client_id, &ack.server_id, now)
                    .await?;
            if let ReconcileOutcome::Orphaned { .. } = reconciled {
                // Deleted locally while the create was in flight.
                SyncQueueRepository::enqueue_in(
                    &mut tx,
                    table,
                    SyncOperation::Delete,
                    &ack.server_id,
                    None,
                    now,
                )
                .await?;
            }
        }

        let acked = SyncQueueRepository::ack_in(&mut tx, entry.seq, entry.revision).await?;
        let record = RecordRepository::fetch_by_client_id_in(&mut tx, table, &client_id).await?;

        match (acked, record) {
            (AckOutcome::AlreadyAcked, _) | (_, None) => {}
            (AckOutcome::Removed, Some(record)) if entry.operation == SyncOperation::Delete => {
                RecordRepository::remove_row_in(&mut tx, table, record.client_id()).await?;
            }
            (AckOutcome::Removed, Some(mut record)) => {
                record.base = entry.payload.clone();
                record.meta.sync_status = SyncStatus::Synced;
                record.meta.server_synced_at = Some(ack.server_timestamp);
                record.meta.sync_attempts = 0;
                record.meta.last_sync_error = None;
                RecordRepository::upsert_in(&mut tx, &record).await?;
            }
            (AckOutcome::Superseded, Some(mut record)) => {
                // A newer edit is queued; it builds on what was just accepted.
                record.base = entry.payload.clone();
                record.meta.server_synced_at = Some(ack.server_timestamp);
                RecordRepository::upsert_in(&mut tx, &record).await?;
            }
        }
        tx.commit().await?;

        debug!(
            table = %table,
            record_id = %client_id,
            seq = entry.seq,
            op = %entry.operation,
            ack = ?acked,
            "Push acknowledged"
        );
        Ok(())
    }

    /// Counts a retryable failure. Returns true when the entry ran out of
    /// attempts and was parked.
    async fn retry_later(&self, entry: &SyncQueueEntry, error: &str) -> SyncResult<bool> {
        let table = entry.table;
        let client_id = self.client_id_of(entry).await?;

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;

        let Some(attempts) =
            SyncQueueRepository::fail_in(&mut tx, entry.seq, entry.revision, error).await?
        else {
            // Superseded by a newer edit, which starts with a fresh budget.
            return Ok(false);
        };

        let exhausted = attempts >= i64::from(self.settings.max_attempts);
        let message = if exhausted {
            format!("max retries exceeded: {}", error)
        } else {
            error.to_string()
        };
        if exhausted {
            SyncQueueRepository::park_in(&mut tx, entry.seq, &message).await?;
        }

        if let Some(mut record) =
            RecordRepository::fetch_by_client_id_in(&mut tx, table, &client_id).await?
        {
            record.meta.sync_attempts = attempts;
            record.meta.last_sync_error = Some(message.clone());
            if exhausted {
                record.meta.sync_status = SyncStatus::Failed;
            }
            RecordRepository::upsert_in(&mut tx, &record).await?;
        }
        tx.commit().await?;

        if exhausted {
            warn!(
                table = %table,
                record_id = %client_id,
                attempts,
                "Retries exhausted, entry parked"
            );
        } else {
            debug!(
                table = %table,
                record_id = %client_id,
                attempts,
                error,
                "Push failed, will retry"
            );
        }
        Ok(exhausted)
    }

    /// Parks an entry the remote will never accept as is.
    async fn reject(&self, entry: &SyncQueueEntry, reason: &str) -> SyncResult<()> {
        let table = entry.table;
        let client_id = self
            .client_id_of(entry)
            .await
            .unwrap_or_else(|_| entry.record_id.clone());

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;
        SyncQueueRepository::park_in(&mut tx, entry.seq, reason).await?;

        // A corrupt record cannot be re-read; only the entry is parked then.
        if let Ok(Some(mut record)) =
            RecordRepository::fetch_by_client_id_in(&mut tx, table, &client_id).await
        {
            record.meta.sync_status = SyncStatus::Failed;
            record.meta.sync_attempts = entry.attempts + 1;
            record.meta.last_sync_error = Some(reason.to_string());
            RecordRepository::upsert_in(&mut tx, &record).await?;
        }
        tx.commit().await?;

        warn!(table = %table, record_id = %client_id, reason, "Push rejected, entry parked");
        Ok(())
    }

    /// Routes a 409 through the resolver.
    async fn settle(
        &self,
        entry: &SyncQueueEntry,
        version: &ServerVersion<'_>,
    ) -> SyncResult<ApplyOutcome> {
        let table = entry.table;
        let client_id = self.client_id_of(entry).await?;

        let _guard = self.db.locks().lock(table, &client_id).await;
        let mut tx = self.db.begin_write().await?;
        let record = RecordRepository::fetch_by_client_id_in(&mut tx, table, &client_id).await?;
        let outcome =
            apply_server_version_in(&mut tx, table, record, version, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
