//! # Sync Coordinator
//!
//! Drives sync cycles between the local store and the remote store. Owns the
//! cycle lock, the retry schedule and the status snapshot shown to the
//! operator.
//!
//! ## Cycle State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Cycle (single flight)                       │
//! │                                                                         │
//! │   ┌──────┐  trigger  ┌─────────┐      ┌─────────┐      ┌─────────────┐ │
//! │   │ Idle │─────────► │ Pushing │─────►│ Pulling │─────►│ Reconciling │ │
//! │   └──────┘           └────┬────┘      └────┬────┘      └──────┬──────┘ │
//! │      ▲                    │ retryable      │ error            │        │
//! │      │                    ▼                ▼                  │        │
//! │      │               ┌─────────────────────────┐              │        │
//! │      └───────────────│ Backoff (jittered, cap) │              │        │
//! │      │               └─────────────────────────┘              │        │
//! │      └────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  TRIGGERS:                                                             │
//! │  ─────────                                                             │
//! │  Connectivity(true)  offline → online transition                       │
//! │  Interval            poll_interval while online                        │
//! │  Manual              explicit request                                  │
//! │  Retry               backoff timer expired                             │
//! │                                                                         │
//! │  A trigger that arrives mid-cycle sets one follow-up flag; any number  │
//! │  of them run a single extra cycle once the current one finishes.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The checkpoint moves to the pull's server timestamp only when every
//! pulled change applied and nothing fatal happened.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tally_core::{EntityPayload, EntityTable, ResolutionKind, SyncCounts, SyncOperation, SyncStatus};
use tally_db::{
    ConflictRepository, Database, RecordRepository, SyncQueueRepository,
};

use crate::apply::mark_synced;
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::inbound::{InboundHandler, InboundReport};
use crate::outbox::{OutboxProcessor, PushReport};
use crate::remote::RemoteStore;

// =============================================================================
// Status
// =============================================================================

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CyclePhase {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Reconciling,
    /// Waiting for the retry timer after a failed cycle.
    Backoff,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CyclePhase::Idle => write!(f, "idle"),
            CyclePhase::Pushing => write!(f, "pushing"),
            CyclePhase::Pulling => write!(f, "pulling"),
            CyclePhase::Reconciling => write!(f, "reconciling"),
            CyclePhase::Backoff => write!(f, "backoff"),
        }
    }
}

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity changed. Only an offline → online transition syncs.
    Connectivity(bool),
    Interval,
    Manual,
    Retry,
}

/// Snapshot for the operator.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStatus {
    pub phase: CyclePhase,
    pub online: bool,
    pub counts: SyncCounts,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Delay until the scheduled retry, when in backoff.
    pub retry_in: Option<Duration>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub push: PushReport,
    /// `None` when the pull was skipped.
    pub pull: Option<InboundReport>,
    /// New checkpoint, when it advanced.
    pub checkpoint: Option<DateTime<Utc>>,
    /// Set when the remote looked unhealthy and a retry was scheduled.
    pub retry_in: Option<Duration>,
    /// The device was offline; nothing ran.
    pub skipped: bool,
}

/// The side an operator keeps for a record in manual conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualChoice {
    KeepClient,
    KeepServer,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives status changes (UI bridge, daemon logs).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &CoordinatorStatus);

    /// `synced` is the number of records pushed or pulled by the last cycle.
    fn emit_progress(&self, pending: i64, synced: i64);

    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &CoordinatorStatus) {}
    fn emit_progress(&self, _pending: i64, _synced: i64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

/// Writes every event to the log.
pub struct TracingEmitter;

impl SyncEventEmitter for TracingEmitter {
    fn emit_status(&self, status: &CoordinatorStatus) {
        info!(
            phase = %status.phase,
            online = status.online,
            pending = status.counts.pending,
            failed = status.counts.failed,
            conflict = status.counts.conflict,
            last_synced_at = ?status.last_synced_at,
            "Sync status"
        );
    }

    fn emit_progress(&self, pending: i64, synced: i64) {
        info!(pending, synced, "Sync progress");
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        warn!(retryable, "Sync error: {}", message);
    }
}

// =============================================================================
// Sync Coordinator
// =============================================================================

struct Inner {
    db: Database,
    remote: Arc<dyn RemoteStore>,
    settings: SyncSettings,
    emitter: Arc<dyn SyncEventEmitter>,
    status: RwLock<CoordinatorStatus>,

    /// Held for the whole of a cycle or an operator resolution.
    cycle: Mutex<()>,
    follow_up: AtomicBool,
    online: AtomicBool,
    cancel: Arc<AtomicBool>,
    shutting_down: AtomicBool,

    backoff: Mutex<ExponentialBackoff>,
    retry_at: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    /// Wakes the run loop when the retry schedule changes.
    wake: Notify,
}

/// Orchestrates push, pull and reconciliation. Cheap to clone.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Creates a coordinator that starts offline.
    pub fn new(db: Database, remote: Arc<dyn RemoteStore>, settings: SyncSettings) -> Self {
        Self::with_emitter(db, remote, settings, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        settings: SyncSettings,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let backoff = create_backoff(&settings);

        SyncCoordinator {
            inner: Arc::new(Inner {
                db,
                remote,
                settings,
                emitter,
                status: RwLock::new(CoordinatorStatus::default()),
                cycle: Mutex::new(()),
                follow_up: AtomicBool::new(false),
                online: AtomicBool::new(false),
                cancel: Arc::new(AtomicBool::new(false)),
                shutting_down: AtomicBool::new(false),
                backoff: Mutex::new(backoff),
                retry_at: Mutex::new(None),
                consecutive_failures: AtomicU32::new(0),
                wake: Notify::new(),
            }),
        }
    }

    pub fn builder() -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder::new()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        self.inner.status.read().await.clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Records connectivity without starting a cycle.
    pub async fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if !online {
            self.clear_retry().await;
        }
        self.inner.status.write().await.online = online;
    }

    /// Asks the running cycle to stop at its next commit boundary.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Handles a trigger.
    ///
    /// ## Returns
    /// The report of the last cycle this call ran, or `None` when the
    /// trigger did not start one (offline, no transition, or coalesced into
    /// a cycle already running).
    pub async fn trigger(&self, trigger: SyncTrigger) -> SyncResult<Option<CycleReport>> {
        match trigger {
            SyncTrigger::Connectivity(online) => {
                let was_online = self.inner.online.load(Ordering::SeqCst);
                self.set_online(online).await;
                if !online {
                    if was_online {
                        info!("Went offline");
                        self.publish_status().await;
                    }
                    return Ok(None);
                }
                if was_online {
                    return Ok(None);
                }
                info!("Back online, starting sync");
            }
            SyncTrigger::Interval => {
                if !self.is_online() || self.inner.retry_at.lock().await.is_some() {
                    return Ok(None);
                }
            }
            SyncTrigger::Retry => {
                self.inner.retry_at.lock().await.take();
                if !self.is_online() {
                    return Ok(None);
                }
            }
            SyncTrigger::Manual => {}
        }

        self.request_cycle().await
    }

    async fn request_cycle(&self) -> SyncResult<Option<CycleReport>> {
        let mut last = None;
        loop {
            let cycle = match self.inner.cycle.try_lock() {
                Ok(cycle) => cycle,
                Err(_) => {
                    self.inner.follow_up.store(true, Ordering::SeqCst);
                    // The running cycle may have released the lock before it saw the flag.
                    match self.inner.cycle.try_lock() {
                        Ok(cycle) => cycle,
                        Err(_) => {
                            debug!("Cycle already running, trigger coalesced");
                            return Ok(last);
                        }
                    }
                }
            };
            self.inner.follow_up.store(false, Ordering::SeqCst);
            let report = self.cycle_locked().await;
            drop(cycle);
            let report = report?;

            let stop = report.skipped || report.retry_in.is_some();
            last = Some(report);
            if stop || !self.inner.follow_up.load(Ordering::SeqCst) {
                return Ok(last);
            }
            debug!("Running follow-up cycle");
        }
    }

    /// Runs one cycle now, waiting for a running one to finish first.
    ///
    /// Triggers that arrive meanwhile get their follow-up cycle before this
    /// returns; the report is that of the last cycle run.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let report = {
            let _cycle = self.inner.cycle.lock().await;
            self.inner.follow_up.store(false, Ordering::SeqCst);
            self.cycle_locked().await?
        };

        if report.skipped
            || report.retry_in.is_some()
            || !self.inner.follow_up.load(Ordering::SeqCst)
        {
            return Ok(report);
        }
        debug!("Running follow-up cycle");
        Ok(self.request_cycle().await?.unwrap_or(report))
    }

    async fn cycle_locked(&self) -> SyncResult<CycleReport> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        if !self.is_online() {
            debug!("Offline, sync cycle skipped");
            return Ok(CycleReport {
                skipped: true,
                ..Default::default()
            });
        }

        inner.cancel.store(false, Ordering::SeqCst);
        let started = std::time::Instant::now();
        info!("Sync cycle started");

        let result = self.run_phases().await;
        let now = Utc::now();

        match result {
            Ok(mut report) if report.push.retryable_failure => {
                let message = report
                    .push
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "remote unavailable".to_string());
                warn!(error = %message, "Push hit a retryable failure, pull skipped");
                report.retry_in = Some(self.schedule_retry(&message, true, now).await);
                Ok(report)
            }
            Ok(report) => {
                self.clear_retry().await;
                inner.backoff.lock().await.reset();
                inner.consecutive_failures.store(0, Ordering::SeqCst);

                let applied = report.pull.as_ref().map_or(0, |p| p.applied);
                let last_error = report.push.last_error.clone().or_else(|| {
                    report
                        .pull
                        .as_ref()
                        .and_then(|p| p.failures.first())
                        .map(|f| format!("{} {}: {}", f.table, f.id, f.error))
                });
                self.finish(CyclePhase::Idle, last_error, now).await;

                let status = self.status().await;
                inner
                    .emitter
                    .emit_progress(status.counts.pending, (report.push.pushed + applied) as i64);
                info!(
                    pushed = report.push.pushed,
                    pulled = report.pull.as_ref().map_or(0, |p| p.received),
                    applied,
                    conflicts = report.push.conflicts
                        + report.pull.as_ref().map_or(0, |p| p.conflicts),
                    checkpoint = ?report.checkpoint,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sync cycle complete"
                );
                Ok(report)
            }
            Err(e @ (SyncError::Cancelled | SyncError::ShuttingDown)) => {
                info!("Sync cycle cancelled");
                self.finish(CyclePhase::Idle, None, now).await;
                Err(e)
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "Sync cycle aborted");
                } else {
                    warn!(error = %e, "Sync cycle failed");
                }
                self.schedule_retry(&e.to_string(), e.is_retryable(), now)
                    .await;
                Err(e)
            }
        }
    }

    async fn run_phases(&self) -> SyncResult<CycleReport> {
        let inner = &self.inner;
        let mut report = CycleReport::default();

        self.set_phase(CyclePhase::Pushing).await;
        let outbox = OutboxProcessor::new(
            inner.db.clone(),
            inner.remote.clone(),
            inner.settings.clone(),
            inner.cancel.clone(),
        );
        report.push = outbox.push_pending().await?;
        if report.push.retryable_failure {
            return Ok(report);
        }

        self.set_phase(CyclePhase::Pulling).await;
        let since = inner.db.checkpoint().get().await?.last_synced_at;
        let timeout = inner.settings.request_timeout();
        let pull = match tokio::time::timeout(timeout, inner.remote.pull(since)).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(timeout.as_secs())),
        };
        debug!(since = ?since, changes = pull.changes.len(), "Pulled server changes");

        self.set_phase(CyclePhase::Reconciling).await;
        let inbound = InboundHandler::new(inner.db.clone(), inner.cancel.clone());
        let applied = inbound.apply_changes(&pull.changes).await?;

        if inner.cancel.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        if applied.is_clean() {
            inner.db.checkpoint().advance(pull.server_timestamp).await?;
            report.checkpoint = Some(pull.server_timestamp);
        } else {
            warn!(
                failed = applied.failures.len(),
                since = ?since,
                "Checkpoint held back; the batch will be pulled again"
            );
        }
        report.pull = Some(applied);

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Operator conflict resolution
    // -------------------------------------------------------------------------

    /// Settles a record in manual conflict with the side the operator kept.
    ///
    /// `KeepServer` overwrites the local record with the server version and
    /// drops the pending mutation. `KeepClient` re-sends the local version
    /// as an update based on the server version. Runs under the cycle lock.
    ///
    /// ## Errors
    /// `InvalidResolution` when the record has no open conflict, or when
    /// keeping the client version of a record the server deleted.
    pub async fn resolve_conflict(
        &self,
        table: EntityTable,
        id: &str,
        choice: ManualChoice,
    ) -> SyncResult<()> {
        let _cycle = self.inner.cycle.lock().await;
        let db = &self.inner.db;
        let now = Utc::now();

        let client_id = db
            .records()
            .get(table, id)
            .await?
            .map(|r| r.meta.client_id)
            .ok_or_else(|| SyncError::InvalidResolution(format!("no {} record {}", table, id)))?;

        let _guard = db.locks().lock(table, &client_id).await;
        let mut tx = db.begin_write().await?;

        let mut record = RecordRepository::fetch_by_client_id_in(&mut tx, table, &client_id)
            .await?
            .ok_or_else(|| SyncError::InvalidResolution(format!("no {} record {}", table, id)))?;
        let conflict = ConflictRepository::open_for_in(&mut tx, table, &client_id)
            .await?
            .ok_or_else(|| {
                SyncError::InvalidResolution(format!("{} {} has no open conflict", table, id))
            })?;
        let entry = SyncQueueRepository::entry_for_in(&mut tx, table, record.remote_id()).await?;

        let server_payload = conflict
            .server_data
            .clone()
            .map(|data| EntityPayload::from_data(table, data))
            .transpose()
            .map_err(|e| SyncError::SerializationFailed(e.to_string()))?;

        let resolution = match (choice, server_payload) {
            (ManualChoice::KeepServer, Some(payload)) => {
                mark_synced(&mut record, payload, conflict.server_updated_at);
                RecordRepository::upsert_in(&mut tx, &record).await?;
                if let Some(entry) = entry {
                    SyncQueueRepository::remove_in(&mut tx, entry.seq).await?;
                }
                ResolutionKind::ServerWins
            }
            (ManualChoice::KeepServer, None) => {
                SyncQueueRepository::remove_for_record_in(
                    &mut tx,
                    table,
                    &client_id,
                    record.meta.server_id.as_deref(),
                )
                .await?;
                RecordRepository::remove_row_in(&mut tx, table, &client_id).await?;
                ResolutionKind::ServerWins
            }
            (ManualChoice::KeepClient, None) => {
                return Err(SyncError::InvalidResolution(format!(
                    "{} {} was deleted on the server",
                    table, id
                )));
            }
            (ManualChoice::KeepClient, Some(payload)) => {
                record.base = Some(payload);
                record.meta.server_synced_at = Some(conflict.server_updated_at);
                record.meta.client_updated_at = now.max(record.meta.client_updated_at);
                record.meta.sync_status = SyncStatus::Pending;
                record.meta.sync_attempts = 0;
                record.meta.last_sync_error = None;
                RecordRepository::upsert_in(&mut tx, &record).await?;
                SyncQueueRepository::enqueue_in(
                    &mut tx,
                    table,
                    SyncOperation::Update,
                    record.remote_id(),
                    Some(&record.payload),
                    record.meta.client_updated_at,
                )
                .await?;
                ResolutionKind::ClientWins
            }
        };

        ConflictRepository::resolve_in(&mut tx, conflict.id, resolution, now).await?;
        tx.commit().await?;

        info!(table = %table, record_id = %client_id, ?choice, "Conflict resolved by operator");
        self.publish_status().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Status and retry bookkeeping
    // -------------------------------------------------------------------------

    async fn set_phase(&self, phase: CyclePhase) {
        let status = {
            let mut status = self.inner.status.write().await;
            status.phase = phase;
            status.clone()
        };
        self.inner.emitter.emit_status(&status);
    }

    /// Re-reads counts and checkpoint, then publishes the status.
    async fn publish_status(&self) {
        let counts = self.inner.db.records().counts().await;
        let checkpoint = self.inner.db.checkpoint().get().await;

        let status = {
            let mut status = self.inner.status.write().await;
            match counts {
                Ok(counts) => status.counts = counts,
                Err(e) => warn!(error = %e, "Could not read sync counts"),
            }
            match checkpoint {
                Ok(checkpoint) => status.last_synced_at = checkpoint.last_synced_at,
                Err(e) => warn!(error = %e, "Could not read checkpoint"),
            }
            status.online = self.is_online();
            status.clone()
        };
        self.inner.emitter.emit_status(&status);
    }

    async fn finish(&self, phase: CyclePhase, last_error: Option<String>, now: DateTime<Utc>) {
        {
            let mut status = self.inner.status.write().await;
            status.phase = phase;
            status.last_error = last_error;
            status.last_cycle_at = Some(now);
            status.consecutive_failures = self.inner.consecutive_failures.load(Ordering::SeqCst);
            if phase != CyclePhase::Backoff {
                status.retry_in = None;
            }
        }
        self.publish_status().await;
    }

    /// Enters backoff and arms the retry timer. Returns the delay.
    async fn schedule_retry(&self, message: &str, retryable: bool, now: DateTime<Utc>) -> Duration {
        let inner = &self.inner;
        let delay = inner
            .backoff
            .lock()
            .await
            .next_backoff()
            .unwrap_or_else(|| inner.settings.max_backoff());
        *inner.retry_at.lock().await = Some(Instant::now() + delay);
        inner.wake.notify_one();

        let failures = inner.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(?delay, failures, "Retry scheduled");

        inner.status.write().await.retry_in = Some(delay);
        self.finish(CyclePhase::Backoff, Some(message.to_string()), now)
            .await;
        inner.emitter.emit_error(message, retryable);
        delay
    }

    async fn clear_retry(&self) {
        if self.inner.retry_at.lock().await.take().is_some() {
            self.inner.wake.notify_one();
        }
    }

    // -------------------------------------------------------------------------
    // Background loop
    // -------------------------------------------------------------------------

    /// Starts the background loop: interval ticks, retry timer and commands.
    pub fn spawn(&self) -> SyncCoordinatorHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let task = tokio::spawn(self.clone().run(command_rx));

        SyncCoordinatorHandle {
            command_tx,
            coordinator: self.clone(),
            task,
        }
    }

    async fn run(self, mut command_rx: mpsc::Receiver<Command>) {
        info!(
            interval_secs = self.inner.settings.poll_interval_secs,
            "Sync coordinator started"
        );

        let mut ticker = tokio::time::interval(self.inner.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            let retry_at = *self.inner.retry_at.lock().await;
            let retry_timer = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(Command::Trigger(trigger)) => self.spawn_trigger(trigger),
                    Some(Command::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.spawn_trigger(SyncTrigger::Interval),
                _ = retry_timer => self.spawn_trigger(SyncTrigger::Retry),
                _ = self.inner.wake.notified() => {}
            }
        }

        self.stop().await;
    }

    fn spawn_trigger(&self, trigger: SyncTrigger) {
        if trigger == SyncTrigger::Retry {
            debug!("Backoff elapsed, retrying");
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.trigger(trigger).await {
                debug!(?trigger, error = %e, "Triggered cycle ended with error");
            }
        });
    }

    async fn stop(&self) {
        info!("Shutting down sync coordinator");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.cancel.store(true, Ordering::SeqCst);

        // Waits for a running cycle to reach a commit boundary.
        let _cycle = self.inner.cycle.lock().await;
        self.inner.status.write().await.phase = CyclePhase::Idle;
        self.publish_status().await;
        info!("Sync coordinator stopped");
    }
}

fn create_backoff(settings: &SyncSettings) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: settings.initial_backoff(),
        initial_interval: settings.initial_backoff(),
        max_interval: settings.max_backoff(),
        randomization_factor: settings.jitter,
        multiplier: 2.0,
        max_elapsed_time: None, // retried until the queue says otherwise
        ..Default::default()
    }
}

// =============================================================================
// Coordinator Handle (for external control)
// =============================================================================

enum Command {
    Trigger(SyncTrigger),
    Shutdown,
}

/// Controls a coordinator running in the background.
pub struct SyncCoordinatorHandle {
    command_tx: mpsc::Sender<Command>,
    coordinator: SyncCoordinator,
    task: JoinHandle<()>,
}

impl SyncCoordinatorHandle {
    pub async fn trigger(&self, trigger: SyncTrigger) -> SyncResult<()> {
        self.command_tx
            .send(Command::Trigger(trigger))
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        self.coordinator.status().await
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Stops the loop, cancelling a running cycle at its next commit
    /// boundary, and waits for it to finish.
    pub async fn shutdown(self) -> SyncResult<()> {
        self.coordinator.cancel();
        let _ = self.command_tx.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|e| SyncError::Internal(format!("coordinator task failed: {}", e)))
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncCoordinator with options.
pub struct SyncCoordinatorBuilder {
    settings: SyncSettings,
    db: Option<Database>,
    remote: Option<Arc<dyn RemoteStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncCoordinatorBuilder {
    pub fn new() -> Self {
        SyncCoordinatorBuilder {
            settings: SyncSettings::default(),
            db: None,
            remote: None,
            emitter: None,
        }
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn build(self) -> SyncResult<SyncCoordinator> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote store required".into()))?;
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));

        Ok(SyncCoordinator::with_emitter(db, remote, self.settings, emitter))
    }
}

impl Default for SyncCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientChange, ServerChange};
    use crate::testing::{fixtures, MockRemote};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tally_core::{Product, QueueState, Record};
    use tally_db::{DbConfig, RemoveOutcome};

    async fn setup() -> (Database, Arc<MockRemote>, SyncCoordinator) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(MockRemote::new());
        let coordinator = SyncCoordinator::builder()
            .with_database(db.clone())
            .with_remote(remote.clone())
            .build()
            .unwrap();
        (db, remote, coordinator)
    }

    fn cola(name: &str) -> EntityPayload {
        EntityPayload::Product(Product {
            sku: "COKE-330".into(),
            barcode: None,
            name: name.into(),
            price_cents: 299,
            tax_rate_bps: 0,
            stock: None,
            is_active: true,
        })
    }

    fn product_name(record: &Record) -> &str {
        match &record.payload {
            EntityPayload::Product(p) => &p.name,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_status_default() {
        let status = CoordinatorStatus::default();
        assert_eq!(status.phase, CyclePhase::Idle);
        assert!(!status.online);
        assert_eq!(status.counts, SyncCounts::default());
        assert_eq!(CyclePhase::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_builder_requires_database_and_remote() {
        let err = SyncCoordinator::builder().build().err().unwrap();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_offline_sale_syncs_end_to_end() {
        let (db, remote, coordinator) = setup().await;
        db.records()
            .insert_local(Record::with_client_id("c-1", fixtures::customer("Ada")))
            .await
            .unwrap();
        db.records()
            .insert_local(Record::with_client_id("s-1", fixtures::sale(Some("c-1"), &[])))
            .await
            .unwrap();

        let report = coordinator
            .trigger(SyncTrigger::Connectivity(true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.push.pushed, 2);
        assert_eq!(report.push.waves, 2);
        assert!(report.checkpoint.is_some());

        let server_customer = remote.server_id_for(EntityTable::Customers, "c-1").unwrap();
        let customer = db.records().get(EntityTable::Customers, "c-1").await.unwrap().unwrap();
        assert_eq!(customer.meta.server_id.as_deref(), Some(server_customer.as_str()));
        assert_eq!(customer.status(), SyncStatus::Synced);

        let sale = db.records().get(EntityTable::Sales, "s-1").await.unwrap().unwrap();
        assert_eq!(sale.status(), SyncStatus::Synced);
        match &sale.payload {
            EntityPayload::Sale(s) => {
                assert_eq!(s.customer_id.as_deref(), Some(server_customer.as_str()))
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(!sale.payload.to_json_string().contains("\"c-1\""));

        let server_sale = remote.server_id_for(EntityTable::Sales, "s-1").unwrap();
        let stored = remote.record(EntityTable::Sales, &server_sale).unwrap();
        assert_eq!(stored["customer_id"], json!(server_customer));

        assert!(db.queue().list().await.unwrap().is_empty());
        let status = coordinator.status().await;
        assert_eq!(status.phase, CyclePhase::Idle);
        assert_eq!(status.counts, SyncCounts::default());
        assert_eq!(status.last_synced_at, report.checkpoint);
    }

    #[tokio::test]
    async fn test_failed_change_holds_back_checkpoint() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;

        let batch = |third: serde_json::Value, stamps: &[DateTime<Utc>]| {
            let data = [
                fixtures::customer("Ada").to_data(),
                fixtures::customer("Bob").to_data(),
                third,
                fixtures::customer("Dan").to_data(),
                fixtures::customer("Eve").to_data(),
            ];
            data.into_iter()
                .zip(stamps)
                .enumerate()
                .map(|(i, (data, ts))| ServerChange {
                    table: "customers".into(),
                    operation: SyncOperation::Update,
                    id: format!("srv-{}", i + 1),
                    data: Some(data),
                    server_timestamp: *ts,
                })
                .collect::<Vec<_>>()
        };
        let stamps: Vec<_> = (0..5).map(|_| remote.tick()).collect();

        for change in batch(json!({ "name": 42 }), &stamps) {
            remote.inject(change);
        }
        let first = coordinator.run_cycle().await.unwrap();
        let pulled = first.pull.unwrap();
        assert_eq!(pulled.applied, 4);
        assert_eq!(pulled.failures.len(), 1);
        assert_eq!(pulled.failures[0].id, "srv-3");
        assert_eq!(first.checkpoint, None);
        assert_eq!(db.checkpoint().get().await.unwrap().last_synced_at, None);

        remote.clear_injected();
        for change in batch(fixtures::customer("Cal").to_data(), &stamps) {
            remote.inject(change);
        }
        let second = coordinator.run_cycle().await.unwrap();
        assert_eq!(remote.pulls(), vec![None, None]);

        let pulled = second.pull.unwrap();
        assert!(pulled.is_clean());
        assert_eq!(pulled.applied, 1);
        assert_eq!(pulled.ignored, 4);
        assert_eq!(second.checkpoint, Some(remote.now()));
        assert!(db.records().get(EntityTable::Customers, "srv-3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acked_create_is_never_sent_twice() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        db.records().create(fixtures::customer("Ada")).await.unwrap();

        coordinator.run_cycle().await.unwrap();
        coordinator.run_cycle().await.unwrap();

        assert_eq!(remote.pushes().len(), 1);
        assert_eq!(remote.live_count(EntityTable::Customers), 1);

        // A re-sent create (lost ack) maps to the same server record.
        let sent: ClientChange = remote.pushes()[0].clone();
        let again = remote.push(&sent).await.unwrap();
        assert_eq!(
            Some(again.server_id),
            remote.server_id_for(EntityTable::Customers, &sent.id)
        );
        assert_eq!(remote.live_count(EntityTable::Customers), 1);
    }

    #[tokio::test]
    async fn test_offline_edits_coalesce_into_one_push() {
        let (db, remote, coordinator) = setup().await;
        let record = db.records().create(cola("Cola")).await.unwrap();
        let id = record.client_id().to_string();
        let seq = db.queue().list().await.unwrap()[0].seq;

        db.records().update(EntityTable::Products, &id, cola("Cola Zero")).await.unwrap();
        db.records().update(EntityTable::Products, &id, cola("Cola Max")).await.unwrap();

        let queue = db.queue().list().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].seq, seq);
        assert_eq!(queue[0].operation, SyncOperation::Create);
        assert_eq!(queue[0].payload.as_ref(), Some(&cola("Cola Max")));

        coordinator.trigger(SyncTrigger::Connectivity(true)).await.unwrap();
        assert_eq!(remote.pushes().len(), 1);
        let server_id = remote.server_id_for(EntityTable::Products, &id).unwrap();
        assert_eq!(
            remote.record(EntityTable::Products, &server_id).unwrap()["name"],
            json!("Cola Max")
        );
    }

    /// A synced product edited to different names on both sides.
    async fn product_in_conflict(
        db: &Database,
        remote: &MockRemote,
        coordinator: &SyncCoordinator,
    ) -> String {
        coordinator.set_online(true).await;
        let id = remote.server_insert(&cola("Cola"));
        coordinator.run_cycle().await.unwrap();

        db.records().update(EntityTable::Products, &id, cola("Cola Light")).await.unwrap();
        remote.server_edit(EntityTable::Products, &id, |data| data["name"] = json!("Cola Max"));

        let report = coordinator.run_cycle().await.unwrap();
        assert_eq!(report.push.conflicts, 1);
        id
    }

    #[tokio::test]
    async fn test_manual_conflict_is_excluded_until_resolved() {
        let (db, remote, coordinator) = setup().await;
        let id = product_in_conflict(&db, &remote, &coordinator).await;

        let record = db.records().get(EntityTable::Products, &id).await.unwrap().unwrap();
        assert_eq!(record.status(), SyncStatus::Conflict);
        assert_eq!(product_name(&record), "Cola Light");
        assert_eq!(db.conflicts().list_open().await.unwrap()[0].fields, vec!["name"]);
        assert_eq!(coordinator.status().await.counts.conflict, 1);

        let pushes = remote.pushes().len();
        coordinator.run_cycle().await.unwrap();
        assert_eq!(remote.pushes().len(), pushes);

        coordinator
            .resolve_conflict(EntityTable::Products, &id, ManualChoice::KeepClient)
            .await
            .unwrap();
        let entry = db.queue().entry_for(EntityTable::Products, &id).await.unwrap().unwrap();
        assert_eq!(entry.state, QueueState::Active);
        assert_eq!(entry.operation, SyncOperation::Update);

        coordinator.run_cycle().await.unwrap();
        assert_eq!(remote.pushes().len(), pushes + 1);
        assert_eq!(
            remote.record(EntityTable::Products, &id).unwrap()["name"],
            json!("Cola Light")
        );

        let record = db.records().get(EntityTable::Products, &id).await.unwrap().unwrap();
        assert_eq!(record.status(), SyncStatus::Synced);
        assert!(db.conflicts().list_open().await.unwrap().is_empty());
        assert!(db.queue().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keep_server_takes_the_server_version() {
        let (db, remote, coordinator) = setup().await;
        let id = product_in_conflict(&db, &remote, &coordinator).await;

        coordinator
            .resolve_conflict(EntityTable::Products, &id, ManualChoice::KeepServer)
            .await
            .unwrap();

        let record = db.records().get(EntityTable::Products, &id).await.unwrap().unwrap();
        assert_eq!(record.status(), SyncStatus::Synced);
        assert_eq!(product_name(&record), "Cola Max");
        assert!(db.queue().list().await.unwrap().is_empty());

        let history = db.conflicts().history(10).await.unwrap();
        assert_eq!(history[0].resolution, ResolutionKind::ServerWins);
        assert!(history[0].resolved_at.is_some());

        let err = coordinator
            .resolve_conflict(EntityTable::Products, &id, ManualChoice::KeepServer)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidResolution(_)));
    }

    #[tokio::test]
    async fn test_unreachable_remote_enters_backoff() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        db.records().create(fixtures::customer("Ada")).await.unwrap();
        remote.set_offline(true);

        let report = coordinator.run_cycle().await.unwrap();
        assert!(report.push.retryable_failure);
        assert!(report.retry_in.is_some());
        assert!(report.pull.is_none());
        assert!(remote.pulls().is_empty());

        let status = coordinator.status().await;
        assert_eq!(status.phase, CyclePhase::Backoff);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.counts.pending, 1);
        assert!(status.last_error.is_some());
        assert_eq!(db.queue().list().await.unwrap()[0].attempts, 1);

        // An interval tick does not cut the backoff short.
        assert!(coordinator.trigger(SyncTrigger::Interval).await.unwrap().is_none());

        remote.set_offline(false);
        let report = coordinator.trigger(SyncTrigger::Retry).await.unwrap().unwrap();
        assert_eq!(report.push.pushed, 1);

        let status = coordinator.status().await;
        assert_eq!(status.phase, CyclePhase::Idle);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.retry_in, None);
    }

    #[tokio::test]
    async fn test_offline_triggers_do_not_sync() {
        let (db, remote, coordinator) = setup().await;
        db.records().create(fixtures::customer("Ada")).await.unwrap();

        let report = coordinator.trigger(SyncTrigger::Manual).await.unwrap().unwrap();
        assert!(report.skipped);
        assert!(coordinator.trigger(SyncTrigger::Interval).await.unwrap().is_none());
        assert!(coordinator
            .trigger(SyncTrigger::Connectivity(false))
            .await
            .unwrap()
            .is_none());
        assert!(remote.pushes().is_empty());

        // Only the transition syncs; a repeated "online" does not.
        assert!(coordinator
            .trigger(SyncTrigger::Connectivity(true))
            .await
            .unwrap()
            .is_some());
        assert!(coordinator
            .trigger(SyncTrigger::Connectivity(true))
            .await
            .unwrap()
            .is_none());
        assert_eq!(remote.pulls().len(), 1);
    }

    #[tokio::test]
    async fn test_triggers_during_a_cycle_coalesce() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        db.records().create(fixtures::customer("Ada")).await.unwrap();
        remote.set_latency(Duration::from_millis(200));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.trigger(SyncTrigger::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator.trigger(SyncTrigger::Manual).await.unwrap().is_none());
        assert!(coordinator.trigger(SyncTrigger::Manual).await.unwrap().is_none());

        let report = running.await.unwrap().unwrap().unwrap();
        assert!(report.checkpoint.is_some());
        // The first cycle plus one follow-up.
        assert_eq!(remote.pulls().len(), 2);
    }

    #[tokio::test]
    async fn test_trigger_during_run_cycle_gets_its_follow_up() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        db.records().create(fixtures::customer("Ada")).await.unwrap();
        remote.set_latency(Duration::from_millis(200));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.trigger(SyncTrigger::Manual).await.unwrap().is_none());

        let report = running.await.unwrap().unwrap();
        assert!(report.checkpoint.is_some());
        assert_eq!(remote.pulls().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_replaced_and_checkpoint_moves_on() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        let id = remote.server_insert(&cola("Cola"));
        let first = coordinator.run_cycle().await.unwrap();

        sqlx::query("UPDATE products SET data = 'not json' WHERE server_id = ?1")
            .bind(id.as_str())
            .execute(db.pool())
            .await
            .unwrap();
        remote.server_edit(EntityTable::Products, &id, |data| data["name"] = json!("Cola Max"));

        let second = coordinator.run_cycle().await.unwrap();
        let pulled = second.pull.unwrap();
        assert!(pulled.is_clean());
        assert_eq!(pulled.repaired, 1);
        assert_eq!(second.checkpoint, Some(remote.now()));

        let record = db.records().get(EntityTable::Products, &id).await.unwrap().unwrap();
        assert_eq!(record.status(), SyncStatus::Synced);
        assert_eq!(product_name(&record), "Cola Max");

        remote.server_insert(&fixtures::customer("Ada"));
        let third = coordinator.run_cycle().await.unwrap();
        assert_eq!(third.pull.unwrap().applied, 1);
        assert_eq!(
            remote.pulls(),
            vec![None, first.checkpoint, second.checkpoint]
        );
    }

    #[tokio::test]
    async fn test_delete_during_inflight_create_reaches_the_server() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        let record = db.records().create(fixtures::customer("Ada")).await.unwrap();
        let client_id = record.client_id().to_string();
        remote.set_latency(Duration::from_millis(200));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let removed = db.records().remove(EntityTable::Customers, &client_id).await.unwrap();
        assert_eq!(removed, RemoveOutcome::Discarded);
        running.await.unwrap().unwrap();

        // The create landed; its record is gone and a delete is queued.
        let server_id = remote.server_id_for(EntityTable::Customers, &client_id).unwrap();
        assert_eq!(remote.live_count(EntityTable::Customers), 1);
        assert!(db.records().get(EntityTable::Customers, &server_id).await.unwrap().is_none());
        let entry = db
            .queue()
            .entry_for(EntityTable::Customers, &server_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.operation, SyncOperation::Delete);

        coordinator.run_cycle().await.unwrap();
        assert_eq!(remote.live_count(EntityTable::Customers), 0);
        assert!(db.queue().list().await.unwrap().is_empty());
        assert!(db.records().get(EntityTable::Customers, &client_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_delete_removes_synced_record() {
        let (db, remote, coordinator) = setup().await;
        coordinator.set_online(true).await;
        let id = remote.server_insert(&cola("Cola"));
        coordinator.run_cycle().await.unwrap();
        assert!(db.records().get(EntityTable::Products, &id).await.unwrap().is_some());

        remote.server_delete(EntityTable::Products, &id);
        let report = coordinator.run_cycle().await.unwrap();

        assert_eq!(report.pull.unwrap().applied, 1);
        assert!(db.records().get(EntityTable::Products, &id).await.unwrap().is_none());
        assert_eq!(coordinator.status().await.counts, SyncCounts::default());
    }

    #[tokio::test]
    async fn test_spawned_loop_syncs_and_shuts_down() {
        let (db, remote, coordinator) = setup().await;
        db.records().create(fixtures::customer("Ada")).await.unwrap();

        let handle = coordinator.spawn();
        handle.trigger(SyncTrigger::Connectivity(true)).await.unwrap();

        for _ in 0..100 {
            if handle.status().await.last_cycle_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.live_count(EntityTable::Customers), 1);

        handle.shutdown().await.unwrap();
        let err = coordinator.run_cycle().await.unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
    }
}
