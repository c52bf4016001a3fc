//! # tally-sync: Sync Coordinator for the Tally POS
//!
//! Moves local mutations to the authoritative remote store and server-side
//! changes back into the local store, so registers keep selling while
//! offline.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Coordinator Architecture                     │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  SyncCoordinator (single flight)                 │  │
//! │  │                                                                  │  │
//! │  │  Triggers: connectivity, interval, manual, backoff retry        │  │
//! │  │  Owns the cycle lock, retry schedule and status snapshot        │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OutboxProcessor│  │  RemoteStore   │  │  InboundHandler        │    │
//! │  │  (push phase)  │  │                │  │  (pull phase)          │    │
//! │  │                │  │ HttpRemote:    │  │                        │    │
//! │  │ Waves, retry,  │──│ POST /sync     │──│ Applies server changes │    │
//! │  │ ack, reconcile │  │ JSON camelCase │  │ through the resolver   │    │
//! │  └───────┬────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │          │                                           │                  │
//! │          ▼                                           ▼                  │
//! │  ┌────────────────────────┐          ┌─────────────────────────────┐   │
//! │  │  IdentityReconciler    │          │  apply (server version vs   │   │
//! │  │  client id → server id │          │  pending local mutation)    │   │
//! │  └────────────────────────┘          └─────────────────────────────┘   │
//! │                                                                         │
//! │  STATUS EVENTS (SyncEventEmitter):                                     │
//! │  • emit_status   - phase, online, counts, checkpoint                   │
//! │  • emit_progress - pending / synced counts                             │
//! │  • emit_error    - cycle failures, with retryable flag                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`coordinator`] - `SyncCoordinator`, triggers, handle and builder
//! - [`outbox`] - Push phase
//! - [`inbound`] - Pull phase
//! - [`apply`] - Applying one server version to the local store
//! - [`identity`] - Client id to server id reconciliation
//! - [`remote`] - `RemoteStore` trait and the HTTP implementation
//! - [`protocol`] - Wire types
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{HttpRemote, SyncConfig, SyncCoordinator, SyncTrigger};
//!
//! let config = SyncConfig::load(None)?;
//! let coordinator = SyncCoordinator::builder()
//!     .with_settings(config.sync.clone())
//!     .with_database(db)
//!     .with_remote(Arc::new(HttpRemote::from_config(&config)?))
//!     .build()?;
//!
//! let handle = coordinator.spawn();
//! handle.trigger(SyncTrigger::Connectivity(true)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod apply;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod inbound;
pub mod outbox;
pub mod protocol;
pub mod remote;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{DeviceConfig, RemoteConfig, SyncConfig, SyncSettings};
pub use coordinator::{
    CoordinatorStatus, CyclePhase, CycleReport, ManualChoice, NoOpEmitter, SyncCoordinator,
    SyncCoordinatorBuilder, SyncCoordinatorHandle, SyncEventEmitter, SyncTrigger,
    TracingEmitter,
};
pub use error::{SyncError, SyncResult};
pub use identity::{IdentityReconciler, ReconcileOutcome};
pub use inbound::{InboundHandler, InboundReport, RecordFailure};
pub use outbox::{OutboxProcessor, PushReport};
pub use protocol::{ChangeResult, ChangeStatus, ClientChange, ServerChange, SyncRequest, SyncResponse};
pub use remote::{HttpRemote, PullResponse, PushAck, RemoteError, RemoteStore};
