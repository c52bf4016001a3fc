//! # tally-db: Local Store for the Tally Sync Core
//!
//! SQLite persistence for syncable records and the sync bookkeeping tables,
//! using sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  UI (create / update / remove)        Sync Coordinator (tally-sync)    │
//! │       │                                      │                          │
//! │       ▼                                      ▼                          │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │  │   │
//! │  │   │               │    │ RecordRepo     │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncQueueRepo  │    │ 001_local_   │  │   │
//! │  │   │ RecordLocks   │    │ IdentityRepo   │    │  store.sql   │  │   │
//! │  │   │ writer lock   │    │ ConflictRepo   │    │              │  │   │
//! │  │   │               │    │ CheckpointRepo │    │              │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool, write transactions
//! - [`locks`] - Per-record write serialization
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/tally.db")).await?;
//!
//! let customer = db.records().create(payload).await?;
//! let counts = db.records().counts().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod locks;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use locks::{RecordGuard, RecordLocks};
pub use pool::{Database, DbConfig, WriteTx};

// Repository re-exports for convenience
pub use repository::checkpoint::CheckpointRepository;
pub use repository::conflict::{ConflictRepository, NewConflict};
pub use repository::identity::IdentityRepository;
pub use repository::queue::{AckOutcome, EnqueueOutcome, SyncQueueRepository};
pub use repository::record::{RecordRepository, RemoveOutcome};

// The `*_in` functions take a bare connection; re-exported so callers can
// name it without depending on sqlx directly.
pub use sqlx::sqlite::SqliteConnection;
