//! # tally-core: Pure Domain Logic for the Tally Sync Core
//!
//! Types and decisions shared by every layer of the offline-first sync
//! core, with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Sync Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Register UI (external collaborator)             │   │
//! │  │    scan ──► sell ──► create customer ──► open repair            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ local mutations                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │         tally-db (local store + sync queue, SQLite)             │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │         tally-sync (coordinator, push/pull, reconciler)         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  payload  │  │ conflict  │  │   money   │  │   │
//! │  │   │  Record   │  │ Customer  │  │ resolve() │  │   Money   │  │   │
//! │  │   │ SyncMeta  │  │ Sale, ... │  │  merge    │  │  TaxRate  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, sync metadata, queue entries, checkpoint
//! - [`payload`] - Typed per-table payloads and their references
//! - [`conflict`] - The conflict resolver
//! - [`money`] - Integer-cent money
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::conflict::{resolve, ConflictInput, Resolution};
//! use tally_core::EntityTable;
//!
//! let base = json!({ "name": "Cola", "price_cents": 100 });
//! let client = json!({ "name": "Cola", "price_cents": 120 });
//! let server = json!({ "name": "Cola Classic", "price_cents": 100 });
//!
//! let verdict = resolve(&ConflictInput {
//!     table: EntityTable::Products,
//!     base: Some(&base),
//!     client: &client,
//!     client_updated_at: chrono::Utc::now(),
//!     base_synced_at: None,
//!     server: &server,
//!     server_updated_at: chrono::Utc::now(),
//! });
//! assert!(matches!(verdict, Resolution::Merged { .. }));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod conflict;
pub mod error;
pub mod money;
pub mod payload;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use conflict::{resolve, ConflictInput, Resolution};
pub use error::{CoreError, CoreResult};
pub use money::{Money, TaxRate};
pub use payload::{
    Customer, EntityPayload, EntityRef, Product, Repair, RepairStatus, Sale, SaleLine, SaleStatus,
};
pub use types::*;
