//! # Repository Module
//!
//! Repositories for the local store and the sync bookkeeping tables.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  UI / Coordinator                                                      │
//! │       │                                                                 │
//! │       │  db.records().update(table, id, payload)                       │
//! │       ▼                                                                 │
//! │  RecordRepository ──► SyncQueueRepository::enqueue_in  (same tx)      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Every repository exposes two layers:                                  │
//! │  • async methods on &self that lock, open a write tx and commit        │
//! │  • associated `*_in(conn, ..)` functions that run inside a caller's    │
//! │    transaction, so several steps commit together                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`RecordRepository`](record::RecordRepository) - Entity records and the mutation API
//! - [`SyncQueueRepository`](queue::SyncQueueRepository) - Pending mutations with coalescing
//! - [`IdentityRepository`](identity::IdentityRepository) - Client id to server id map
//! - [`ConflictRepository`](conflict::ConflictRepository) - Conflict log
//! - [`CheckpointRepository`](checkpoint::CheckpointRepository) - Last pull timestamp

pub mod checkpoint;
pub mod conflict;
pub mod identity;
pub mod queue;
pub mod record;

use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps are stored as fixed-width RFC 3339 text (nanoseconds, `Z`),
/// so a decoded value equals the one that was written.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn decode_opt_ts(
    raw: Option<&str>,
) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    raw.map(decode_ts).transpose()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use tally_core::{Customer, EntityPayload, Product, Sale, SaleLine, TaxRate};

    pub fn customer(name: &str) -> EntityPayload {
        EntityPayload::Customer(Customer {
            name: name.to_string(),
            phone: None,
            email: None,
            notes: None,
            loyalty_points: 0,
        })
    }

    pub fn product(name: &str, price_cents: i64) -> EntityPayload {
        EntityPayload::Product(Product {
            sku: format!("SKU-{}", name.to_uppercase()),
            barcode: None,
            name: name.to_string(),
            price_cents,
            tax_rate_bps: 0,
            stock: None,
            is_active: true,
        })
    }

    pub fn sale(customer_id: &str, product_id: &str) -> EntityPayload {
        let cola = Product {
            sku: "COKE-330".into(),
            barcode: None,
            name: "Cola".into(),
            price_cents: 299,
            tax_rate_bps: 0,
            stock: None,
            is_active: true,
        };
        let line = SaleLine::from_product(product_id, &cola, 2);
        EntityPayload::Sale(Sale::from_lines(
            "R-0001",
            Some(customer_id.to_string()),
            vec![line],
            TaxRate::from_bps(0),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_sort_as_text() {
        let a = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::nanoseconds(1);

        assert!(encode_ts(a) < encode_ts(b));
        assert_eq!(encode_ts(a).len(), encode_ts(b).len());
        assert_eq!(decode_ts(&encode_ts(b)).unwrap(), b);
        assert!(decode_ts("yesterday").is_err());
    }

    #[test]
    fn test_wall_clock_survives_storage() {
        let now = Utc::now();
        assert_eq!(decode_ts(&encode_ts(now)).unwrap(), now);
    }
}
