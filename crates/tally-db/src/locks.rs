//! # Record Locks
//!
//! Keyed async mutexes that serialize writers on the same record.
//!
//! ```text
//!   UI update(sales, c-7)          pull apply(sales, c-7)
//!        │                               │
//!        ▼                               ▼
//!   lock(sales, c-7) ◄── held ──   lock(sales, c-7)  (waits)
//!        │
//!        ▼
//!   read → modify → write → commit → release ──► pull proceeds
//! ```
//!
//! Lock order is record locks, then the database writer lock, then a pool
//! connection. Never the reverse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tally_core::EntityTable;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Idle lock entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

type LockKey = (EntityTable, String);

/// Keyed lock map, one mutex per `(table, client_id)`.
#[derive(Debug, Default)]
pub struct RecordLocks {
    inner: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

/// Held while a record is being written.
#[derive(Debug)]
pub struct RecordGuard {
    _guard: OwnedMutexGuard<()>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for one record.
    pub async fn lock(&self, table: EntityTable, client_id: &str) -> RecordGuard {
        let mutex = self.entry(table, client_id);
        RecordGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Acquires locks for several records in a consistent order.
    pub async fn lock_many<'a>(
        &self,
        keys: impl IntoIterator<Item = (EntityTable, &'a str)>,
    ) -> Vec<RecordGuard> {
        let mut keys: Vec<(EntityTable, &str)> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for (table, id) in keys {
            guards.push(self.lock(table, id).await);
        }
        guards
    }

    fn entry(&self, table: EntityTable, client_id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if map.len() > PRUNE_THRESHOLD {
            map.retain(|_, m| Arc::strong_count(m) > 1);
        }

        map.entry((table, client_id.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
