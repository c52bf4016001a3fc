//! In-memory remote store and fixtures for sync tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use tally_core::{EntityPayload, EntityTable, SyncOperation};

use crate::protocol::{ClientChange, ServerChange};
use crate::remote::{PullResponse, PushAck, RemoteError, RemoteStore};

pub mod fixtures {
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

    /// A one-line-per-product sale at 2.99 each.
    pub fn sale(customer_id: Option<&str>, product_ids: &[&str]) -> EntityPayload {
        let cola = Product {
            sku: "COKE-330".into(),
            barcode: None,
            name: "Cola".into(),
            price_cents: 299,
            tax_rate_bps: 0,
            stock: None,
            is_active: true,
        };
        let lines = product_ids
            .iter()
            .map(|id| SaleLine::from_product(*id, &cola, 1))
            .collect();

        EntityPayload::Sale(Sale::from_lines(
            "R-0001",
            customer_id.map(str::to_string),
            lines,
            TaxRate::from_bps(0),
        ))
    }
}

#[derive(Debug, Clone)]
struct ServerRecord {
    /// `None` once deleted.
    data: Option<Value>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MockState {
    clock: DateTime<Utc>,
    next_id: u64,
    records: BTreeMap<(EntityTable, String), ServerRecord>,
    /// `(table, client id)` → server id, so repeated creates are one record.
    creates: HashMap<(EntityTable, String), String>,
    offline: bool,
    rejected: HashSet<String>,
    failing_pushes: u32,
    latency: Option<Duration>,
    injected: Vec<ServerChange>,
    pushes: Vec<ClientChange>,
    pulls: Vec<Option<DateTime<Utc>>>,
}

impl MockState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += chrono::Duration::seconds(1);
        self.clock
    }

    fn is_live(&self, table: EntityTable, id: &str) -> bool {
        self.records
            .get(&(table, id.to_string()))
            .is_some_and(|r| r.data.is_some())
    }

    fn check_references(&self, table: EntityTable, data: &Value) -> Result<(), RemoteError> {
        let payload = EntityPayload::from_data(table, data.clone()).map_err(|e| {
            RemoteError::Rejected {
                status: 422,
                message: e.to_string(),
            }
        })?;

        for reference in payload.references() {
            if !self.is_live(reference.table, &reference.id) {
                return Err(RemoteError::Rejected {
                    status: 422,
                    message: format!("unknown {} {}", reference.table, reference.id),
                });
            }
        }
        Ok(())
    }
}

/// Authoritative store kept in memory.
///
/// Server ids look like `srv-customers-1`. Every write advances a
/// deterministic clock by one second.
#[derive(Debug)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    pub fn new() -> Self {
        MockRemote {
            state: Mutex::new(MockState {
                clock: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
                next_id: 0,
                records: BTreeMap::new(),
                creates: HashMap::new(),
                offline: false,
                rejected: HashSet::new(),
                failing_pushes: 0,
                latency: None,
                injected: Vec::new(),
                pushes: Vec::new(),
                pulls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Rejects every push for this id with a 422.
    pub fn reject(&self, id: &str) {
        self.state().rejected.insert(id.to_string());
    }

    /// The next `n` pushes answer 503.
    pub fn fail_pushes(&self, n: u32) {
        self.state().failing_pushes = n;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    /// Adds a record as if another client created it. Returns its id.
    pub fn server_insert(&self, payload: &EntityPayload) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("srv-{}-{}", payload.table(), state.next_id);
        let updated_at = state.tick();
        state.records.insert(
            (payload.table(), id.clone()),
            ServerRecord {
                data: Some(payload.to_data()),
                updated_at,
            },
        );
        id
    }

    /// Edits a record as another client would.
    pub fn server_edit(&self, table: EntityTable, id: &str, edit: impl FnOnce(&mut Value)) {
        let mut state = self.state();
        let updated_at = state.tick();
        let record = state
            .records
            .get_mut(&(table, id.to_string()))
            .expect("no such server record");
        edit(record.data.as_mut().expect("record deleted on server"));
        record.updated_at = updated_at;
    }

    pub fn server_delete(&self, table: EntityTable, id: &str) {
        let mut state = self.state();
        let updated_at = state.tick();
        if let Some(record) = state.records.get_mut(&(table, id.to_string())) {
            record.data = None;
            record.updated_at = updated_at;
        }
    }

    /// Appends a raw change to every pull response until cleared.
    pub fn inject(&self, change: ServerChange) {
        self.state().injected.push(change);
    }

    pub fn clear_injected(&self) {
        self.state().injected.clear();
    }

    pub fn record(&self, table: EntityTable, id: &str) -> Option<Value> {
        self.state()
            .records
            .get(&(table, id.to_string()))
            .and_then(|r| r.data.clone())
    }

    pub fn live_count(&self, table: EntityTable) -> usize {
        self.state()
            .records
            .iter()
            .filter(|((t, _), r)| *t == table && r.data.is_some())
            .count()
    }

    pub fn server_id_for(&self, table: EntityTable, client_id: &str) -> Option<String> {
        self.state()
            .creates
            .get(&(table, client_id.to_string()))
            .cloned()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state().clock
    }

    /// Advances the clock without writing anything.
    pub fn tick(&self) -> DateTime<Utc> {
        self.state().tick()
    }

    pub fn pushes(&self) -> Vec<ClientChange> {
        self.state().pushes.clone()
    }

    pub fn pulls(&self) -> Vec<Option<DateTime<Utc>>> {
        self.state().pulls.clone()
    }

    fn apply_push(&self, change: &ClientChange) -> Result<PushAck, RemoteError> {
        let mut state = self.state();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        state.pushes.push(change.clone());

        if state.failing_pushes > 0 {
            state.failing_pushes -= 1;
            return Err(RemoteError::Server {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        if state.rejected.contains(&change.id) {
            return Err(RemoteError::Rejected {
                status: 422,
                message: format!("{} {} failed validation", change.table, change.id),
            });
        }

        let key = (change.table, change.id.clone());
        match change.operation {
            SyncOperation::Create => {
                if let Some(server_id) = state.creates.get(&key).cloned() {
                    let updated_at = state.records[&(change.table, server_id.clone())].updated_at;
                    return Ok(PushAck {
                        server_id,
                        server_timestamp: updated_at,
                    });
                }

                let data = change.data.clone().unwrap_or(Value::Null);
                state.check_references(change.table, &data)?;

                state.next_id += 1;
                let server_id = format!("srv-{}-{}", change.table, state.next_id);
                let updated_at = state.tick();
                state.records.insert(
                    (change.table, server_id.clone()),
                    ServerRecord {
                        data: Some(data),
                        updated_at,
                    },
                );
                state.creates.insert(key, server_id.clone());
                Ok(PushAck {
                    server_id,
                    server_timestamp: updated_at,
                })
            }
            SyncOperation::Update => {
                let Some(current) = state.records.get(&key).cloned() else {
                    return Err(RemoteError::Rejected {
                        status: 404,
                        message: format!("unknown {} {}", change.table, change.id),
                    });
                };
                let stale = change
                    .base_synced_at
                    .map_or(true, |base| base < current.updated_at);
                if current.data.is_none() || stale {
                    return Err(RemoteError::Conflict {
                        server_data: current.data,
                        server_updated_at: current.updated_at,
                    });
                }

                let data = change.data.clone().unwrap_or(Value::Null);
                state.check_references(change.table, &data)?;
                let updated_at = state.tick();
                state.records.insert(
                    key,
                    ServerRecord {
                        data: Some(data),
                        updated_at,
                    },
                );
                Ok(PushAck {
                    server_id: change.id.clone(),
                    server_timestamp: updated_at,
                })
            }
            SyncOperation::Delete => {
                let updated_at = state.tick();
                if let Some(record) = state.records.get_mut(&key) {
                    record.data = None;
                    record.updated_at = updated_at;
                }
                Ok(PushAck {
                    server_id: change.id.clone(),
                    server_timestamp: updated_at,
                })
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn push(&self, change: &ClientChange) -> Result<PushAck, RemoteError> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.apply_push(change)
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullResponse, RemoteError> {
        let mut state = self.state();
        if state.offline {
            return Err(RemoteError::Network("connection refused".into()));
        }
        state.pulls.push(since);

        let mut changes: Vec<ServerChange> = state
            .records
            .iter()
            .filter(|(_, r)| since.map_or(true, |since| r.updated_at > since))
            .map(|((table, id), r)| ServerChange {
                table: table.as_str().to_string(),
                operation: if r.data.is_some() {
                    SyncOperation::Update
                } else {
                    SyncOperation::Delete
                },
                id: id.clone(),
                data: r.data.clone(),
                server_timestamp: r.updated_at,
            })
            .collect();
        changes.sort_by_key(|c| c.server_timestamp);
        changes.extend(state.injected.iter().cloned());

        Ok(PullResponse {
            server_timestamp: state.clock,
            changes,
        })
    }
}
