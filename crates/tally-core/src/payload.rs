//! # Entity Payloads
//!
//! Typed schemas for every syncable table, unified as [`EntityPayload`].
//!
//! ## Tagged Union
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     EntityPayload (tag = table)                         │
//! │                                                                         │
//! │  customers ──► Customer   (no references)                              │
//! │  products  ──► Product    (no references)                              │
//! │  sales     ──► Sale       ──► customers (customer_id)                  │
//! │                           ──► products  (lines[].product_id)           │
//! │  repairs   ──► Repair     ──► customers (customer_id)                  │
//! │                           ──► sales     (sale_id)                      │
//! │                                                                         │
//! │  Storage and the wire keep the `data` half as an opaque JSON object.   │
//! │  Decoding happens at the boundary via from_data(table, value).         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! References are what the identity reconciler rewrites: once a customer
//! created offline as `c-1` is accepted by the server as `srv-42`, every
//! payload that still says `c-1` is rewritten to `srv-42`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::{Money, TaxRate};
use crate::types::EntityTable;

// =============================================================================
// Customer
// =============================================================================

/// A customer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Customer {
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub loyalty_points: i64,
}

// =============================================================================
// Product
// =============================================================================

/// A product available for sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Product {
    /// Stock Keeping Unit - business identifier.
    pub sku: String,

    /// Barcode (EAN-13, UPC-A, etc.).
    #[serde(default)]
    pub barcode: Option<String>,

    /// Display name shown to cashier and on receipt.
    pub name: String,

    /// Price in cents.
    pub price_cents: i64,

    /// Tax rate in basis points (825 = 8.25%).
    #[serde(default)]
    pub tax_rate_bps: u32,

    /// Current stock level, if tracked.
    #[serde(default)]
    pub stock: Option<i64>,

    /// Whether the product is offered at the register.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Product {
    /// Returns the price as a Money type.
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }

    #[inline]
    pub fn tax_rate(&self) -> TaxRate {
        TaxRate::from_bps(self.tax_rate_bps)
    }
}

// =============================================================================
// Sale
// =============================================================================

/// The status of a sale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    /// Sale is in progress (items being added).
    #[default]
    Draft,
    /// Sale has been paid and finalized.
    Completed,
    /// Sale was cancelled/refunded.
    Voided,
}

/// A line item in a sale.
///
/// `name_snapshot` and `unit_price_cents` freeze the product as sold, so a
/// later price change on the product does not rewrite history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SaleLine {
    pub product_id: String,
    pub name_snapshot: String,
    pub unit_price_cents: i64,
    pub quantity: i64,
    pub line_total_cents: i64,
}

impl SaleLine {
    /// Builds a line from a product, freezing its name and price.
    pub fn from_product(product_id: impl Into<String>, product: &Product, quantity: i64) -> Self {
        SaleLine {
            product_id: product_id.into(),
            name_snapshot: product.name.clone(),
            unit_price_cents: product.price_cents,
            quantity,
            line_total_cents: product.price().multiply_quantity(quantity).cents(),
        }
    }

    #[inline]
    pub fn line_total(&self) -> Money {
        Money::from_cents(self.line_total_cents)
    }
}

/// A sale transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Sale {
    /// Human-readable receipt number (e.g. "R-0001").
    pub receipt_number: String,

    /// Customer the sale was rung up for, if any.
    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub lines: Vec<SaleLine>,

    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,

    #[serde(default)]
    pub status: SaleStatus,

    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Sale {
    /// Builds a completed sale from lines, computing totals at one tax rate.
    pub fn from_lines(
        receipt_number: impl Into<String>,
        customer_id: Option<String>,
        lines: Vec<SaleLine>,
        tax_rate: TaxRate,
    ) -> Self {
        let subtotal: Money = lines.iter().map(SaleLine::line_total).sum();
        let tax = subtotal.calculate_tax(tax_rate);

        Sale {
            receipt_number: receipt_number.into(),
            customer_id,
            lines,
            subtotal_cents: subtotal.cents(),
            tax_cents: tax.cents(),
            total_cents: (subtotal + tax).cents(),
            status: SaleStatus::Completed,
            completed_at: Some(Utc::now()),
        }
    }

    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }
}

// =============================================================================
// Repair
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    #[default]
    Received,
    InProgress,
    Ready,
    Collected,
}

/// A repair ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Repair {
    pub customer_id: String,

    /// Sale the repaired device was bought in, if known.
    #[serde(default)]
    pub sale_id: Option<String>,

    pub device: String,
    pub issue: String,

    #[serde(default)]
    pub status: RepairStatus,

    #[serde(default)]
    pub quote_cents: Option<i64>,
}

// =============================================================================
// References
// =============================================================================

/// A reference from one payload to another record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub table: EntityTable,
    pub id: String,
}

impl EntityRef {
    fn new(table: EntityTable, id: &str) -> Self {
        EntityRef {
            table,
            id: id.to_string(),
        }
    }
}

/// Rewrites `slot` if it holds `from`. Returns 1 when rewritten.
fn rewrite_slot(slot: &mut String, from: &str, to: &str) -> usize {
    if slot == from {
        *slot = to.to_string();
        1
    } else {
        0
    }
}

// =============================================================================
// Entity Payload
// =============================================================================

/// A typed record payload, tagged by its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "table", content = "data")]
pub enum EntityPayload {
    #[serde(rename = "customers")]
    Customer(Customer),
    #[serde(rename = "products")]
    Product(Product),
    #[serde(rename = "sales")]
    Sale(Sale),
    #[serde(rename = "repairs")]
    Repair(Repair),
}

impl EntityPayload {
    /// Returns the table this payload belongs to.
    pub fn table(&self) -> EntityTable {
        match self {
            EntityPayload::Customer(_) => EntityTable::Customers,
            EntityPayload::Product(_) => EntityTable::Products,
            EntityPayload::Sale(_) => EntityTable::Sales,
            EntityPayload::Repair(_) => EntityTable::Repairs,
        }
    }

    /// Decodes the untagged `data` object of a record in `table`.
    ///
    /// ## Errors
    /// `CoreError::InvalidPayload` when the object does not match the
    /// table's schema.
    pub fn from_data(table: EntityTable, data: Value) -> CoreResult<Self> {
        let decoded = match table {
            EntityTable::Customers => serde_json::from_value(data).map(EntityPayload::Customer),
            EntityTable::Products => serde_json::from_value(data).map(EntityPayload::Product),
            EntityTable::Sales => serde_json::from_value(data).map(EntityPayload::Sale),
            EntityTable::Repairs => serde_json::from_value(data).map(EntityPayload::Repair),
        };

        decoded.map_err(|e| CoreError::invalid_payload(table.as_str(), e))
    }

    /// Decodes a JSON text column.
    pub fn from_json_str(table: EntityTable, json: &str) -> CoreResult<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| CoreError::invalid_payload(table.as_str(), e))?;
        Self::from_data(table, value)
    }

    /// Encodes the untagged `data` object.
    pub fn to_data(&self) -> Value {
        let encoded = match self {
            EntityPayload::Customer(c) => serde_json::to_value(c),
            EntityPayload::Product(p) => serde_json::to_value(p),
            EntityPayload::Sale(s) => serde_json::to_value(s),
            EntityPayload::Repair(r) => serde_json::to_value(r),
        };

        // Plain structs with String keys always serialize.
        encoded.unwrap_or(Value::Null)
    }

    /// Encodes the `data` object as JSON text for storage.
    pub fn to_json_string(&self) -> String {
        self.to_data().to_string()
    }

    /// Lists every record this payload points at.
    pub fn references(&self) -> Vec<EntityRef> {
        match self {
            EntityPayload::Customer(_) | EntityPayload::Product(_) => Vec::new(),
            EntityPayload::Sale(sale) => {
                let mut refs: Vec<EntityRef> = sale
                    .customer_id
                    .iter()
                    .map(|id| EntityRef::new(EntityTable::Customers, id))
                    .collect();
                refs.extend(
                    sale.lines
                        .iter()
                        .map(|line| EntityRef::new(EntityTable::Products, &line.product_id)),
                );
                refs
            }
            EntityPayload::Repair(repair) => {
                let mut refs = vec![EntityRef::new(EntityTable::Customers, &repair.customer_id)];
                if let Some(sale_id) = &repair.sale_id {
                    refs.push(EntityRef::new(EntityTable::Sales, sale_id));
                }
                refs
            }
        }
    }

    /// Rewrites references to `from` in `target` to `to`.
    ///
    /// ## Returns
    /// Number of reference slots rewritten (0 means untouched).
    pub fn rewrite_references(&mut self, target: EntityTable, from: &str, to: &str) -> usize {
        match (self, target) {
            (EntityPayload::Sale(sale), EntityTable::Customers) => sale
                .customer_id
                .as_mut()
                .map_or(0, |slot| rewrite_slot(slot, from, to)),
            (EntityPayload::Sale(sale), EntityTable::Products) => sale
                .lines
                .iter_mut()
                .map(|line| rewrite_slot(&mut line.product_id, from, to))
                .sum(),
            (EntityPayload::Repair(repair), EntityTable::Customers) => {
                rewrite_slot(&mut repair.customer_id, from, to)
            }
            (EntityPayload::Repair(repair), EntityTable::Sales) => repair
                .sale_id
                .as_mut()
                .map_or(0, |slot| rewrite_slot(slot, from, to)),
            _ => 0,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cola() -> Product {
        Product {
            sku: "COKE-330".into(),
            barcode: None,
            name: "Coca-Cola 330ml".into(),
            price_cents: 299,
            tax_rate_bps: 0,
            stock: Some(24),
            is_active: true,
        }
    }

    #[test]
    fn test_from_data_applies_defaults() {
        let payload = EntityPayload::from_data(
            EntityTable::Products,
            json!({ "sku": "A-1", "name": "Widget", "price_cents": 1000 }),
        )
        .unwrap();

        match payload {
            EntityPayload::Product(p) => {
                assert!(p.is_active);
                assert_eq!(p.stock, None);
                assert_eq!(p.price(), Money::from_cents(1000));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_from_data_rejects_wrong_types() {
        let err = EntityPayload::from_data(
            EntityTable::Products,
            json!({ "sku": "A-1", "name": "Widget", "price_cents": "ten" }),
        )
        .unwrap_err();

        assert!(matches!(err, CoreError::InvalidPayload { ref table, .. } if table == "products"));
    }

    #[test]
    fn test_tagged_serialization_uses_table_names() {
        let payload = EntityPayload::Customer(Customer {
            name: "Ada".into(),
            phone: None,
            email: None,
            notes: None,
            loyalty_points: 0,
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["table"], "customers");
        assert_eq!(value["data"]["name"], "Ada");
    }

    #[test]
    fn test_sale_references_and_rewrite() {
        let sale = Sale::from_lines(
            "R-0001",
            Some("c-1".into()),
            vec![
                SaleLine::from_product("p-1", &cola(), 2),
                SaleLine::from_product("p-1", &cola(), 1),
            ],
            TaxRate::from_bps(0),
        );
        let mut payload = EntityPayload::Sale(sale);

        assert_eq!(
            payload.references(),
            vec![
                EntityRef::new(EntityTable::Customers, "c-1"),
                EntityRef::new(EntityTable::Products, "p-1"),
                EntityRef::new(EntityTable::Products, "p-1"),
            ]
        );

        assert_eq!(payload.rewrite_references(EntityTable::Products, "p-1", "srv-p"), 2);
        assert_eq!(payload.rewrite_references(EntityTable::Customers, "c-1", "srv-c"), 1);
        // Same id in an unrelated table is not a reference.
        assert_eq!(payload.rewrite_references(EntityTable::Sales, "srv-c", "x"), 0);

        let refs = payload.references();
        assert!(refs.iter().all(|r| r.id.starts_with("srv-")));
    }

    #[test]
    fn test_repair_references_optional_sale() {
        let mut payload = EntityPayload::Repair(Repair {
            customer_id: "c-9".into(),
            sale_id: None,
            device: "Phone".into(),
            issue: "Cracked screen".into(),
            status: RepairStatus::Received,
            quote_cents: Some(8900),
        });

        assert_eq!(payload.references().len(), 1);
        assert_eq!(payload.rewrite_references(EntityTable::Sales, "s-1", "srv-s"), 0);
        assert_eq!(payload.rewrite_references(EntityTable::Customers, "c-9", "srv-9"), 1);
    }

    #[test]
    fn test_sale_totals() {
        let sale = Sale::from_lines(
            "R-0002",
            None,
            vec![SaleLine::from_product("p-1", &cola(), 3)],
            TaxRate::from_bps(1000),
        );
        assert_eq!(sale.subtotal_cents, 897);
        assert_eq!(sale.tax_cents, 90);
        assert_eq!(sale.total(), Money::from_cents(987));
    }
}
