//! # Conflict Resolver
//!
//! Pure decision function for records mutated on both sides between two
//! sync cycles.
//!
//! ## Decision Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      resolve(ConflictInput)                             │
//! │                                                                         │
//! │  1. server_updated_at <= base_synced_at ?                              │
//! │        yes ──► ClientWins   (server has nothing the client missed)     │
//! │                                                                         │
//! │  2. client_changed = diff(base, client)                                │
//! │     server_changed = diff(base, server)                                │
//! │     overlap = fields in both whose client/server values differ         │
//! │                                                                         │
//! │  3. overlap non-empty ──► Manual { fields }                            │
//! │                                                                         │
//! │  4. merged = server + client_changed fields                            │
//! │        merged == server ──► ServerWins                                 │
//! │        merged == client ──► ClientWins                                 │
//! │        otherwise        ──► Merged { data, client_fields, ... }        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Diffs are over top-level payload fields. Nested values (sale lines) are
//! compared as a whole. Numbers compare by exact decimal value, so `10.1`
//! and `10.10` are the same price and `1` equals `1.0`.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{EntityTable, ResolutionKind};

// =============================================================================
// Input / Output
// =============================================================================

/// Everything the resolver looks at for one record.
#[derive(Debug, Clone, Copy)]
pub struct ConflictInput<'a> {
    pub table: EntityTable,

    /// Last version both sides agreed on. `None` when the record was never
    /// acknowledged; every differing field then counts as changed.
    pub base: Option<&'a Value>,

    pub client: &'a Value,
    pub client_updated_at: DateTime<Utc>,

    /// The record's `server_synced_at`.
    pub base_synced_at: Option<DateTime<Utc>>,

    pub server: &'a Value,
    pub server_updated_at: DateTime<Utc>,
}

/// Resolver verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the client version; the pending mutation goes out as is.
    ClientWins,

    /// Take the server version; drop the pending mutation.
    ServerWins,

    /// Disjoint changes merged field-wise.
    Merged {
        data: Value,
        client_fields: Vec<String>,
        server_fields: Vec<String>,
    },

    /// Overlapping changes; an operator must choose.
    Manual { fields: Vec<String> },
}

impl Resolution {
    /// The value recorded in the conflict log and on the wire.
    ///
    /// A merge keeps the client's intent and reports as `client_wins`.
    pub fn kind(&self) -> ResolutionKind {
        match self {
            Resolution::ClientWins | Resolution::Merged { .. } => ResolutionKind::ClientWins,
            Resolution::ServerWins => ResolutionKind::ServerWins,
            Resolution::Manual { .. } => ResolutionKind::Manual,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Resolution::Manual { .. })
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Classifies and resolves a record-level conflict.
pub fn resolve(input: &ConflictInput<'_>) -> Resolution {
    if let Some(synced) = input.base_synced_at {
        if input.server_updated_at <= synced {
            return Resolution::ClientWins;
        }
    }

    let empty = Map::new();
    let base = input.base.and_then(Value::as_object).unwrap_or(&empty);
    let (client, server) = match (input.client.as_object(), input.server.as_object()) {
        (Some(c), Some(s)) => (c, s),
        // Non-object payloads cannot be merged field-wise.
        _ => {
            return if values_equal(input.client, input.server) {
                Resolution::ServerWins
            } else {
                Resolution::Manual {
                    fields: Vec::new(),
                }
            };
        }
    };

    let client_fields = changed_fields(base, client);
    let server_fields = changed_fields(base, server);

    let overlap: Vec<String> = client_fields
        .iter()
        .filter(|f| server_fields.contains(f))
        .filter(|f| !values_equal(field(client, f), field(server, f)))
        .cloned()
        .collect();

    if !overlap.is_empty() {
        return Resolution::Manual { fields: overlap };
    }

    let mut merged = server.clone();
    for name in &client_fields {
        match client.get(name) {
            Some(value) => {
                merged.insert(name.clone(), value.clone());
            }
            None => {
                merged.remove(name);
            }
        }
    }

    if objects_equal(&merged, server) {
        Resolution::ServerWins
    } else if objects_equal(&merged, client) {
        Resolution::ClientWins
    } else {
        Resolution::Merged {
            data: Value::Object(merged),
            client_fields,
            server_fields,
        }
    }
}

/// Top-level fields whose value differs between `base` and `side`,
/// including fields present on only one of them. Sorted.
pub fn changed_fields(base: &Map<String, Value>, side: &Map<String, Value>) -> Vec<String> {
    let mut names: Vec<String> = base
        .keys()
        .chain(side.keys())
        .filter(|k| !values_equal(field(base, k), field(side, k)))
        .cloned()
        .collect();
    names.sort();
    names.dedup();
    names
}

static NULL: Value = Value::Null;

fn field<'a>(map: &'a Map<String, Value>, name: &str) -> &'a Value {
    map.get(name).unwrap_or(&NULL)
}

fn objects_equal(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.keys()
        .chain(b.keys())
        .all(|k| values_equal(field(a, k), field(b, k)))
}

// =============================================================================
// Exact Value Comparison
// =============================================================================

/// Structural equality with exact decimal comparison for numbers.
///
/// A missing field and an explicit `null` are equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y),
        _ => a == b,
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    match (Decimal::parse(&a.to_string()), Decimal::parse(&b.to_string())) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Canonical decimal: sign, significant digits without leading or trailing
/// zeros, and the power of ten of the last digit.
#[derive(Debug, PartialEq, Eq)]
struct Decimal {
    negative: bool,
    digits: String,
    exponent: i64,
}

impl Decimal {
    fn parse(text: &str) -> Option<Decimal> {
        let (mantissa, exp) = match text.find(|c| c == 'e' || c == 'E') {
            Some(pos) => (&text[..pos], text[pos + 1..].parse::<i64>().ok()?),
            None => (text, 0),
        };

        let (negative, mantissa) = match mantissa.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, mantissa),
        };

        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
            return None;
        }

        let mut digits: String = format!("{int_part}{frac_part}");
        let mut exponent = exp - frac_part.len() as i64;

        let trimmed = digits.trim_start_matches('0').len();
        digits = digits[digits.len() - trimmed..].to_string();
        while digits.ends_with('0') {
            digits.pop();
            exponent += 1;
        }

        if digits.is_empty() {
            // All zeros: -0 and 0.00 are the same value.
            return Some(Decimal {
                negative: false,
                digits,
                exponent: 0,
            });
        }

        Some(Decimal {
            negative,
            digits,
            exponent,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
