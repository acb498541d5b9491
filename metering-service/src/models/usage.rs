use serde::{Deserialize, Serialize};

/// A raw usage event as exported to the object store.
///
/// Only the fields below are read; anything else in the source record is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(rename = "externalPayerId", default)]
    pub external_payer_id: Option<String>,
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(rename = "pricePerUnit", default)]
    pub price_per_unit: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// (contract id, dimension name)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateKey {
    pub contract_id: String,
    pub dimension: String,
}

impl AggregateKey {
    pub fn new(contract_id: impl Into<String>, dimension: impl Into<String>) -> Self {
        Self {
            contract_id: contract_id.into(),
            dimension: dimension.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateValue {
    /// Sum of per-record values, each truncated toward zero. Kept as a
    /// float so byte-hour totals past `i64::MAX` are not clamped.
    pub quantity: f64,
    /// Highest unit price seen for the key. Feeds formulas only.
    pub unit_price: f64,
}
