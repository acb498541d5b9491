use crate::models::{AggregateKey, AggregateValue, UsageRecord};
use crate::services::metrics;
use std::collections::BTreeMap;

/// Folds raw usage events into per-(contract, dimension) totals.
///
/// Records without a contract, a dimension or a positive unit price are
/// dropped. Each value is truncated toward zero before it is summed, and the
/// unit price kept per key is the highest one seen.
pub fn aggregate(records: &[UsageRecord]) -> BTreeMap<AggregateKey, AggregateValue> {
    let mut aggregated: BTreeMap<AggregateKey, AggregateValue> = BTreeMap::new();
    let mut dropped = 0u64;

    for record in records {
        let (Some(contract_id), Some(dimension)) = (
            record.external_payer_id.as_deref().filter(|s| !s.is_empty()),
            record.dimension.as_deref().filter(|s| !s.is_empty()),
        ) else {
            tracing::warn!(?record, "Skipping usage record with missing contract or dimension");
            dropped += 1;
            continue;
        };

        let Some(unit_price) = record.price_per_unit.filter(|p| *p > 0.0) else {
            tracing::warn!(
                contract_id,
                dimension,
                price_per_unit = ?record.price_per_unit,
                "Skipping usage record without a positive unit price"
            );
            dropped += 1;
            continue;
        };

        let quantity = record.value.unwrap_or(0.0).trunc();
        if !quantity.is_finite() {
            tracing::warn!(contract_id, dimension, "Skipping usage record with a non-finite value");
            dropped += 1;
            continue;
        }

        aggregated
            .entry(AggregateKey::new(contract_id, dimension))
            .and_modify(|entry| {
                entry.quantity += quantity;
                entry.unit_price = entry.unit_price.max(unit_price);
            })
            .or_insert(AggregateValue {
                quantity,
                unit_price,
            });
    }

    metrics::record_usage_records("aggregated", records.len() as u64 - dropped);
    metrics::record_usage_records("dropped", dropped);

    tracing::info!(
        records = records.len(),
        dropped,
        keys = aggregated.len(),
        "Aggregated usage records"
    );
    aggregated
}
