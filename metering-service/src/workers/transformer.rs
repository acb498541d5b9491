use crate::config::CustomDimension;
use crate::error::MeteringError;
use crate::models::{AggregateKey, AggregateValue};
use crate::services::formula::{Variables, BASE_DIMENSIONS, PRICE_SUFFIX};
use crate::services::metrics;
use std::collections::BTreeMap;

/// Replaces aggregated base dimensions with the configured custom dimensions.
///
/// Formulas are evaluated per contract. A contract whose formulas do not all
/// yield a non-negative finite number contributes nothing for this run.
pub fn transform(
    aggregated: &BTreeMap<AggregateKey, AggregateValue>,
    custom_dimensions: &[CustomDimension],
) -> Result<BTreeMap<AggregateKey, f64>, MeteringError> {
    if custom_dimensions.is_empty() {
        return Ok(aggregated
            .iter()
            .map(|(key, value)| (key.clone(), value.quantity))
            .collect());
    }

    let mut by_contract: BTreeMap<&str, BTreeMap<&str, AggregateValue>> = BTreeMap::new();
    for (key, value) in aggregated {
        by_contract
            .entry(key.contract_id.as_str())
            .or_default()
            .insert(key.dimension.as_str(), *value);
    }

    let mut transformed = BTreeMap::new();
    let contracts = by_contract.len();

    for (contract_id, dimensions) in by_contract {
        let vars = variables_for(&dimensions);
        match evaluate_all(custom_dimensions, &vars) {
            Ok(values) => {
                for (name, value) in values {
                    transformed.insert(AggregateKey::new(contract_id, name), value);
                }
            }
            Err((dimension, e)) => {
                metrics::record_formula_failure(dimension);
                tracing::error!(
                    contract_id,
                    dimension,
                    error = %e,
                    "Custom dimension failed, skipping contract"
                );
            }
        }
    }

    if transformed.is_empty() {
        tracing::error!(contracts, "No contract produced valid custom dimension data");
        return Err(MeteringError::NoValidDimensionData);
    }
    Ok(transformed)
}

fn variables_for(dimensions: &BTreeMap<&str, AggregateValue>) -> Variables {
    let mut vars = Variables::new();
    for base in BASE_DIMENSIONS {
        let (quantity, price) = dimensions
            .get(base)
            .map(|v| (v.quantity, v.unit_price))
            .unwrap_or((0.0, 0.0));
        vars.insert(base.to_string(), quantity);
        vars.insert(format!("{base}{PRICE_SUFFIX}"), price);
    }
    vars
}

fn evaluate_all<'a>(
    custom_dimensions: &'a [CustomDimension],
    vars: &Variables,
) -> Result<Vec<(&'a str, f64)>, (&'a str, MeteringError)> {
    custom_dimensions
        .iter()
        .map(|dimension| {
            let name = dimension.name.as_str();
            let value = dimension
                .formula
                .evaluate(vars)
                .map_err(|e| (name, MeteringError::Validation(e.to_string())))?;
            if !value.is_finite() || value < 0.0 {
                return Err((
                    name,
                    MeteringError::Validation(format!(
                        "result {} is not a non-negative finite number",
                        value
                    )),
                ));
            }
            Ok((name, value))
        })
        .collect()
}
