use super::metering::SubmissionPayload;
use super::month::YearMonth;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Durable processing record for one (service, environment, plan).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(default)]
    pub last_processed_month: Option<YearMonth>,
    #[serde(default)]
    pub success_contracts: BTreeMap<YearMonth, BTreeSet<String>>,
    #[serde(default)]
    pub error_contracts: BTreeMap<YearMonth, Vec<ErrorEntry>>,
    /// RFC 3339 text; kept opaque so older writers' formats still load.
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl ServiceState {
    pub fn is_processed(&self, contract_id: &str, month: &YearMonth) -> bool {
        self.success_contracts
            .get(month)
            .is_some_and(|contracts| contracts.contains(contract_id))
            || self.error_entry(contract_id, month).is_some()
    }

    pub fn error_entry(&self, contract_id: &str, month: &YearMonth) -> Option<&ErrorEntry> {
        self.error_contracts
            .get(month)?
            .iter()
            .find(|entry| entry.contract_id.as_deref() == Some(contract_id))
    }
}

/// A failed submission kept for retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(default)]
    pub contract_id: Option<String>,
    /// Every failure message seen so far, oldest first.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<SubmissionPayload>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_retry_time: Option<String>,
}
