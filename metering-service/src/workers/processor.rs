//! Monthly export driver.
//!
//! One cycle picks the next eligible month, retries contracts that failed
//! earlier in that month, then aggregates, transforms and submits whatever is
//! still unsettled. The month only advances once every step succeeded.

use crate::config::MeteringConfig;
use crate::error::MeteringError;
use crate::models::{
    AggregateKey, ErrorEntry, MeteringRecord, SubmissionPayload, SubmissionResponse, YearMonth,
    DEFAULT_ERROR_CODE, RETRY_ERROR_CODE, TIMESTAMP_FORMAT,
};
use crate::services::billing::{AccessToken, BillingApi};
use crate::services::metrics;
use crate::services::state_store::ProcessingStateStore;
use crate::services::usage_source::UsageSource;
use crate::workers::aggregator::aggregate;
use crate::workers::month_selector::{next_month, MonthSelection};
use crate::workers::transformer::transform;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    CaughtUp,
    /// Month fully settled and recorded as processed.
    Processed(YearMonth),
    /// Some contract is still failing; the month will be retried next cycle.
    Failed(YearMonth),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::CaughtUp => "caught_up",
            CycleOutcome::Processed(_) => "processed",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Retry,
    New,
}

impl Phase {
    fn label(&self) -> &'static str {
        match self {
            Phase::Retry => "retry",
            Phase::New => "new",
        }
    }

    fn transport_error_code(&self) -> &'static str {
        match self {
            Phase::Retry => RETRY_ERROR_CODE,
            Phase::New => DEFAULT_ERROR_CODE,
        }
    }
}

pub struct MeteringProcessor {
    config: Arc<MeteringConfig>,
    usage_source: Arc<dyn UsageSource>,
    state: Arc<ProcessingStateStore>,
    billing: Arc<dyn BillingApi>,
}

impl MeteringProcessor {
    pub fn new(
        config: Arc<MeteringConfig>,
        usage_source: Arc<dyn UsageSource>,
        state: Arc<ProcessingStateStore>,
        billing: Arc<dyn BillingApi>,
    ) -> Self {
        Self {
            config,
            usage_source,
            state,
            billing,
        }
    }

    /// Processes at most one month and advances the stored cursor on success.
    pub async fn process_next_month(&self) -> Result<CycleOutcome, MeteringError> {
        let last_processed = self.state.last_processed_month().await?;
        let latest_complete = self.usage_source.latest_complete_month().await?;

        let month = match next_month(last_processed, latest_complete, self.config.start_month)? {
            MonthSelection::CaughtUp => {
                tracing::info!("No more months to process, caught up");
                return Ok(CycleOutcome::CaughtUp);
            }
            MonthSelection::Next(month) => month,
        };

        if self.process_month(month).await? {
            self.state.update_last_processed_month(month).await?;
            tracing::info!(month = %month, "Successfully processed month");
            Ok(CycleOutcome::Processed(month))
        } else {
            tracing::error!(month = %month, "Failed to process month");
            Ok(CycleOutcome::Failed(month))
        }
    }

    /// Runs every phase for `month`. `Ok(false)` means some contract still failed.
    pub async fn process_month(&self, month: YearMonth) -> Result<bool, MeteringError> {
        tracing::info!(
            month = %month,
            service_key = %self.config.identity.key(),
            "Processing month"
        );

        let retry_success = self.retry_error_contracts(month).await?;

        let files = self.usage_source.list_month_files(month).await?;
        if files.is_empty() {
            tracing::info!(month = %month, "No usage files found");
            return Ok(retry_success);
        }

        let mut records = Vec::new();
        for file in &files {
            records.extend(self.usage_source.read_file(file).await?);
        }
        if records.is_empty() {
            tracing::info!(month = %month, "No usage records found");
            return Ok(retry_success);
        }

        let aggregated = aggregate(&records);
        if aggregated.is_empty() {
            tracing::info!(month = %month, records = records.len(), "No billable usage after aggregation");
            return Ok(retry_success);
        }

        let quantities = match transform(&aggregated, &self.config.custom_dimensions) {
            Ok(quantities) => quantities,
            Err(MeteringError::NoValidDimensionData) => {
                tracing::error!(month = %month, "All dimension transformations failed, skipping month");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let pending = self.filter_settled(quantities, month).await?;
        if pending.is_empty() {
            tracing::info!(month = %month, "All contracts have already been processed");
            return Ok(retry_success);
        }

        let submit_success = self.submit_contracts(pending, month).await?;
        Ok(retry_success && submit_success)
    }

    /// Resubmits stored payloads for contracts that failed earlier in `month`.
    pub async fn retry_error_contracts(&self, month: YearMonth) -> Result<bool, MeteringError> {
        let entries = self
            .state
            .errors_for_retry(month, self.config.max_retries)
            .await?;
        if entries.is_empty() {
            return Ok(true);
        }

        tracing::info!(month = %month, count = entries.len(), "Retrying failed contracts");
        let token = self.billing.authenticate().await?;
        let mut all_success = true;

        for entry in entries {
            let ErrorEntry {
                contract_id: Some(contract_id),
                payload: Some(payload),
                ..
            } = entry
            else {
                tracing::warn!(month = %month, "Skipping error entry without contract or payload");
                continue;
            };

            tracing::info!(
                contract_id = %contract_id,
                month = %month,
                attempt = entry.retry_count + 1,
                "Retrying contract"
            );
            let response = self.billing.submit(&token, &payload.request).await;
            if !self
                .settle(Phase::Retry, &contract_id, month, payload, response)
                .await?
            {
                all_success = false;
            }
        }

        Ok(all_success)
    }

    /// Drops every entry whose contract is already settled or recorded as failing.
    pub async fn filter_settled(
        &self,
        quantities: BTreeMap<AggregateKey, f64>,
        month: YearMonth,
    ) -> Result<BTreeMap<AggregateKey, f64>, MeteringError> {
        let state = self.state.snapshot().await?;
        let before = quantities.len();

        let pending: BTreeMap<AggregateKey, f64> = quantities
            .into_iter()
            .filter(|(key, _)| !state.is_processed(&key.contract_id, &month))
            .collect();

        tracing::info!(
            month = %month,
            total = before,
            skipped = before - pending.len(),
            "Filtered already processed contracts"
        );
        Ok(pending)
    }

    /// Submits one request per contract and records each outcome.
    pub async fn submit_contracts(
        &self,
        quantities: BTreeMap<AggregateKey, f64>,
        month: YearMonth,
    ) -> Result<bool, MeteringError> {
        let mut by_contract: BTreeMap<String, Vec<MeteringRecord>> = BTreeMap::new();
        for (key, value) in quantities {
            let record = self.metering_record(&key, value, month);
            by_contract.entry(key.contract_id).or_default().push(record);
        }

        let token: AccessToken = self.billing.authenticate().await?;
        let mut all_success = true;

        for (contract_id, records) in by_contract {
            tracing::info!(
                contract_id = %contract_id,
                month = %month,
                records = records.len(),
                "Submitting contract"
            );
            let response = self.billing.submit(&token, &records).await;
            let payload = SubmissionPayload::new(records);
            if !self
                .settle(Phase::New, &contract_id, month, payload, response)
                .await?
            {
                all_success = false;
            }
        }

        Ok(all_success)
    }

    fn metering_record(&self, key: &AggregateKey, value: f64, month: YearMonth) -> MeteringRecord {
        MeteringRecord {
            cloud: self.config.clazar.cloud.clone(),
            contract_id: key.contract_id.clone(),
            dimension: key.dimension.clone(),
            start_time: month.start_time().format(TIMESTAMP_FORMAT).to_string(),
            end_time: month.end_time().format(TIMESTAMP_FORMAT).to_string(),
            quantity: format!("{:.0}", value.trunc()),
        }
    }

    /// Records the outcome of one submission. Returns whether it succeeded.
    async fn settle(
        &self,
        phase: Phase,
        contract_id: &str,
        month: YearMonth,
        payload: SubmissionPayload,
        response: Result<SubmissionResponse, MeteringError>,
    ) -> Result<bool, MeteringError> {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    contract_id = %contract_id,
                    month = %month,
                    phase = phase.label(),
                    error = %e,
                    "Submission failed"
                );
                metrics::record_submission(phase.label(), "failure");
                let message = e.to_string();
                self.state
                    .mark_error(
                        contract_id,
                        month,
                        vec![message.clone()],
                        Some(phase.transport_error_code()),
                        Some(&message),
                        Some(payload),
                    )
                    .await?;
                return Ok(false);
            }
        };

        let outcome = response.classify();
        if outcome.has_errors {
            tracing::error!(
                contract_id = %contract_id,
                month = %month,
                phase = phase.label(),
                code = %outcome.code,
                errors = ?outcome.errors,
                "Clazar rejected submission"
            );
            metrics::record_submission(phase.label(), "error");
            self.state
                .mark_error(
                    contract_id,
                    month,
                    outcome.errors,
                    Some(&outcome.code),
                    Some(&outcome.message),
                    Some(payload),
                )
                .await?;
            return Ok(false);
        }

        for warning in &outcome.warnings {
            tracing::warn!(
                contract_id = %contract_id,
                status = warning.status.as_deref().unwrap_or_default(),
                "Sent data to Clazar with warnings; check that the dimensions are registered"
            );
        }

        metrics::record_submission(phase.label(), "success");
        self.state.settle_success(contract_id, month).await?;
        Ok(true)
    }
}
