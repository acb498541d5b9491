//! Durable per-service processing state.
//!
//! The whole state blob is read, modified and written back on every mutation.
//! There is no locking: at most one process may run per service.

use crate::config::ServiceIdentity;
use crate::error::MeteringError;
use crate::models::{ErrorEntry, ServiceState, SubmissionPayload, YearMonth};
use crate::services::Storage;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whole-blob persistence for the state document.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `None` when nothing has been written yet.
    async fn load(&self) -> Result<Option<Vec<u8>>, MeteringError>;
    async fn save(&self, data: Vec<u8>) -> Result<(), MeteringError>;
}

/// Keeps the state blob as a single object in storage.
pub struct ObjectStateBackend {
    storage: Arc<dyn Storage>,
    key: String,
}

impl ObjectStateBackend {
    pub fn new(storage: Arc<dyn Storage>, identity: &ServiceIdentity) -> Self {
        Self {
            storage,
            key: identity.state_file(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl StateBackend for ObjectStateBackend {
    async fn load(&self) -> Result<Option<Vec<u8>>, MeteringError> {
        match self.storage.download(&self.key).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(MeteringError::Persistence(format!(
                "Failed to load state from {}: {}",
                self.key, e
            ))),
        }
    }

    async fn save(&self, data: Vec<u8>) -> Result<(), MeteringError> {
        self.storage.upload(&self.key, data).await.map_err(|e| {
            MeteringError::Persistence(format!("Failed to save state to {}: {}", self.key, e))
        })
    }
}

pub struct ProcessingStateStore {
    backend: Arc<dyn StateBackend>,
    service_key: String,
}

impl ProcessingStateStore {
    pub fn new(backend: Arc<dyn StateBackend>, identity: &ServiceIdentity) -> Self {
        Self {
            backend,
            service_key: identity.key(),
        }
    }

    async fn load_document(&self) -> Result<BTreeMap<String, Value>, MeteringError> {
        match self.backend.load().await? {
            None => Ok(BTreeMap::new()),
            Some(data) => serde_json::from_slice(&data)
                .map_err(|e| MeteringError::Persistence(format!("State blob is corrupt: {}", e))),
        }
    }

    fn service_state(
        &self,
        document: &BTreeMap<String, Value>,
    ) -> Result<ServiceState, MeteringError> {
        match document.get(&self.service_key) {
            None => Ok(ServiceState::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                MeteringError::Persistence(format!(
                    "State for {} is corrupt: {}",
                    self.service_key, e
                ))
            }),
        }
    }

    /// Loads, applies `f` to this service's state, stamps `last_updated`, saves.
    async fn mutate<F>(&self, f: F) -> Result<(), MeteringError>
    where
        F: FnOnce(&mut ServiceState) + Send,
    {
        let mut document = self.load_document().await?;
        let mut state = self.service_state(&document)?;

        f(&mut state);
        state.last_updated = Some(now());

        let value = serde_json::to_value(&state)
            .map_err(|e| MeteringError::Persistence(format!("Failed to encode state: {}", e)))?;
        document.insert(self.service_key.clone(), value);

        let data = serde_json::to_vec_pretty(&document)
            .map_err(|e| MeteringError::Persistence(format!("Failed to encode state: {}", e)))?;
        self.backend.save(data).await
    }

    pub async fn snapshot(&self) -> Result<ServiceState, MeteringError> {
        let document = self.load_document().await?;
        self.service_state(&document)
    }

    /// Load + save round trip so permission problems surface at startup.
    pub async fn validate_access(&self) -> Result<(), MeteringError> {
        let document = self.load_document().await?;
        self.service_state(&document)?;

        let data = serde_json::to_vec_pretty(&document)
            .map_err(|e| MeteringError::Persistence(format!("Failed to encode state: {}", e)))?;
        self.backend.save(data).await?;

        tracing::info!(service_key = %self.service_key, "State storage access validated");
        Ok(())
    }

    /// True when the contract has either succeeded or has a recorded error for `month`.
    pub async fn is_processed(
        &self,
        contract_id: &str,
        month: YearMonth,
    ) -> Result<bool, MeteringError> {
        Ok(self.snapshot().await?.is_processed(contract_id, &month))
    }

    pub async fn mark_processed(
        &self,
        contract_id: &str,
        month: YearMonth,
    ) -> Result<(), MeteringError> {
        self.mutate(|state| {
            state
                .success_contracts
                .entry(month)
                .or_default()
                .insert(contract_id.to_string());
        })
        .await?;

        tracing::info!(contract_id = %contract_id, month = %month, "Marked contract as processed");
        Ok(())
    }

    /// Records a failed submission. Repeated failures append to `errors` and
    /// bump `retry_count`; the first failure starts at zero.
    pub async fn mark_error(
        &self,
        contract_id: &str,
        month: YearMonth,
        errors: Vec<String>,
        code: Option<&str>,
        message: Option<&str>,
        payload: Option<SubmissionPayload>,
    ) -> Result<(), MeteringError> {
        let timestamp = now();
        let mut retry_count = 0;

        self.mutate(|state| {
            let entries = state.error_contracts.entry(month).or_default();
            let existing = entries
                .iter_mut()
                .find(|entry| entry.contract_id.as_deref() == Some(contract_id));

            match existing {
                Some(entry) => {
                    entry.errors.extend(errors);
                    if let Some(code) = code.filter(|c| !c.is_empty()) {
                        entry.code = Some(code.to_string());
                    }
                    if let Some(message) = message.filter(|m| !m.is_empty()) {
                        entry.message = Some(message.to_string());
                    }
                    if let Some(payload) = payload.filter(|p| !p.request.is_empty()) {
                        entry.payload = Some(payload);
                    }
                    entry.retry_count += 1;
                    entry.last_retry_time = Some(timestamp);
                    retry_count = entry.retry_count;
                }
                None => entries.push(ErrorEntry {
                    contract_id: Some(contract_id.to_string()),
                    errors,
                    code: code.filter(|c| !c.is_empty()).map(str::to_string),
                    message: message.filter(|m| !m.is_empty()).map(str::to_string),
                    payload: payload.filter(|p| !p.request.is_empty()),
                    retry_count: 0,
                    last_retry_time: Some(timestamp),
                }),
            }
        })
        .await?;

        tracing::warn!(
            contract_id = %contract_id,
            month = %month,
            retry_count,
            "Recorded contract error"
        );
        Ok(())
    }

    /// Error entries for `month` that have not exhausted `max_retries`.
    pub async fn errors_for_retry(
        &self,
        month: YearMonth,
        max_retries: u32,
    ) -> Result<Vec<ErrorEntry>, MeteringError> {
        let state = self.snapshot().await?;
        let entries = state.error_contracts.get(&month).cloned().unwrap_or_default();

        let (retryable, exhausted): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|entry| entry.retry_count < max_retries);

        for entry in &exhausted {
            tracing::warn!(
                contract_id = entry.contract_id.as_deref().unwrap_or("<unknown>"),
                month = %month,
                retry_count = entry.retry_count,
                "Contract exceeded max retries, skipping"
            );
        }
        Ok(retryable)
    }

    pub async fn remove_error(
        &self,
        contract_id: &str,
        month: YearMonth,
    ) -> Result<(), MeteringError> {
        self.mutate(|state| drop_error(state, contract_id, month))
            .await
    }

    /// Clears any stored error and marks the contract processed in one write.
    pub async fn settle_success(
        &self,
        contract_id: &str,
        month: YearMonth,
    ) -> Result<(), MeteringError> {
        self.mutate(|state| {
            drop_error(state, contract_id, month);
            state
                .success_contracts
                .entry(month)
                .or_default()
                .insert(contract_id.to_string());
        })
        .await?;

        tracing::info!(contract_id = %contract_id, month = %month, "Marked contract as processed");
        Ok(())
    }

    pub async fn last_processed_month(&self) -> Result<Option<YearMonth>, MeteringError> {
        Ok(self.snapshot().await?.last_processed_month)
    }

    pub async fn update_last_processed_month(
        &self,
        month: YearMonth,
    ) -> Result<(), MeteringError> {
        self.mutate(|state| state.last_processed_month = Some(month))
            .await?;
        tracing::info!(month = %month, "Advanced last processed month");
        Ok(())
    }
}

fn drop_error(state: &mut ServiceState, contract_id: &str, month: YearMonth) {
    if let Some(entries) = state.error_contracts.get_mut(&month) {
        entries.retain(|entry| entry.contract_id.as_deref() != Some(contract_id));
        if entries.is_empty() {
            state.error_contracts.remove(&month);
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
