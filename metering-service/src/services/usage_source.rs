use crate::config::ServiceIdentity;
use crate::error::MeteringError;
use crate::models::{UsageRecord, YearMonth};
use crate::services::Storage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

pub const METERING_ROOT: &str = "omnistrate-metering";
pub const EXPORT_MARKER_KEY: &str = "omnistrate-metering/last_success_export.json";

/// Monthly batches of raw usage events.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn list_month_files(&self, month: YearMonth) -> Result<Vec<String>, MeteringError>;
    async fn read_file(&self, file_id: &str) -> Result<Vec<UsageRecord>, MeteringError>;
    /// Latest month whose export is known to be complete, if any.
    async fn latest_complete_month(&self) -> Result<Option<YearMonth>, MeteringError>;
}

/// Reads exported usage batches from object storage.
pub struct ObjectStoreUsageSource {
    storage: Arc<dyn Storage>,
    identity: ServiceIdentity,
}

impl ObjectStoreUsageSource {
    pub fn new(storage: Arc<dyn Storage>, identity: ServiceIdentity) -> Self {
        Self { storage, identity }
    }

    pub fn month_prefix(&self, month: YearMonth) -> String {
        format!(
            "{}/{}/{}/{}/{:04}/{:02}/",
            METERING_ROOT,
            self.identity.service_name,
            self.identity.environment_type,
            self.identity.plan_id,
            month.year(),
            month.month()
        )
    }
}

#[async_trait]
impl UsageSource for ObjectStoreUsageSource {
    async fn list_month_files(&self, month: YearMonth) -> Result<Vec<String>, MeteringError> {
        let prefix = self.month_prefix(month);
        let keys = self.storage.list(&prefix).await.map_err(|e| {
            MeteringError::UsageSource(format!("Failed to list {}: {}", prefix, e))
        })?;

        let files: Vec<String> = keys.into_iter().filter(|k| k.ends_with(".json")).collect();
        tracing::info!(prefix = %prefix, count = files.len(), "Found usage files");
        Ok(files)
    }

    async fn read_file(&self, file_id: &str) -> Result<Vec<UsageRecord>, MeteringError> {
        let data = self.storage.download(file_id).await.map_err(|e| {
            MeteringError::UsageSource(format!("Failed to read {}: {}", file_id, e))
        })?;

        let items = match serde_json::from_slice::<Value>(&data) {
            Ok(Value::Array(items)) => items,
            Ok(_) => {
                tracing::error!(file = %file_id, "Usage file is not a JSON array");
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::error!(file = %file_id, error = %e, "Failed to parse usage file");
                return Ok(Vec::new());
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<UsageRecord>(item) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(file = %file_id, error = %e, "Skipping malformed usage record")
                }
            }
        }
        Ok(records)
    }

    async fn latest_complete_month(&self) -> Result<Option<YearMonth>, MeteringError> {
        let data = match self.storage.download(EXPORT_MARKER_KEY).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                tracing::error!(key = EXPORT_MARKER_KEY, "Export marker not found");
                return Ok(None);
            }
            Err(e) => {
                return Err(MeteringError::UsageSource(format!(
                    "Failed to read {}: {}",
                    EXPORT_MARKER_KEY, e
                )))
            }
        };

        let marker: Value = match serde_json::from_slice(&data) {
            Ok(marker) => marker,
            Err(e) => {
                tracing::error!(key = EXPORT_MARKER_KEY, error = %e, "Failed to parse export marker");
                return Ok(None);
            }
        };

        let service_key = self.identity.key();
        let Some(raw) = marker.get(&service_key).and_then(|entry| {
            entry
                .get("lastSuccessfulExport")
                .or_else(|| entry.get("last_processed_to"))
                .and_then(Value::as_str)
        }) else {
            tracing::warn!(service_key = %service_key, "No export marker entry for service");
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Ok(Some(complete_month_for(&ts.with_timezone(&Utc)))),
            Err(e) => {
                tracing::error!(service_key = %service_key, value = raw, error = %e, "Unparsable export timestamp");
                Ok(None)
            }
        }
    }
}

/// Month fully covered by an export that ran up to `ts`.
fn complete_month_for(ts: &DateTime<Utc>) -> YearMonth {
    let month = YearMonth::of(ts);
    if month.is_closed_by(ts) {
        month
    } else {
        month.previous()
    }
}
