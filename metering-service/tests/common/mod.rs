//! Common test utilities for metering-service integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use metering_service::config::{MeteringConfig, ServiceIdentity};
use metering_service::error::MeteringError;
use metering_service::models::{
    MeteringRecord, ResultEntry, ServiceState, SubmissionResponse, YearMonth,
};
use metering_service::services::usage_source::EXPORT_MARKER_KEY;
use metering_service::services::{AccessToken, BillingApi, MemoryStorage, Storage};
use metering_service::startup::Application;
use serde_json::{json, Value};
use service_core::config::Config as CommonConfig;
use service_core::error::AppError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

static INIT: Once = Once::new();

pub const SERVICE_NAME: &str = "svc";
pub const ENVIRONMENT_TYPE: &str = "PROD";
pub const PLAN_ID: &str = "plan-1";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,metering_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn identity() -> ServiceIdentity {
    ServiceIdentity::new(SERVICE_NAME, ENVIRONMENT_TYPE, PLAN_ID)
}

pub fn ym(s: &str) -> YearMonth {
    s.parse().expect("valid YYYY-MM")
}

/// Environment a minimal dry-run deployment would carry.
pub fn base_env() -> HashMap<String, String> {
    [
        ("SERVICE_NAME", SERVICE_NAME),
        ("ENVIRONMENT_TYPE", ENVIRONMENT_TYPE),
        ("PLAN_ID", PLAN_ID),
        ("S3_BUCKET_NAME", "metering-bucket"),
        ("STORAGE_BACKEND", "local"),
        ("DRY_RUN", "true"),
        ("START_MONTH", "2025-01"),
        ("MAX_RETRIES", "3"),
        ("DIMENSION1_NAME", "cpu_core_hours"),
        ("DIMENSION1_FORMULA", "cpu_core_hours"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn config_from(env: &HashMap<String, String>) -> Result<MeteringConfig, MeteringError> {
    MeteringConfig::from_lookup(CommonConfig::default(), |key| env.get(key).cloned())
}

/// Test configuration with `overrides` applied on top of [`base_env`].
pub fn test_config(overrides: &[(&str, &str)]) -> MeteringConfig {
    let mut env = base_env();
    for (key, value) in overrides {
        env.insert(key.to_string(), value.to_string());
    }
    config_from(&env).expect("Failed to build test config")
}

pub fn usage_record(contract: &str, dimension: &str, value: f64, price: f64) -> Value {
    json!({
        "externalPayerId": contract,
        "dimension": dimension,
        "value": value,
        "pricePerUnit": price,
        "timestamp": "2025-01-15T10:00:00Z"
    })
}

/// Writes one usage file for `month` under the service's metering prefix.
pub async fn seed_usage(storage: &MemoryStorage, month: &str, file: &str, records: Vec<Value>) {
    let month = ym(month);
    let key = format!(
        "omnistrate-metering/{}/{}/{}/{:04}/{:02}/{}",
        SERVICE_NAME,
        ENVIRONMENT_TYPE,
        PLAN_ID,
        month.year(),
        month.month(),
        file
    );
    storage
        .upload(&key, serde_json::to_vec(&Value::Array(records)).unwrap())
        .await
        .unwrap();
}

/// Marks every month up to and including `month` as completely exported.
pub async fn seed_export_marker(storage: &MemoryStorage, month: &str) {
    let end = ym(month).end_time().to_rfc3339();
    let mut marker = serde_json::Map::new();
    marker.insert(identity().key(), json!({ "lastSuccessfulExport": end }));
    storage
        .upload(EXPORT_MARKER_KEY, serde_json::to_vec(&marker).unwrap())
        .await
        .unwrap();
}

pub async fn stored_state(storage: &MemoryStorage) -> ServiceState {
    let data = storage
        .download(&identity().state_file())
        .await
        .expect("State should have been written");
    let document: HashMap<String, Value> = serde_json::from_slice(&data).unwrap();
    serde_json::from_value(document[&identity().key()].clone()).unwrap()
}

pub fn success_response(records: &[MeteringRecord]) -> SubmissionResponse {
    SubmissionResponse {
        results: records
            .iter()
            .map(|_| ResultEntry::success("Accepted"))
            .collect(),
    }
}

pub fn error_response(errors: Value, code: &str, message: &str) -> SubmissionResponse {
    SubmissionResponse {
        results: vec![ResultEntry {
            status: Some("failure".to_string()),
            errors: Some(errors),
            code: Some(code.to_string()),
            message: Some(message.to_string()),
        }],
    }
}

pub type ScriptedReply = Result<SubmissionResponse, MeteringError>;

/// Billing API double that records every call and replays queued replies.
///
/// Once the queue is drained every submission succeeds.
#[derive(Default)]
pub struct ScriptedBilling {
    replies: Mutex<VecDeque<ScriptedReply>>,
    submissions: Mutex<Vec<Vec<MeteringRecord>>>,
    auth_calls: AtomicUsize,
    reject_auth: bool,
}

impl ScriptedBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_auth() -> Self {
        Self {
            reject_auth: true,
            ..Self::default()
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn submissions(&self) -> Vec<Vec<MeteringRecord>> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingApi for ScriptedBilling {
    async fn authenticate(&self) -> Result<AccessToken, MeteringError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth {
            return Err(MeteringError::Authentication("HTTP 401: invalid client".into()));
        }
        Ok(AccessToken::new("test-token"))
    }

    async fn submit(
        &self,
        _token: &AccessToken,
        records: &[MeteringRecord],
    ) -> Result<SubmissionResponse, MeteringError> {
        self.submissions.lock().unwrap().push(records.to_vec());
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Ok(success_response(records)))
    }
}

pub struct TestApp {
    pub app: Application,
    pub storage: Arc<MemoryStorage>,
    pub billing: Arc<ScriptedBilling>,
}

/// Builds an application over in-memory storage and a scripted billing API.
pub fn spawn_app(config: MeteringConfig) -> TestApp {
    spawn_app_with(config, Arc::new(MemoryStorage::new()), Arc::new(ScriptedBilling::new()))
}

pub fn spawn_app_with(
    config: MeteringConfig,
    storage: Arc<MemoryStorage>,
    billing: Arc<ScriptedBilling>,
) -> TestApp {
    init_tracing();
    let app = Application::with_components(config, storage.clone(), billing.clone());
    TestApp {
        app,
        storage,
        billing,
    }
}

/// Storage whose listings always fail; reads go to the wrapped store.
pub struct UnlistableStorage {
    pub inner: MemoryStorage,
}

#[async_trait]
impl Storage for UnlistableStorage {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), AppError> {
        self.inner.upload(key, data).await
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, AppError> {
        self.inner.download(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, AppError> {
        Err(AppError::StorageError(anyhow::anyhow!(
            "Access denied listing {}",
            prefix
        )))
    }
}
