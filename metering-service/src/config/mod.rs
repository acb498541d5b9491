use crate::error::MeteringError;
use crate::models::YearMonth;
use crate::services::formula::Formula;
use secrecy::Secret;
use service_core::config as core_config;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.clazar.io";
pub const MAX_CUSTOM_DIMENSIONS: usize = 3;

/// The (service, environment, plan) triple one process exports for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub environment_type: String,
    pub plan_id: String,
}

impl ServiceIdentity {
    pub fn new(
        service_name: impl Into<String>,
        environment_type: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            environment_type: environment_type.into(),
            plan_id: plan_id.into(),
        }
    }

    /// `service:environment:plan`
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.service_name, self.environment_type, self.plan_id
        )
    }

    pub fn state_file(&self) -> String {
        format!(
            "clazar/{}-{}-{}-export_state.json",
            self.service_name, self.environment_type, self.plan_id
        )
    }
}

#[derive(Debug, Clone)]
pub struct CustomDimension {
    pub name: String,
    pub formula: Formula,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    S3,
    Local,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "local" => Ok(StorageBackend::Local),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub local_path: String,
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<Secret<String>>,
}

#[derive(Debug, Clone)]
pub struct ClazarConfig {
    pub api_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<Secret<String>>,
    pub cloud: String,
    pub dry_run: bool,
    pub http_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_once: bool,
    pub metrics_textfile_path: Option<PathBuf>,
}

/// Immutable process configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub identity: ServiceIdentity,
    pub storage: StorageConfig,
    pub clazar: ClazarConfig,
    pub custom_dimensions: Vec<CustomDimension>,
    pub start_month: YearMonth,
    /// Ceiling for both HTTP retries and stored-error retries.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub scheduler: SchedulerConfig,
}

impl MeteringConfig {
    pub fn load() -> Result<Self, MeteringError> {
        // Load common config (handles .env and APP__ prefix)
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Builds and validates the configuration from a key lookup.
    pub fn from_lookup<F>(
        mut common: core_config::Config,
        lookup: F,
    ) -> Result<Self, MeteringError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(level) = get("LOG_LEVEL") {
            common.log_level = level;
        }
        if let Some(endpoint) = get("OTLP_ENDPOINT") {
            common.otlp_endpoint = Some(endpoint);
        }

        let identity = ServiceIdentity::new(
            required(&get, "SERVICE_NAME")?,
            required(&get, "ENVIRONMENT_TYPE")?,
            required(&get, "PLAN_ID")?,
        );

        let backend: StorageBackend = get("STORAGE_BACKEND")
            .unwrap_or_else(|| "s3".to_string())
            .parse()
            .map_err(MeteringError::Configuration)?;
        let storage = StorageConfig {
            bucket: required(&get, "S3_BUCKET_NAME")?,
            local_path: get("STORAGE_LOCAL_PATH").unwrap_or_else(|| "storage".to_string()),
            aws_region: get("AWS_REGION"),
            aws_access_key_id: get("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: get("AWS_SECRET_ACCESS_KEY").map(Secret::new),
            backend,
        };
        if storage.backend == StorageBackend::S3 {
            for key in ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_REGION"] {
                required(&get, key)?;
            }
        }

        let dry_run = get("DRY_RUN").is_some_and(|v| is_truthy(&v));
        let clazar = ClazarConfig {
            api_url: get("CLAZAR_API_URL")
                .unwrap_or_else(|| DEFAULT_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client_id: get("CLAZAR_CLIENT_ID"),
            client_secret: get("CLAZAR_CLIENT_SECRET").map(Secret::new),
            cloud: get("CLAZAR_CLOUD").unwrap_or_else(|| "aws".to_string()),
            dry_run,
            http_timeout: Duration::from_secs(number(&get, "HTTP_TIMEOUT_SECS", 30)?),
        };
        if !dry_run {
            required(&get, "CLAZAR_CLIENT_ID")?;
            required(&get, "CLAZAR_CLIENT_SECRET")?;
        }

        let start_month = match get("START_MONTH") {
            Some(raw) => parse_start_month(&raw)?,
            None => YearMonth::new(2025, 1)
                .ok_or_else(|| MeteringError::Configuration("Invalid default start month".into()))?,
        };

        let scheduler = SchedulerConfig {
            interval: Duration::from_secs(number(&get, "PROCESSING_INTERVAL_SECS", 300)?),
            run_once: get("RUN_ONCE").is_some_and(|v| is_truthy(&v)),
            metrics_textfile_path: get("METRICS_TEXTFILE_PATH").map(PathBuf::from),
        };
        if scheduler.interval.is_zero() {
            return Err(MeteringError::Configuration(
                "PROCESSING_INTERVAL_SECS must be greater than zero".into(),
            ));
        }

        Ok(MeteringConfig {
            common,
            identity,
            storage,
            clazar,
            custom_dimensions: custom_dimensions(&get)?,
            start_month,
            max_retries: number(&get, "MAX_RETRIES", 5)?,
            retry_base_delay: Duration::from_millis(number(&get, "RETRY_BASE_DELAY_MS", 2000)?),
            scheduler,
        })
    }

    /// Logs the effective configuration without secrets.
    pub fn summary(&self) {
        let dimensions: Vec<String> = self
            .custom_dimensions
            .iter()
            .map(|d| format!("{} = {}", d.name, d.formula))
            .collect();

        tracing::info!(
            service_name = %self.identity.service_name,
            environment_type = %self.identity.environment_type,
            plan_id = %self.identity.plan_id,
            storage_backend = ?self.storage.backend,
            bucket = %self.storage.bucket,
            api_url = %self.clazar.api_url,
            cloud = %self.clazar.cloud,
            dry_run = self.clazar.dry_run,
            start_month = %self.start_month,
            max_retries = self.max_retries,
            interval_secs = self.scheduler.interval.as_secs(),
            run_once = self.scheduler.run_once,
            custom_dimensions = ?dimensions,
            "Configuration loaded"
        );
    }
}

fn required<G>(get: &G, key: &str) -> Result<String, MeteringError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| MeteringError::Configuration(format!("{} is required but not set", key)))
}

fn number<G, T>(get: &G, key: &str, default: T) -> Result<T, MeteringError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            MeteringError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, raw))
        }),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_start_month(raw: &str) -> Result<YearMonth, MeteringError> {
    let month: YearMonth = raw
        .parse()
        .map_err(|e: String| MeteringError::Configuration(format!("START_MONTH: {}", e)))?;
    if month.year() < 1900 {
        return Err(MeteringError::Configuration(format!(
            "START_MONTH year must be between 1900 and 9999, got '{}'",
            raw
        )));
    }
    Ok(month)
}

fn custom_dimensions<G>(get: &G) -> Result<Vec<CustomDimension>, MeteringError>
where
    G: Fn(&str) -> Option<String>,
{
    let mut dimensions = Vec::new();
    let mut seen = HashSet::new();

    for i in 1..=MAX_CUSTOM_DIMENSIONS {
        let name_key = format!("DIMENSION{}_NAME", i);
        let formula_key = format!("DIMENSION{}_FORMULA", i);

        let (name, source) = match (get(&name_key), get(&formula_key)) {
            (None, None) => continue,
            (Some(name), Some(source)) => (name, source),
            _ => {
                return Err(MeteringError::Configuration(format!(
                    "{} and {} must be set together",
                    name_key, formula_key
                )))
            }
        };

        if !seen.insert(name.clone()) {
            return Err(MeteringError::Configuration(format!(
                "Duplicate custom dimension name '{}'",
                name
            )));
        }

        let formula = Formula::parse(&source).map_err(|e| {
            MeteringError::Configuration(format!("{} for '{}': {}", formula_key, name, e))
        })?;
        dimensions.push(CustomDimension { name, formula });
    }

    if dimensions.is_empty() {
        return Err(MeteringError::Configuration(
            "At least one custom dimension must be configured (DIMENSION1_NAME / DIMENSION1_FORMULA)"
                .into(),
        ));
    }
    Ok(dimensions)
}
