use crate::config::{MeteringConfig, StorageBackend};
use crate::error::MeteringError;
use crate::services::metrics;
use crate::services::{
    BillingApi, ClazarClient, LocalStorage, ObjectStateBackend, ObjectStoreUsageSource,
    ProcessingStateStore, S3Storage, Storage,
};
use crate::workers::{CycleOutcome, MeteringProcessor};
use service_core::http::RetryConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};

pub struct Application {
    config: Arc<MeteringConfig>,
    state: Arc<ProcessingStateStore>,
    billing: Arc<dyn BillingApi>,
    processor: MeteringProcessor,
}

impl Application {
    pub async fn build(config: MeteringConfig) -> Result<Self, MeteringError> {
        let storage = build_storage(&config).await?;
        let retry = RetryConfig::exponential(config.max_retries, config.retry_base_delay);
        let billing: Arc<dyn BillingApi> =
            Arc::new(ClazarClient::new(config.clazar.clone(), retry)?);

        Ok(Self::with_components(config, storage, billing))
    }

    /// Wires the pipeline over an existing storage backend and billing API.
    pub fn with_components(
        config: MeteringConfig,
        storage: Arc<dyn Storage>,
        billing: Arc<dyn BillingApi>,
    ) -> Self {
        let config = Arc::new(config);
        let backend = Arc::new(ObjectStateBackend::new(storage.clone(), &config.identity));
        let state = Arc::new(ProcessingStateStore::new(backend, &config.identity));
        let usage_source = Arc::new(ObjectStoreUsageSource::new(
            storage,
            config.identity.clone(),
        ));

        let processor = MeteringProcessor::new(
            config.clone(),
            usage_source,
            state.clone(),
            billing.clone(),
        );

        Self {
            config,
            state,
            billing,
            processor,
        }
    }

    pub fn processor(&self) -> &MeteringProcessor {
        &self.processor
    }

    pub fn state(&self) -> &ProcessingStateStore {
        &self.state
    }

    pub fn run_once(&self) -> bool {
        self.config.scheduler.run_once
    }

    /// Fails fast on unreadable state or rejected credentials.
    pub async fn preflight(&self) -> Result<(), MeteringError> {
        self.state.validate_access().await?;

        if self.config.clazar.dry_run {
            tracing::info!("Dry run mode: skipping credential check");
        } else {
            self.billing.authenticate().await?;
            tracing::info!("Clazar credentials verified");
        }
        Ok(())
    }

    /// Runs one export cycle and publishes its metrics.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, MeteringError> {
        let started = Instant::now();
        let result = self.processor.process_next_month().await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(outcome) => {
                metrics::record_cycle(outcome.label(), elapsed);
                tracing::info!(outcome = outcome.label(), elapsed_secs = elapsed, "Cycle finished");
            }
            Err(e) => {
                metrics::record_cycle("error", elapsed);
                tracing::error!(error = %e, elapsed_secs = elapsed, "Cycle aborted");
            }
        }

        if let Some(path) = &self.config.scheduler.metrics_textfile_path {
            if let Err(e) = metrics::write_textfile(path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
            }
        }

        result
    }

    /// Runs a cycle on every tick until `shutdown` resolves.
    ///
    /// A tick that comes due while a cycle is running is delayed, and shutdown
    /// is only observed between cycles.
    pub async fn run_until_stopped<S>(self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut ticker = interval(self.config.scheduler.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_secs = self.config.scheduler.interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are logged and counted inside run_cycle.
                    let _ = self.run_cycle().await;
                }
            }
        }
    }
}

async fn build_storage(config: &MeteringConfig) -> Result<Arc<dyn Storage>, MeteringError> {
    match config.storage.backend {
        StorageBackend::Local => {
            let storage = LocalStorage::new(&config.storage.local_path)
                .await
                .map_err(|e| {
                    tracing::error!(
                        "Failed to initialize local storage at {}: {}",
                        config.storage.local_path,
                        e
                    );
                    MeteringError::Configuration(e.to_string())
                })?;
            tracing::info!(path = %config.storage.local_path, "Using local storage");
            Ok(Arc::new(storage))
        }
        StorageBackend::S3 => {
            let missing = |key: &str| MeteringError::Configuration(format!("{} is required for S3 storage", key));
            let region = config.storage.aws_region.clone().ok_or_else(|| missing("AWS_REGION"))?;
            let access_key_id = config
                .storage
                .aws_access_key_id
                .as_deref()
                .ok_or_else(|| missing("AWS_ACCESS_KEY_ID"))?;
            let secret_access_key = config
                .storage
                .aws_secret_access_key
                .as_ref()
                .ok_or_else(|| missing("AWS_SECRET_ACCESS_KEY"))?;

            let storage = S3Storage::connect(
                config.storage.bucket.clone(),
                region,
                access_key_id,
                secret_access_key,
            )
            .await;
            tracing::info!(bucket = %config.storage.bucket, "Using S3 storage");
            Ok(Arc::new(storage))
        }
    }
}
