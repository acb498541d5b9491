//! Metrics module for metering-service.
//! Prometheus counters for export cycles, submissions and usage records,
//! exported through the node-exporter textfile collector after each cycle.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_int_counter_vec, Encoder, Histogram,
    IntCounterVec, TextEncoder,
};
use service_core::error::AppError;
use std::path::Path;
use std::sync::OnceLock;

/// Wall time of one export cycle
pub static CYCLE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "metering_cycle_duration_seconds",
        "Duration of one export cycle",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ))
    .expect("Failed to register CYCLE_DURATION")
});

/// Export cycles by outcome
pub static CYCLES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-contract submissions by phase and outcome
pub static SUBMISSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Raw usage records by outcome
pub static USAGE_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Custom dimension formula failures
pub static FORMULA_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    CYCLES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_cycles_total", "Total export cycles by outcome"),
            &["outcome"]
        )
        .expect("Failed to register CYCLES_TOTAL")
    });

    SUBMISSIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_submissions_total",
                "Total contract submissions by phase and outcome"
            ),
            &["phase", "outcome"]
        )
        .expect("Failed to register SUBMISSIONS_TOTAL")
    });

    USAGE_RECORDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_records_total",
                "Total raw usage records by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register USAGE_RECORDS_TOTAL")
    });

    FORMULA_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_formula_failures_total",
                "Total custom dimension evaluation failures"
            ),
            &["dimension"]
        )
        .expect("Failed to register FORMULA_FAILURES_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*CYCLE_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> Result<String, AppError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Metrics are not UTF-8: {}", e)))
}

/// Write the current exposition to `path` for the textfile collector.
///
/// Writes a sibling temp file and renames it so scrapes never see a partial file.
pub async fn write_textfile(path: &Path) -> Result<(), AppError> {
    let body = get_metrics()?;
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Record a finished cycle.
pub fn record_cycle(outcome: &str, duration_secs: f64) {
    if let Some(counter) = CYCLES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
        CYCLE_DURATION.observe(duration_secs);
    }
}

/// Record a contract submission.
pub fn record_submission(phase: &str, outcome: &str) {
    if let Some(counter) = SUBMISSIONS_TOTAL.get() {
        counter.with_label_values(&[phase, outcome]).inc();
    }
}

/// Record raw usage records.
pub fn record_usage_records(outcome: &str, count: u64) {
    if let Some(counter) = USAGE_RECORDS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc_by(count);
    }
}

/// Record a formula failure.
pub fn record_formula_failure(dimension: &str) {
    if let Some(counter) = FORMULA_FAILURES_TOTAL.get() {
        counter.with_label_values(&[dimension]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_textfile_contains_registered_metrics() {
        init_metrics();
        record_cycle("processed", 1.5);
        record_submission("new", "success");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metering.prom");
        write_textfile(&path).await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("metering_cycles_total"));
        assert!(body.contains("metering_submissions_total"));
        assert!(!path.with_extension("prom.tmp").exists());
    }
}
