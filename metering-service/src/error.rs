use service_core::error::AppError;
use service_core::http::Retryable;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Transport failure, 5xx or 429. Retried before surfacing.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-retryable status or a malformed response body.
    #[error("API error: {0}")]
    Api(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No valid dimension data after applying custom dimensions")]
    NoValidDimensionData,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Usage source error: {0}")]
    UsageSource(String),

    #[error("Latest complete usage month is unavailable")]
    UsageSourceUnavailable,
}

impl Retryable for MeteringError {
    fn is_retryable(&self) -> bool {
        matches!(self, MeteringError::Network(_))
    }
}

impl From<AppError> for MeteringError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ConfigError(e) => MeteringError::Configuration(e.to_string()),
            other => MeteringError::Persistence(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for MeteringError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_retryable() {
            MeteringError::Network(err.to_string())
        } else {
            MeteringError::Api(err.to_string())
        }
    }
}
