//! Clazar billing API client.
//!
//! Authenticates with client credentials and submits metering records.
//! Submissions retry transient failures with exponential backoff.

use crate::config::ClazarConfig;
use crate::error::MeteringError;
use crate::models::{MeteringRecord, ResultEntry, SubmissionPayload, SubmissionResponse};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::http::{is_retryable_status, retry_http_call, RetryConfig};

const AUTH_ENDPOINT: &str = "/authenticate/";
const METERING_ENDPOINT: &str = "/metering/";
const DRY_RUN_TOKEN: &str = "dry_run_token";

/// Bearer token returned by [`BillingApi::authenticate`].
#[derive(Clone)]
pub struct AccessToken(Secret<String>);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Secret::new(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

#[async_trait]
pub trait BillingApi: Send + Sync {
    async fn authenticate(&self) -> Result<AccessToken, MeteringError>;
    async fn submit(
        &self,
        token: &AccessToken,
        records: &[MeteringRecord],
    ) -> Result<SubmissionResponse, MeteringError>;
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: Option<String>,
}

#[derive(Clone)]
pub struct ClazarClient {
    client: Client,
    config: ClazarConfig,
    retry: RetryConfig,
}

impl ClazarClient {
    pub fn new(config: ClazarConfig, retry: RetryConfig) -> Result<Self, MeteringError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| {
                MeteringError::Configuration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            config,
            retry,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    async fn post_metering(
        &self,
        token: &AccessToken,
        payload: &SubmissionPayload,
    ) -> Result<SubmissionResponse, MeteringError> {
        let url = format!("{}{}", self.config.api_url, METERING_ENDPOINT);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token.expose())
            .header("accept", "application/json")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        tracing::debug!(status = %status, body = %body, "Clazar metering response");

        if !status.is_success() {
            let message = format!("HTTP {}: {}", status.as_u16(), body);
            return if is_retryable_status(status) {
                Err(MeteringError::Network(message))
            } else {
                Err(MeteringError::Api(message))
            };
        }

        serde_json::from_str::<SubmissionResponse>(&body)
            .map_err(|e| MeteringError::Api(format!("Malformed metering response: {}", e)))
    }
}

#[async_trait]
impl BillingApi for ClazarClient {
    async fn authenticate(&self) -> Result<AccessToken, MeteringError> {
        if self.config.dry_run {
            tracing::info!("Dry run mode: skipping authentication");
            return Ok(AccessToken::new(DRY_RUN_TOKEN));
        }

        let (Some(client_id), Some(client_secret)) =
            (&self.config.client_id, &self.config.client_secret)
        else {
            return Err(MeteringError::Authentication(
                "Client ID and secret are required for authentication".into(),
            ));
        };

        let url = format!("{}{}", self.config.api_url, AUTH_ENDPOINT);
        let request = AuthRequest {
            client_id,
            client_secret: client_secret.expose_secret(),
        };

        tracing::info!("Authenticating with Clazar");
        let response = self
            .client
            .post(&url)
            .header("accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| MeteringError::Authentication(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MeteringError::Authentication(format!("Failed to read body: {}", e)))?;

        if !status.is_success() {
            tracing::error!(status = %status, "Clazar authentication rejected");
            return Err(MeteringError::Authentication(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let token = serde_json::from_str::<AuthResponse>(&body)
            .ok()
            .and_then(|r| r.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                MeteringError::Authentication("No access token in authentication response".into())
            })?;

        tracing::info!("Authenticated with Clazar");
        Ok(AccessToken::new(token))
    }

    async fn submit(
        &self,
        token: &AccessToken,
        records: &[MeteringRecord],
    ) -> Result<SubmissionResponse, MeteringError> {
        if records.is_empty() {
            tracing::warn!("No metering records to submit");
            return Ok(SubmissionResponse::default());
        }

        let payload = SubmissionPayload::new(records.to_vec());

        if self.config.dry_run {
            let body = serde_json::to_string_pretty(&payload).unwrap_or_default();
            tracing::info!(records = records.len(), payload = %body, "Dry run mode: not submitting");
            return Ok(SubmissionResponse {
                results: records
                    .iter()
                    .map(|_| ResultEntry::success("Dry run mode"))
                    .collect(),
            });
        }

        let response = retry_http_call(&self.retry, "clazar_submit", || {
            self.post_metering(token, &payload)
        })
        .await?;

        tracing::info!(
            records = records.len(),
            results = response.results.len(),
            "Submitted metering records to Clazar"
        );
        Ok(response)
    }
}
