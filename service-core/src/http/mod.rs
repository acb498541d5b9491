//! Outbound HTTP helpers shared by service clients.

pub mod retry;

pub use retry::{RetryConfig, Retryable, is_retryable_status, retry_http_call};
