//! service-core: Shared infrastructure for the metering workspace.
pub mod config;
pub mod error;
pub mod http;
pub mod observability;

pub use serde;
pub use serde_json;
pub use tokio;
pub use tracing;
