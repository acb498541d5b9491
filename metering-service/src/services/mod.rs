pub mod billing;
pub mod formula;
pub mod metrics;
pub mod state_store;
pub mod storage;
pub mod usage_source;

pub use billing::{AccessToken, BillingApi, ClazarClient};
pub use formula::{Formula, FormulaError};
pub use metrics::{get_metrics, init_metrics, write_textfile};
pub use state_store::{ObjectStateBackend, ProcessingStateStore, StateBackend};
pub use storage::{LocalStorage, MemoryStorage, S3Storage, Storage};
pub use usage_source::{ObjectStoreUsageSource, UsageSource};
