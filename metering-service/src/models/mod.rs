pub mod metering;
pub mod month;
pub mod state;
pub mod usage;

pub use metering::{
    MeteringRecord, ResponseOutcome, ResultEntry, SubmissionPayload, SubmissionResponse,
    DEFAULT_ERROR_CODE, RETRY_ERROR_CODE,
};
pub use month::{YearMonth, TIMESTAMP_FORMAT};
pub use state::{ErrorEntry, ServiceState};
pub use usage::{AggregateKey, AggregateValue, UsageRecord};
