pub mod aggregator;
pub mod month_selector;
pub mod processor;
pub mod transformer;

pub use aggregator::aggregate;
pub use month_selector::{next_month, MonthSelection};
pub use processor::{CycleOutcome, MeteringProcessor};
pub use transformer::transform;
