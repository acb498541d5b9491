use crate::error::MeteringError;
use crate::models::YearMonth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthSelection {
    Next(YearMonth),
    /// Every month with complete usage data has been processed.
    CaughtUp,
}

/// Picks the single month to process this cycle.
///
/// Resumes after `last_processed`, or at `default_start` on first run, and
/// never moves past the latest month the usage source reports as complete.
pub fn next_month(
    last_processed: Option<YearMonth>,
    source_latest_complete: Option<YearMonth>,
    default_start: YearMonth,
) -> Result<MonthSelection, MeteringError> {
    let latest_complete = source_latest_complete.ok_or(MeteringError::UsageSourceUnavailable)?;

    let candidate = match last_processed {
        Some(last) => last.next(),
        None => default_start,
    };

    if candidate > latest_complete {
        tracing::info!(
            candidate = %candidate,
            latest_complete = %latest_complete,
            "No complete month left to process"
        );
        return Ok(MonthSelection::CaughtUp);
    }

    Ok(MonthSelection::Next(candidate))
}
