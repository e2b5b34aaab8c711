//! Evaluation window arithmetic

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::models::{Aggregator, TimeWindow, Timeframe};

/// Compute the `[start, end)` window one criterion is evaluated over.
///
/// A `last_period_end` continues the previous evaluation: the window starts
/// exactly there and spans one bucket, so successive calls tile the timeline
/// without gaps or overlap. Otherwise the window is the last full bucket
/// before `timeframe.end` (or `now`), stretched back to `timeframe.start`
/// when that is earlier.
///
/// Fails with a validation error when the window falls outside the
/// representable date range.
pub fn compute_window(
    bucket: Duration,
    aggregation: Aggregator,
    timeframe: Option<&Timeframe>,
    last_period_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<TimeWindow> {
    let (start, end) = match last_period_end {
        Some(previous_end) => (previous_end, shift(previous_end, bucket)?),
        None => {
            let end = timeframe.map_or(now, |t| t.end);
            let latest = shift(end, -bucket)?;
            let start = match timeframe.and_then(|t| t.start) {
                Some(explicit) if explicit < latest => explicit,
                _ => latest,
            };
            (start, end)
        }
    };

    let lookback = if aggregation.needs_lookback() {
        shift(start, -bucket)?
    } else {
        start
    };

    Ok(TimeWindow {
        start,
        end,
        lookback,
    })
}

/// `at + by`, or a validation error on overflow
pub(crate) fn shift(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(by)
        .ok_or_else(|| Error::validation("evaluation window out of range"))
}
