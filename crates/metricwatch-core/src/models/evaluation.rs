//! Evaluation results

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::criterion::{Aggregator, Comparator, Criterion, TimeUnit};
use super::filter::DimensionFilter;

/// Key of the single group evaluated when a rule has no group-by
pub const UNGROUPED_KEY: &str = "*";

/// Explicit evaluation range supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    /// Earliest instant the caller wants covered
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// End of the evaluation
    pub end: DateTime<Utc>,
}

/// Half-open `[start, end)` window evaluated for one criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Where the query starts reading. Earlier than `start` for aggregations
    /// that difference against the preceding bucket.
    pub lookback: DateTime<Utc>,
}

impl TimeWindow {
    /// Window length
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Value and threshold outcome of one group for one criterion
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroupResult {
    pub value: Option<f64>,
    pub trigger: bool,
    pub warn: bool,
}

impl GroupResult {
    /// A group with no data in the window
    pub fn no_data() -> Self {
        Self {
            value: None,
            trigger: false,
            warn: false,
        }
    }

    pub fn is_no_data(&self) -> bool {
        self.value.is_none()
    }

    /// Whether the group fires, warns or has no data
    pub fn is_interesting(&self) -> bool {
        self.trigger || self.warn || self.is_no_data()
    }
}

/// Outcome of one criterion for one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub agg_type: Aggregator,
    /// Metric display name
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_comparator: Option<Comparator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_threshold: Option<Vec<f64>>,
    pub time_size: u32,
    pub time_unit: TimeUnit,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_filter: Vec<DimensionFilter>,

    /// Aggregated value, None when the group had no data
    pub current_value: Option<f64>,
    /// End of the evaluated window, RFC 3339 with milliseconds
    pub timestamp: String,
    pub should_fire: bool,
    pub should_warn: bool,
    pub is_no_data: bool,
}

impl Evaluation {
    /// Build the evaluation of `result` under `criterion` for a window ending at `end`
    pub fn new(
        criterion: &Criterion,
        document_count_label: &str,
        result: GroupResult,
        end: DateTime<Utc>,
    ) -> Self {
        let is_no_data = result.is_no_data();
        Self {
            agg_type: criterion.agg_type,
            metric: criterion
                .metric
                .clone()
                .unwrap_or_else(|| document_count_label.to_string()),
            comparator: criterion.comparator,
            threshold: criterion.threshold.clone(),
            warning_comparator: criterion.warning_comparator,
            warning_threshold: criterion.warning_threshold.clone(),
            time_size: criterion.time_size,
            time_unit: criterion.time_unit,
            metric_filter: criterion.metric_filter.clone(),
            current_value: result.value,
            timestamp: end.to_rfc3339_opts(SecondsFormat::Millis, true),
            should_fire: result.trigger && !is_no_data,
            should_warn: result.warn && !is_no_data,
            is_no_data,
        }
    }
}
