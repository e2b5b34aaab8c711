//! Time-series store access for Metricwatch
//!
//! The evaluator talks to the store through [`MetricStore`]; the
//! PostgreSQL/TimescaleDB adapter lives in [`postgres`].

mod postgres;

pub use postgres::{PostgresMetricStore, PostgresPool};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Aggregator, DimensionFilter, ThresholdCheck, TimeWindow};

/// One grouped, filtered, bucketed aggregation request
#[derive(Debug, Clone, PartialEq)]
pub struct GroupQuery {
    /// Table (or index pattern) holding the metric documents
    pub metric_alias: String,
    pub aggregation: Aggregator,
    pub metric: Option<String>,
    /// Group-by fields; empty for an ungrouped query
    pub group_by: Vec<String>,
    /// Rule filter and criterion filter, ANDed
    pub filters: Vec<DimensionFilter>,
    pub window: TimeWindow,
    /// Start of the preceding bucket when disappeared groups must be detected
    pub previous_period_start: Option<DateTime<Utc>>,
    /// Alert threshold, for stores that evaluate it in the query
    pub trigger: ThresholdCheck,
    /// Warning threshold, for stores that evaluate it in the query
    pub warn: Option<ThresholdCheck>,
    /// Maximum groups per page
    pub page_size: usize,
}

impl GroupQuery {
    /// Earliest instant the query reads
    pub fn query_start(&self) -> DateTime<Utc> {
        match self.previous_period_start {
            Some(previous) => previous.min(self.window.lookback),
            None => self.window.lookback,
        }
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }
}

/// Aggregated data for one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBucket {
    /// Group-by values, in group-by order; empty for an ungrouped query
    pub key: Vec<String>,
    /// Documents inside the evaluated window
    pub doc_count: u64,
    /// Documents before the window (preceding bucket / lookback)
    pub previous_doc_count: u64,
    /// Aggregated value over the window
    pub value: Option<f64>,
    /// Alert comparison evaluated by the store, when supported
    pub should_trigger: Option<bool>,
    /// Warning comparison evaluated by the store, when supported
    pub should_warn: Option<bool>,
}

/// One page of groups
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupPage {
    pub buckets: Vec<GroupBucket>,
    /// Cursor for the next page; None when this was the last one
    pub after_key: Option<String>,
}

/// A time-series store that can answer grouped aggregation queries
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Fetch the page of groups following `after_key`
    async fn query_groups(&self, query: &GroupQuery, after_key: Option<&str>) -> Result<GroupPage>;
}
