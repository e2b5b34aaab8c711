//! # Metricwatch
//!
//! Threshold alerting over grouped time-series metrics.
//!
//! A rule is a list of criteria, each an aggregation over a metric compared
//! against thresholds within a time bucket. Evaluating a rule reports, per
//! criterion, every group that fires, warns or stopped reporting data.
//!
//! ## Architecture
//!
//! - **Alerting**: window computation, paged group fetching and evaluation
//! - **Storage**: the `MetricStore` seam, backed by PostgreSQL/TimescaleDB
//! - **Models**: criteria, filters and evaluation results
//!
//! ## Quick Start
//!
//! ```bash
//! # Apply the schema
//! metricwatch db migrate
//!
//! # Evaluate a rule once
//! metricwatch evaluate --rule rule.json
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{
        evaluate_rule, evaluate_rule_at, summarize_groups, AlertState, EvaluationOptions,
        GroupOutcome, RuleEvaluations,
    };
    pub use crate::config::Config;
    pub use crate::db::{MetricStore, PostgresMetricStore, PostgresPool};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
