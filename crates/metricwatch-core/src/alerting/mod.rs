//! Threshold rule evaluation
//!
//! Computes evaluation windows, pages grouped aggregates out of the metric
//! store and reports which groups fire, warn or have no data.

mod evaluator;
mod fetcher;
mod outcome;
mod window;

pub use evaluator::{
    evaluate_rule, evaluate_rule_at, EvaluationOptions, RuleEvaluations, DOCUMENT_COUNT_LABEL,
};
pub use fetcher::fetch_group_data;
pub use outcome::{next_missing_groups, summarize_groups, AlertState, GroupOutcome};
pub use window::compute_window;
