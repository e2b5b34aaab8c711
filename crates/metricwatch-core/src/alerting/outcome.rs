//! Per-group alert state across all criteria of a rule

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::Evaluation;

/// Alert state of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// Every criterion in bounds
    #[default]
    Ok,
    /// Every criterion fires
    Alert,
    /// Every criterion warns
    Warning,
    /// At least one criterion had no data
    NoData,
}

impl AlertState {
    /// Whether the group should be tracked into the next evaluation
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ok => "ok",
            Self::Alert => "alert",
            Self::Warning => "warning",
            Self::NoData => "no_data",
        };
        f.write_str(label)
    }
}

/// Combined outcome of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupOutcome {
    /// Group key
    pub group: String,
    /// Combined state
    pub state: AlertState,
    /// Evaluation per criterion, `None` where the criterion had nothing to
    /// report for this group
    pub evaluations: Vec<Option<Evaluation>>,
}

/// Combine per-criterion evaluations into one outcome per group.
///
/// A group fires only when every criterion fires for it, and likewise for
/// warnings. Any no-data criterion makes the whole group no-data.
pub fn summarize_groups(evaluations: &[BTreeMap<String, Evaluation>]) -> Vec<GroupOutcome> {
    let groups: BTreeSet<&String> = evaluations.iter().flat_map(BTreeMap::keys).collect();

    groups
        .into_iter()
        .map(|group| {
            let per_criterion: Vec<Option<Evaluation>> = evaluations
                .iter()
                .map(|criterion| criterion.get(group).cloned())
                .collect();

            let is_no_data = per_criterion.iter().flatten().any(|e| e.is_no_data);
            let all = |pred: fn(&Evaluation) -> bool| {
                !per_criterion.is_empty()
                    && per_criterion.iter().all(|e| e.as_ref().is_some_and(pred))
            };

            let state = if is_no_data {
                AlertState::NoData
            } else if all(|e| e.should_fire) {
                AlertState::Alert
            } else if all(|e| e.should_warn) {
                AlertState::Warning
            } else {
                AlertState::Ok
            };

            GroupOutcome {
                group: group.clone(),
                state,
                evaluations: per_criterion,
            }
        })
        .collect()
}

/// Groups to pass as `missing_groups` on the next evaluation
pub fn next_missing_groups(outcomes: &[GroupOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter(|o| o.state.is_active())
        .map(|o| o.group.clone())
        .collect()
}
