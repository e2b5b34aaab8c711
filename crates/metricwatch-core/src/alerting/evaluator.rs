//! Rule evaluation engine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::fetcher::fetch_group_data;
use super::window::compute_window;
use crate::config::{EvaluationConfig, SourceConfig};
use crate::db::MetricStore;
use crate::error::{Error, Result};
use crate::models::{
    Criterion, DimensionFilter, EvaluatedRuleParams, Evaluation, GroupResult, Timeframe,
};

/// Metric label for criteria that count documents
pub const DOCUMENT_COUNT_LABEL: &str = "document count";

/// Per-criterion evaluations, index-aligned with the rule's criteria
pub type RuleEvaluations = Vec<BTreeMap<String, Evaluation>>;

/// Everything besides the rule itself that shapes one evaluation
#[derive(Debug, Clone)]
pub struct EvaluationOptions {
    /// Groups requested per page
    pub composite_size: usize,
    /// Report groups that stopped sending data as no-data
    pub alert_on_group_disappear: bool,
    /// End of the previous evaluated window, to continue from
    pub last_period_end: Option<DateTime<Utc>>,
    /// Explicit evaluation range
    pub timeframe: Option<Timeframe>,
    /// Groups to report as no-data when the store returns nothing for them
    pub missing_groups: Vec<String>,
    /// Metric label for criteria without a metric
    pub document_count_label: String,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            composite_size: 500,
            alert_on_group_disappear: true,
            last_period_end: None,
            timeframe: None,
            missing_groups: Vec::new(),
            document_count_label: DOCUMENT_COUNT_LABEL.to_string(),
        }
    }
}

impl From<&EvaluationConfig> for EvaluationOptions {
    fn from(config: &EvaluationConfig) -> Self {
        Self {
            composite_size: config.composite_size,
            alert_on_group_disappear: config.alert_on_group_disappear,
            document_count_label: config.document_count_label.clone(),
            ..Self::default()
        }
    }
}

/// Evaluate every criterion of a rule against the store, as of now.
pub async fn evaluate_rule<S: MetricStore + ?Sized>(
    store: &S,
    params: &EvaluatedRuleParams,
    source: &SourceConfig,
    options: &EvaluationOptions,
    cancel: &CancellationToken,
) -> Result<RuleEvaluations> {
    evaluate_rule_at(store, params, source, options, cancel, Utc::now()).await
}

/// Evaluate every criterion of a rule against the store, with `now` as the
/// evaluation time.
///
/// Criteria are fetched concurrently. Each returned map only holds groups
/// that fire, warn or have no data. If any criterion fails the call fails,
/// after every in-flight fetch has settled; cancellation drops the fetches.
pub async fn evaluate_rule_at<S: MetricStore + ?Sized>(
    store: &S,
    params: &EvaluatedRuleParams,
    source: &SourceConfig,
    options: &EvaluationOptions,
    cancel: &CancellationToken,
    now: DateTime<Utc>,
) -> Result<RuleEvaluations> {
    let run_id = Uuid::new_v4();
    let span = info_span!(
        "evaluate_rule",
        %run_id,
        criteria = params.criteria.len(),
        group_by = ?params.group_by,
    );

    async move {
        params.validate()?;
        if options.composite_size == 0 {
            return Err(Error::validation("composite size must be positive"));
        }

        let group_fields = params.group_fields();
        let rule_filters = params.filters()?;
        let (group_by, filters) = (group_fields.as_slice(), rule_filters.as_slice());

        let fetches = params.criteria.iter().enumerate().map(move |(index, criterion)| {
            evaluate_criterion(store, index, criterion, group_by, filters, source, options, cancel, now)
        });

        let settled = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                warn!("Rule evaluation cancelled");
                return Err(Error::cancelled("rule evaluation cancelled"));
            }
            settled = join_all(fetches) => settled,
        };

        let evaluations = settled.into_iter().collect::<Result<RuleEvaluations>>()?;

        let entries = evaluations.iter().flat_map(BTreeMap::values);
        let (firing, warning, no_data) = entries.fold((0, 0, 0), |(f, w, n), e| {
            (
                f + usize::from(e.should_fire),
                w + usize::from(e.should_warn),
                n + usize::from(e.is_no_data),
            )
        });
        info!(firing, warning, no_data, "Rule evaluated");

        Ok(evaluations)
    }
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn evaluate_criterion<S: MetricStore + ?Sized>(
    store: &S,
    index: usize,
    criterion: &Criterion,
    group_by: &[String],
    filters: &[DimensionFilter],
    source: &SourceConfig,
    options: &EvaluationOptions,
    cancel: &CancellationToken,
    now: DateTime<Utc>,
) -> Result<BTreeMap<String, Evaluation>> {
    let bucket = criterion.bucket_duration()?;
    let window = compute_window(
        bucket,
        criterion.agg_type,
        options.timeframe.as_ref(),
        options.last_period_end,
        now,
    )?;

    debug!(
        criterion = index,
        aggregation = %criterion.agg_type,
        start = %window.start,
        end = %window.end,
        "Evaluating criterion"
    );

    let mut current = fetch_group_data(
        store,
        criterion,
        &source.metric_alias,
        group_by,
        filters,
        options.composite_size,
        options.alert_on_group_disappear,
        window,
        options.last_period_end,
        cancel,
    )
    .await
    .map_err(|e| {
        if !e.is_cancellation() {
            warn!(criterion = index, error = %e, "Criterion fetch failed");
        }
        e
    })?;

    for group in &options.missing_groups {
        current
            .entry(group.clone())
            .or_insert_with(GroupResult::no_data);
    }

    Ok(current
        .into_iter()
        .filter(|(_, result)| result.is_interesting())
        .map(|(group, result)| {
            let evaluation =
                Evaluation::new(criterion, &options.document_count_label, result, window.end);
            (group, evaluation)
        })
        .collect())
}
