//! Paged group data retrieval for one criterion

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::window::shift;
use crate::db::{GroupBucket, GroupQuery, MetricStore};
use crate::error::{Error, Result};
use crate::models::{Aggregator, Criterion, DimensionFilter, GroupResult, TimeWindow, UNGROUPED_KEY};

/// Fetch the value and threshold outcome of every group for one criterion.
///
/// Pages through the store `composite_size` groups at a time and returns the
/// merged map. Groups that only had data in the bucket before the window are
/// reported as no-data when `alert_on_group_disappear` is set and a
/// continuation point exists; otherwise they are left out.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_group_data<S: MetricStore + ?Sized>(
    store: &S,
    criterion: &Criterion,
    metric_alias: &str,
    group_by: &[String],
    filters: &[DimensionFilter],
    composite_size: usize,
    alert_on_group_disappear: bool,
    window: TimeWindow,
    last_period_end: Option<DateTime<Utc>>,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, GroupResult>> {
    if composite_size == 0 {
        return Err(Error::validation("composite size must be positive"));
    }

    let previous_period_start = if alert_on_group_disappear && last_period_end.is_some() {
        Some(shift(window.start, -window.duration())?)
    } else {
        None
    };

    let query = GroupQuery {
        metric_alias: metric_alias.to_string(),
        aggregation: criterion.agg_type,
        metric: criterion.metric.clone(),
        group_by: group_by.to_vec(),
        filters: filters
            .iter()
            .chain(criterion.metric_filter.iter())
            .cloned()
            .collect(),
        window,
        previous_period_start,
        trigger: criterion.trigger_check(),
        warn: criterion.warn_check(),
        page_size: composite_size,
    };

    let mut results = BTreeMap::new();
    let mut after_key: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::cancelled("group fetch cancelled"));
            }
            page = store.query_groups(&query, after_key.as_deref()) => page?,
        };
        pages += 1;

        debug!(
            page = pages,
            groups = page.buckets.len(),
            after_key = after_key.as_deref(),
            "Received group page"
        );

        for bucket in page.buckets {
            if let Some((key, result)) = resolve_bucket(&query, alert_on_group_disappear, bucket) {
                results.insert(key, result);
            }
        }

        match page.after_key {
            Some(next) if query.is_grouped() => {
                if after_key.as_deref() == Some(next.as_str()) {
                    return Err(Error::permanent(format!(
                        "store returned the same page cursor '{next}' twice"
                    )));
                }
                after_key = Some(next);
            }
            _ => break,
        }
    }

    debug!(
        aggregation = %criterion.agg_type,
        groups = results.len(),
        pages,
        "Fetched group data"
    );

    Ok(results)
}

/// Turn one store bucket into a group key and result, or None to drop it
fn resolve_bucket(
    query: &GroupQuery,
    alert_on_group_disappear: bool,
    bucket: GroupBucket,
) -> Option<(String, GroupResult)> {
    if !query.is_grouped() {
        return Some((UNGROUPED_KEY.to_string(), group_result(query, &bucket)));
    }

    let key = bucket.key.join(",");

    // the group only has documents before the window: it disappeared
    if bucket.doc_count == 0 {
        let report = alert_on_group_disappear && query.previous_period_start.is_some();
        return report.then(|| (key, GroupResult::no_data()));
    }

    Some((key, group_result(query, &bucket)))
}

fn group_result(query: &GroupQuery, bucket: &GroupBucket) -> GroupResult {
    let value = match query.aggregation {
        Aggregator::Count => Some(bucket.value.unwrap_or(bucket.doc_count as f64)),
        _ => bucket.value,
    };

    let Some(value) = value.filter(|v| v.is_finite()) else {
        return GroupResult::no_data();
    };

    let trigger = bucket
        .should_trigger
        .unwrap_or_else(|| query.trigger.check(value));
    let warn = bucket
        .should_warn
        .unwrap_or_else(|| query.warn.as_ref().is_some_and(|w| w.check(value)));

    GroupResult {
        value: Some(value),
        trigger,
        warn,
    }
}
