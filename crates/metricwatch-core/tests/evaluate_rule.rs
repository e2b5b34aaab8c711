//! End-to-end rule evaluation against an in-memory metric store

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use metricwatch::alerting::{
    evaluate_rule_at, next_missing_groups, summarize_groups, AlertState, EvaluationOptions,
};
use metricwatch::config::SourceConfig;
use metricwatch::db::{GroupBucket, GroupPage, GroupQuery, MetricStore};
use metricwatch::models::{
    scalar_text, Aggregator, DimensionFilter, EvaluatedRuleParams, FilterOperator,
};
use metricwatch::Result;

struct Point {
    time: DateTime<Utc>,
    metric: &'static str,
    value: f64,
    dimensions: Vec<(&'static str, &'static str)>,
}

/// Aggregates raw points the way the SQL store does, one page at a time
#[derive(Default)]
struct MemoryStore {
    points: Vec<Point>,
}

impl MemoryStore {
    fn push(&mut self, time: DateTime<Utc>, metric: &'static str, value: f64, dims: &[(&'static str, &'static str)]) {
        self.points.push(Point {
            time,
            metric,
            value,
            dimensions: dims.to_vec(),
        });
    }
}

fn dimension<'a>(point: &'a Point, field: &str) -> Option<&'a str> {
    point
        .dimensions
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, value)| *value)
}

fn passes(point: &Point, filter: &DimensionFilter) -> bool {
    let actual = dimension(point, &filter.field);
    match filter.operator {
        FilterOperator::Eq => actual.map(String::from) == scalar_text(&filter.value),
        FilterOperator::Ne => actual.map(String::from) != scalar_text(&filter.value),
        FilterOperator::Exists => actual.is_some(),
        FilterOperator::NotExists => actual.is_none(),
        FilterOperator::In => actual.is_some_and(|a| filter.values().iter().any(|v| v == a)),
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn query_groups(&self, query: &GroupQuery, after_key: Option<&str>) -> Result<GroupPage> {
        let mut groups: BTreeMap<String, (Vec<String>, Vec<&Point>, u64)> = BTreeMap::new();

        for point in &self.points {
            if point.time < query.query_start() || point.time >= query.window.end {
                continue;
            }
            if query.metric.as_deref().is_some_and(|m| m != point.metric) {
                continue;
            }
            if !query.filters.iter().all(|f| passes(point, f)) {
                continue;
            }
            let Some(key) = query
                .group_by
                .iter()
                .map(|field| dimension(point, field).map(String::from))
                .collect::<Option<Vec<String>>>()
            else {
                continue;
            };

            let entry = groups
                .entry(key.join(","))
                .or_insert_with(|| (key, Vec::new(), 0));
            if point.time >= query.window.start {
                entry.1.push(point);
            } else {
                entry.2 += 1;
            }
        }

        if !query.is_grouped() && groups.is_empty() {
            groups.insert(String::new(), (vec![], vec![], 0));
        }

        let buckets: Vec<(String, GroupBucket)> = groups
            .into_iter()
            .filter(|(key, _)| after_key.map_or(true, |after| key.as_str() > after))
            .take(query.page_size)
            .map(|(group_key, (key, window, previous))| {
                let values = window.iter().map(|p| p.value);
                let value = match query.aggregation {
                    Aggregator::Count => Some(window.len() as f64),
                    Aggregator::Max => values.reduce(f64::max),
                    Aggregator::Avg if !window.is_empty() => {
                        Some(values.sum::<f64>() / window.len() as f64)
                    }
                    _ => None,
                };
                let bucket = GroupBucket {
                    key,
                    doc_count: window.len() as u64,
                    previous_doc_count: previous,
                    value,
                    should_trigger: None,
                    should_warn: None,
                };
                (group_key, bucket)
            })
            .collect();

        let after_key = (query.is_grouped() && buckets.len() == query.page_size)
            .then(|| buckets.last().map(|(key, _)| key.clone()))
            .flatten();

        Ok(GroupPage {
            buckets: buckets.into_iter().map(|(_, bucket)| bucket).collect(),
            after_key,
        })
    }
}

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, second).unwrap()
}

fn rule(json: serde_json::Value) -> EvaluatedRuleParams {
    serde_json::from_value(json).unwrap()
}

fn fleet() -> MemoryStore {
    let mut store = MemoryStore::default();
    for (offset, cpu) in [(10, 1.25), (40, 0.75)] {
        store.push(at(11, 59, offset), "cpu", cpu, &[("host.name", "web-1"), ("env", "prod")]);
    }
    store.push(at(11, 59, 20), "cpu", 0.40, &[("host.name", "web-2"), ("env", "prod")]);
    store.push(at(11, 59, 30), "cpu", 0.99, &[("host.name", "web-3"), ("env", "staging")]);
    // web-4 only reported in the preceding minute
    store.push(at(11, 58, 30), "cpu", 0.50, &[("host.name", "web-4"), ("env", "prod")]);
    for offset in [5, 15, 25] {
        store.push(at(11, 59, offset), "mem", 0.91, &[("host.name", "web-1"), ("env", "prod")]);
    }
    store
}

async fn evaluate(
    store: &MemoryStore,
    params: &EvaluatedRuleParams,
    options: &EvaluationOptions,
) -> metricwatch::alerting::RuleEvaluations {
    evaluate_rule_at(
        store,
        params,
        &SourceConfig::default(),
        options,
        &CancellationToken::new(),
        at(12, 0, 0),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn grouped_average_reports_only_interesting_hosts() {
    let store = fleet();
    let params = rule(serde_json::json!({
        "criteria": [{
            "agg_type": "avg", "metric": "cpu", "comparator": ">", "threshold": [0.9],
            "warning_comparator": ">", "warning_threshold": [0.3],
            "time_size": 1, "time_unit": "m"
        }],
        "group_by": "host.name",
        "filter_query": r#"[{"field": "env", "operator": "eq", "value": "prod"}]"#
    }));
    let options = EvaluationOptions {
        composite_size: 1,
        ..EvaluationOptions::default()
    };

    let result = evaluate(&store, &params, &options).await;

    let keys: Vec<&str> = result[0].keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["web-1", "web-2"]);
    assert_eq!(result[0]["web-1"].current_value, Some(1.0));
    assert!(result[0]["web-1"].should_fire);
    assert!(!result[0]["web-2"].should_fire);
    assert!(result[0]["web-2"].should_warn);
    assert_eq!(result[0]["web-2"].timestamp, "2024-03-01T12:00:00.000Z");
}

#[tokio::test]
async fn continuation_reports_disappeared_group() {
    let store = fleet();
    let params = rule(serde_json::json!({
        "criteria": [{
            "agg_type": "avg", "metric": "cpu", "comparator": ">", "threshold": [0.9],
            "time_size": 1, "time_unit": "m"
        }],
        "group_by": ["host.name"]
    }));
    let options = EvaluationOptions {
        last_period_end: Some(at(11, 59, 0)),
        ..EvaluationOptions::default()
    };

    let result = evaluate(&store, &params, &options).await;
    assert!(result[0]["web-4"].is_no_data);
    assert!(result[0]["web-3"].should_fire);

    let quiet = EvaluationOptions {
        alert_on_group_disappear: false,
        ..options
    };
    let result = evaluate(&store, &params, &quiet).await;
    assert!(!result[0].contains_key("web-4"));
}

#[tokio::test]
async fn multi_criteria_summary_drives_next_cycle() {
    let store = fleet();
    let params = rule(serde_json::json!({
        "criteria": [
            {"agg_type": "max", "metric": "cpu", "comparator": ">", "threshold": [0.9],
             "time_size": 60, "time_unit": "s"},
            {"agg_type": "avg", "metric": "mem", "comparator": "between", "threshold": [0.8, 1.0],
             "time_size": 60, "time_unit": "s"}
        ],
        "group_by": "host.name"
    }));
    let options = EvaluationOptions {
        missing_groups: vec!["web-9".to_string()],
        ..EvaluationOptions::default()
    };

    let result = evaluate(&store, &params, &options).await;
    let groups = summarize_groups(&result);

    let states: Vec<(&str, AlertState)> = groups
        .iter()
        .map(|g| (g.group.as_str(), g.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("web-1", AlertState::Alert),
            ("web-3", AlertState::Ok),
            ("web-9", AlertState::NoData),
        ]
    );
    assert_eq!(next_missing_groups(&groups), vec!["web-1", "web-9"]);
}

#[test]
fn ungrouped_count_over_empty_window_is_zero() {
    let store = MemoryStore::default();
    let params = rule(serde_json::json!({
        "criteria": [{
            "agg_type": "count", "comparator": "<", "threshold": [1],
            "time_size": 5, "time_unit": "m"
        }]
    }));

    let result = tokio_test::block_on(evaluate(&store, &params, &EvaluationOptions::default()));

    let eval = &result[0]["*"];
    assert_eq!(eval.current_value, Some(0.0));
    assert!(eval.should_fire);
    assert!(!eval.is_no_data);
    assert_eq!(eval.metric, "document count");
}

#[tokio::test]
async fn explicit_timeframe_widens_window() {
    let store = fleet();
    let params = rule(serde_json::json!({
        "criteria": [{
            "agg_type": "count", "metric": "cpu", "comparator": ">=", "threshold": [1],
            "time_size": 1, "time_unit": "m"
        }],
        "group_by": "host.name"
    }));
    let options = EvaluationOptions {
        timeframe: Some(metricwatch::models::Timeframe {
            start: Some(at(11, 58, 0)),
            end: at(12, 0, 0),
        }),
        ..EvaluationOptions::default()
    };

    let result = evaluate(&store, &params, &options).await;
    assert_eq!(result[0]["web-4"].current_value, Some(1.0));
    assert_eq!(result[0]["web-1"].current_value, Some(2.0));
    assert_eq!(result[0].len(), 4);
}
