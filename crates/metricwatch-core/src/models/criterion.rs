//! Rule and criterion definitions

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::filter::{parse_filter_query, DimensionFilter};
use crate::error::{Error, Result};

/// Aggregation applied to a metric inside one time bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregator {
    /// Mean of the metric values
    Avg,
    /// Largest value
    Max,
    /// Smallest value
    Min,
    /// Sum of values
    Sum,
    /// Number of distinct values
    Cardinality,
    /// Per-second increase of a monotonic counter
    Rate,
    /// Number of matching documents
    Count,
    /// 95th percentile
    P95,
    /// 99th percentile
    P99,
}

impl Aggregator {
    /// Whether the query needs one extra bucket of data before the window
    /// to compute a difference.
    pub fn needs_lookback(self) -> bool {
        matches!(self, Self::Rate)
    }

    /// Percentile rank for percentile aggregations
    pub fn percentile(self) -> Option<f64> {
        match self {
            Self::P95 => Some(0.95),
            Self::P99 => Some(0.99),
            _ => None,
        }
    }

    /// Whether this aggregation reads a metric field (everything but `count`)
    pub fn requires_metric(self) -> bool {
        !matches!(self, Self::Count)
    }
}

impl std::fmt::Display for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Cardinality => "cardinality",
            Self::Rate => "rate",
            Self::Count => "count",
            Self::P95 => "p95",
            Self::P99 => "p99",
        };
        f.write_str(name)
    }
}

/// Threshold comparator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    /// Greater than
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal to
    #[serde(rename = ">=")]
    Gte,
    /// Less than
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal to
    #[serde(rename = "<=")]
    Lte,
    /// Inside the closed range `[a, b]`
    #[serde(rename = "between")]
    Between,
    /// Outside the closed range `[a, b]`
    #[serde(rename = "outside")]
    Outside,
}

impl Comparator {
    /// Number of threshold values this comparator consumes
    pub fn arity(self) -> usize {
        match self {
            Self::Between | Self::Outside => 2,
            _ => 1,
        }
    }

    /// Check a value against the thresholds. Thresholds are assumed to have
    /// been validated against [`Comparator::arity`].
    pub fn matches(self, value: f64, threshold: &[f64]) -> bool {
        match (self, threshold) {
            (Self::Gt, [t, ..]) => value > *t,
            (Self::Gte, [t, ..]) => value >= *t,
            (Self::Lt, [t, ..]) => value < *t,
            (Self::Lte, [t, ..]) => value <= *t,
            (Self::Between, [low, high, ..]) => value >= *low && value <= *high,
            (Self::Outside, [low, high, ..]) => value < *low || value > *high,
            _ => false,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Between => "between",
            Self::Outside => "outside",
        };
        f.write_str(symbol)
    }
}

/// A comparator bound to its threshold values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdCheck {
    pub comparator: Comparator,
    pub threshold: Vec<f64>,
}

impl ThresholdCheck {
    /// Check a value against this threshold
    pub fn check(&self, value: f64) -> bool {
        self.comparator.matches(value, &self.threshold)
    }
}

/// Unit of a criterion's time bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "h")]
    Hours,
    #[serde(rename = "d")]
    Days,
}

impl TimeUnit {
    fn millis(self) -> i64 {
        match self {
            Self::Seconds => 1_000,
            Self::Minutes => 60_000,
            Self::Hours => 3_600_000,
            Self::Days => 86_400_000,
        }
    }
}

impl std::fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self {
            Self::Seconds => "s",
            Self::Minutes => "m",
            Self::Hours => "h",
            Self::Days => "d",
        };
        f.write_str(unit)
    }
}

/// One threshold condition within a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    /// Aggregation applied per bucket
    pub agg_type: Aggregator,

    /// Metric name (None for document counts)
    #[serde(default)]
    pub metric: Option<String>,

    /// Comparator for the alert threshold
    pub comparator: Comparator,

    /// Alert threshold value(s)
    pub threshold: Vec<f64>,

    /// Comparator for the warning threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_comparator: Option<Comparator>,

    /// Warning threshold value(s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_threshold: Option<Vec<f64>>,

    /// Bucket size, in `time_unit`s
    pub time_size: u32,

    /// Bucket unit
    pub time_unit: TimeUnit,

    /// Extra filter applied only to this criterion's metric
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_filter: Vec<DimensionFilter>,
}

impl Criterion {
    /// Bucket size as a duration
    pub fn bucket_duration(&self) -> Result<Duration> {
        if self.time_size == 0 {
            return Err(Error::validation(format!(
                "invalid interval {}{}: size must be positive",
                self.time_size, self.time_unit
            )));
        }
        i64::from(self.time_size)
            .checked_mul(self.time_unit.millis())
            .map(Duration::milliseconds)
            .ok_or_else(|| {
                Error::validation(format!(
                    "invalid interval {}{}: too large",
                    self.time_size, self.time_unit
                ))
            })
    }

    /// The alert threshold check
    pub fn trigger_check(&self) -> ThresholdCheck {
        ThresholdCheck {
            comparator: self.comparator,
            threshold: self.threshold.clone(),
        }
    }

    /// The warning threshold check, when configured
    pub fn warn_check(&self) -> Option<ThresholdCheck> {
        match (self.warning_comparator, &self.warning_threshold) {
            (Some(comparator), Some(threshold)) => Some(ThresholdCheck {
                comparator,
                threshold: threshold.clone(),
            }),
            _ => None,
        }
    }

    /// Validate the criterion before any query is built
    pub fn validate(&self) -> Result<()> {
        self.bucket_duration()?;
        validate_threshold("threshold", self.comparator, &self.threshold)?;

        match (self.warning_comparator, &self.warning_threshold) {
            (Some(comparator), Some(threshold)) => {
                validate_threshold("warning_threshold", comparator, threshold)?;
            }
            (None, None) => {}
            _ => {
                return Err(Error::validation(
                    "warning_comparator and warning_threshold must be set together",
                ))
            }
        }

        if self.agg_type.requires_metric()
            && self.metric.as_deref().map_or(true, |m| m.trim().is_empty())
        {
            return Err(Error::validation(format!(
                "aggregation '{}' requires a metric",
                self.agg_type
            )));
        }

        for filter in &self.metric_filter {
            filter.validate()?;
        }

        Ok(())
    }
}

fn validate_threshold(name: &str, comparator: Comparator, threshold: &[f64]) -> Result<()> {
    if threshold.len() != comparator.arity() {
        return Err(Error::validation(format!(
            "{name}: comparator '{comparator}' expects {} value(s), got {}",
            comparator.arity(),
            threshold.len()
        )));
    }
    if let Some(bad) = threshold.iter().find(|t| !t.is_finite()) {
        return Err(Error::validation(format!("{name}: {bad} is not a finite number")));
    }
    Ok(())
}

/// Group-by dimension(s) of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupBy {
    /// Group by one field
    Single(String),
    /// Group by the tuple of several fields
    Multiple(Vec<String>),
}

impl GroupBy {
    /// The group-by fields, skipping blanks
    pub fn fields(&self) -> Vec<String> {
        let fields: Vec<&String> = match self {
            Self::Single(field) => vec![field],
            Self::Multiple(fields) => fields.iter().collect(),
        };
        fields
            .into_iter()
            .filter(|f| !f.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// The parameters of a rule that the evaluator reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedRuleParams {
    /// Threshold conditions, in order
    pub criteria: Vec<Criterion>,

    /// Optional group-by dimension(s)
    #[serde(default)]
    pub group_by: Option<GroupBy>,

    /// Optional filter, a JSON array of dimension filters
    #[serde(default)]
    pub filter_query: Option<String>,
}

impl EvaluatedRuleParams {
    /// Group-by fields; empty when the rule is ungrouped
    pub fn group_fields(&self) -> Vec<String> {
        self.group_by.as_ref().map(GroupBy::fields).unwrap_or_default()
    }

    /// Parsed rule-level filter
    pub fn filters(&self) -> Result<Vec<DimensionFilter>> {
        match self.filter_query.as_deref() {
            Some(query) => parse_filter_query(query),
            None => Ok(Vec::new()),
        }
    }

    /// Validate every criterion and the filter
    pub fn validate(&self) -> Result<()> {
        if self.criteria.is_empty() {
            return Err(Error::validation("rule has no criteria"));
        }
        for (index, criterion) in self.criteria.iter().enumerate() {
            criterion.validate().map_err(|e| match e {
                Error::Validation(msg) => Error::validation(format!("criterion {index}: {msg}")),
                other => other,
            })?;
        }
        self.filters()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn criterion(comparator: Comparator, threshold: Vec<f64>) -> Criterion {
        Criterion {
            agg_type: Aggregator::Avg,
            metric: Some("system.cpu.user.pct".to_string()),
            comparator,
            threshold,
            warning_comparator: None,
            warning_threshold: None,
            time_size: 1,
            time_unit: TimeUnit::Minutes,
            metric_filter: vec![],
        }
    }

    #[rstest]
    #[case(Comparator::Gt, vec![10.0], 10.5, true)]
    #[case(Comparator::Gt, vec![10.0], 10.0, false)]
    #[case(Comparator::Gte, vec![10.0], 10.0, true)]
    #[case(Comparator::Lt, vec![10.0], 9.0, true)]
    #[case(Comparator::Lte, vec![10.0], 10.5, false)]
    #[case(Comparator::Between, vec![1.0, 5.0], 5.0, true)]
    #[case(Comparator::Between, vec![1.0, 5.0], 5.5, false)]
    #[case(Comparator::Outside, vec![1.0, 5.0], 0.5, true)]
    #[case(Comparator::Outside, vec![1.0, 5.0], 1.0, false)]
    fn test_comparator_matches(
        #[case] comparator: Comparator,
        #[case] threshold: Vec<f64>,
        #[case] value: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(comparator.matches(value, &threshold), expected);
    }

    #[test]
    fn test_bucket_duration() {
        let mut c = criterion(Comparator::Gt, vec![1.0]);
        c.time_size = 5;
        assert_eq!(c.bucket_duration().unwrap(), Duration::minutes(5));

        c.time_unit = TimeUnit::Days;
        c.time_size = 2;
        assert_eq!(c.bucket_duration().unwrap(), Duration::days(2));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut c = criterion(Comparator::Gt, vec![1.0]);
        c.time_size = 0;
        assert!(matches!(c.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_between_needs_two_thresholds() {
        let c = criterion(Comparator::Between, vec![1.0]);
        assert!(matches!(c.validate(), Err(Error::Validation(_))));
        assert!(criterion(Comparator::Between, vec![1.0, 2.0]).validate().is_ok());
    }

    #[test]
    fn test_warning_fields_must_be_paired() {
        let mut c = criterion(Comparator::Gt, vec![1.0]);
        c.warning_comparator = Some(Comparator::Gt);
        assert!(c.validate().is_err());

        c.warning_threshold = Some(vec![0.5]);
        assert!(c.validate().is_ok());
        assert!(c.warn_check().unwrap().check(0.7));
    }

    #[test]
    fn test_count_does_not_need_metric() {
        let mut c = criterion(Comparator::Gt, vec![100.0]);
        c.agg_type = Aggregator::Count;
        c.metric = None;
        assert!(c.validate().is_ok());

        c.agg_type = Aggregator::Max;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_deserialize_rule_params() {
        let json = r#"{
            "criteria": [{
                "agg_type": "p95",
                "metric": "latency_ms",
                "comparator": "outside",
                "threshold": [10, 200],
                "time_size": 5,
                "time_unit": "m"
            }],
            "group_by": ["host.name", "service.name"]
        }"#;

        let params: EvaluatedRuleParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.criteria[0].agg_type, Aggregator::P95);
        assert_eq!(params.criteria[0].comparator, Comparator::Outside);
        assert_eq!(params.group_fields(), vec!["host.name", "service.name"]);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_blank_group_by_is_ungrouped() {
        let params = EvaluatedRuleParams {
            criteria: vec![criterion(Comparator::Gt, vec![1.0])],
            group_by: Some(GroupBy::Single(String::new())),
            filter_query: None,
        };
        assert!(params.group_fields().is_empty());
    }

    #[test]
    fn test_empty_rule_is_rejected() {
        let params = EvaluatedRuleParams {
            criteria: vec![],
            group_by: None,
            filter_query: None,
        };
        assert!(matches!(params.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_invalid_criterion_names_its_index_once() {
        let mut bad = criterion(Comparator::Gt, vec![1.0]);
        bad.time_size = 0;
        let params = EvaluatedRuleParams {
            criteria: vec![criterion(Comparator::Gt, vec![1.0]), bad],
            group_by: None,
            filter_query: None,
        };

        let err = params.validate().unwrap_err();
        assert!(matches!(&err, Error::Validation(msg) if msg.starts_with("criterion 1: invalid interval 0m")));
        assert_eq!(err.to_string().matches("Validation error").count(), 1);
    }
}
