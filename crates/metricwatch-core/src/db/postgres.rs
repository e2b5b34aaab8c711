//! PostgreSQL/TimescaleDB connection and grouped metric queries

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use super::{GroupBucket, GroupPage, GroupQuery, MetricStore};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{Aggregator, Comparator, DimensionFilter, FilterOperator, ThresholdCheck};

/// Table names: `name` or `schema.name`
static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid regex")
});

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::permanent(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Metric store backed by a table of `(time, metric, value, dimensions)` rows
#[derive(Clone)]
pub struct PostgresMetricStore {
    pool: PgPool,
}

impl PostgresMetricStore {
    /// Create a store on top of an existing pool
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }
}

#[async_trait]
impl MetricStore for PostgresMetricStore {
    async fn query_groups(&self, query: &GroupQuery, after_key: Option<&str>) -> Result<GroupPage> {
        let mut builder = build_group_query(query, after_key)?;
        let rows = builder.build().fetch_all(&self.pool).await?;

        let buckets = rows
            .iter()
            .map(row_to_bucket)
            .collect::<Result<Vec<_>>>()?;

        // Keyset paging: a full page means there may be more groups after the last key
        let after_key = if query.is_grouped() && rows.len() >= query.page_size {
            rows.last()
                .map(|row| row.try_get::<String, _>("group_key"))
                .transpose()?
        } else {
            None
        };

        debug!(
            table = %query.metric_alias,
            groups = buckets.len(),
            has_more = after_key.is_some(),
            "Fetched group page"
        );

        Ok(GroupPage { buckets, after_key })
    }
}

/// Build the grouped aggregation for one page.
///
/// Every caller-provided value is bound; only the validated table name is
/// spliced into the SQL text.
pub(crate) fn build_group_query<'a>(
    query: &'a GroupQuery,
    after_key: Option<&'a str>,
) -> Result<QueryBuilder<'a, Postgres>> {
    if !TABLE_NAME.is_match(&query.metric_alias) {
        return Err(Error::validation(format!(
            "metric alias '{}' is not a valid table name",
            query.metric_alias
        )));
    }
    if query.page_size == 0 {
        return Err(Error::validation("page size must be positive"));
    }

    let window = &query.window;
    let mut qb: QueryBuilder<'a, Postgres> =
        QueryBuilder::new("SELECT group_key, key_parts, doc_count, previous_doc_count, value, ");
    push_threshold(&mut qb, Some(&query.trigger));
    qb.push(" AS should_trigger, ");
    push_threshold(&mut qb, query.warn.as_ref());
    if query.is_grouped() {
        qb.push(" AS should_warn FROM (SELECT group_key, key_parts, ");
    } else {
        // no GROUP BY, so an empty window still yields one row
        qb.push(" AS should_warn FROM (SELECT NULL::text AS group_key, ARRAY[]::text[] AS key_parts, ");
    }
    qb.push("COUNT(*) FILTER (WHERE \"time\" >= ");
    qb.push_bind(window.start);
    qb.push(") AS doc_count, COUNT(*) FILTER (WHERE \"time\" < ");
    qb.push_bind(window.start);
    qb.push(") AS previous_doc_count, ");
    push_aggregation(&mut qb, query);
    qb.push(" AS value FROM (SELECT ");

    if query.is_grouped() {
        qb.push("concat_ws(','");
        for field in &query.group_by {
            qb.push(", dimensions->>");
            qb.push_bind(field.as_str());
        }
        qb.push(") AS group_key, ARRAY[");
        let mut parts = qb.separated(", ");
        for field in &query.group_by {
            parts.push("dimensions->>");
            parts.push_bind_unseparated(field.as_str());
        }
        qb.push("]::text[] AS key_parts, ");
    }

    qb.push("\"time\", value FROM ");
    qb.push(query.metric_alias.as_str());
    qb.push(" WHERE \"time\" >= ");
    qb.push_bind(query.query_start());
    qb.push(" AND \"time\" < ");
    qb.push_bind(window.end);

    if let Some(metric) = query.metric.as_deref() {
        qb.push(" AND metric = ");
        qb.push_bind(metric);
    }
    for field in &query.group_by {
        qb.push(" AND dimensions->>");
        qb.push_bind(field.as_str());
        qb.push(" IS NOT NULL");
    }
    for filter in &query.filters {
        push_filter(&mut qb, filter);
    }
    qb.push(") AS points");

    if query.is_grouped() {
        if let Some(after) = after_key {
            qb.push(" WHERE group_key > ");
            qb.push_bind(after);
        }
        qb.push(" GROUP BY group_key, key_parts ORDER BY group_key LIMIT ");
        qb.push_bind(i64::try_from(query.page_size).unwrap_or(i64::MAX));
    }

    qb.push(") AS groups ORDER BY group_key");
    Ok(qb)
}

fn push_aggregation<'a>(qb: &mut QueryBuilder<'a, Postgres>, query: &'a GroupQuery) {
    let start = query.window.start;
    match query.aggregation {
        Aggregator::Count => {
            qb.push("(COUNT(*) FILTER (WHERE \"time\" >= ");
            qb.push_bind(start);
            qb.push("))::double precision");
        }
        Aggregator::Cardinality => {
            qb.push("(COUNT(DISTINCT value) FILTER (WHERE \"time\" >= ");
            qb.push_bind(start);
            qb.push("))::double precision");
        }
        Aggregator::Avg | Aggregator::Max | Aggregator::Min | Aggregator::Sum => {
            let function = match query.aggregation {
                Aggregator::Avg => "AVG",
                Aggregator::Max => "MAX",
                Aggregator::Min => "MIN",
                _ => "SUM",
            };
            qb.push(function);
            qb.push("(value) FILTER (WHERE \"time\" >= ");
            qb.push_bind(start);
            qb.push(")");
        }
        Aggregator::P95 | Aggregator::P99 => {
            qb.push("PERCENTILE_CONT(");
            qb.push_bind(query.aggregation.percentile().unwrap_or(0.95));
            qb.push(") WITHIN GROUP (ORDER BY value) FILTER (WHERE \"time\" >= ");
            qb.push_bind(start);
            qb.push(")");
        }
        Aggregator::Rate => {
            // increase of the counter's max against the preceding bucket, per second
            let seconds = query.window.duration().num_milliseconds() as f64 / 1000.0;
            qb.push("(MAX(value) FILTER (WHERE \"time\" >= ");
            qb.push_bind(start);
            qb.push(") - MAX(value) FILTER (WHERE \"time\" < ");
            qb.push_bind(start);
            qb.push(")) / ");
            qb.push_bind(seconds);
        }
    }
}

fn push_threshold<'a>(qb: &mut QueryBuilder<'a, Postgres>, check: Option<&'a ThresholdCheck>) {
    let Some(check) = check else {
        qb.push("NULL::boolean");
        return;
    };

    match (check.comparator, check.threshold.as_slice()) {
        (Comparator::Between, [low, high, ..]) => {
            qb.push("(value BETWEEN ");
            qb.push_bind(*low);
            qb.push(" AND ");
            qb.push_bind(*high);
            qb.push(")");
        }
        (Comparator::Outside, [low, high, ..]) => {
            qb.push("(value < ");
            qb.push_bind(*low);
            qb.push(" OR value > ");
            qb.push_bind(*high);
            qb.push(")");
        }
        (comparator, [threshold, ..]) if comparator.arity() == 1 => {
            qb.push("(value ");
            qb.push(comparator.to_string());
            qb.push(" ");
            qb.push_bind(*threshold);
            qb.push(")");
        }
        // unvalidated threshold: let the fetcher compare locally
        _ => {
            qb.push("NULL::boolean");
        }
    }
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, Postgres>, filter: &'a DimensionFilter) {
    qb.push(" AND ");
    match filter.operator {
        FilterOperator::Eq => {
            qb.push("dimensions->>");
            qb.push_bind(filter.field.as_str());
            qb.push(" = ");
            qb.push_bind(filter.values().into_iter().next().unwrap_or_default());
        }
        FilterOperator::Ne => {
            qb.push("dimensions->>");
            qb.push_bind(filter.field.as_str());
            qb.push(" IS DISTINCT FROM ");
            qb.push_bind(filter.values().into_iter().next().unwrap_or_default());
        }
        FilterOperator::Exists => {
            qb.push("dimensions->>");
            qb.push_bind(filter.field.as_str());
            qb.push(" IS NOT NULL");
        }
        FilterOperator::NotExists => {
            qb.push("dimensions->>");
            qb.push_bind(filter.field.as_str());
            qb.push(" IS NULL");
        }
        FilterOperator::In => {
            qb.push("dimensions->>");
            qb.push_bind(filter.field.as_str());
            qb.push(" = ANY(");
            qb.push_bind(filter.values());
            qb.push(")");
        }
    }
}

fn row_to_bucket(row: &PgRow) -> Result<GroupBucket> {
    let doc_count: i64 = row.try_get("doc_count")?;
    let previous_doc_count: i64 = row.try_get("previous_doc_count")?;

    Ok(GroupBucket {
        key: row.try_get("key_parts")?,
        doc_count: u64::try_from(doc_count).unwrap_or(0),
        previous_doc_count: u64::try_from(previous_doc_count).unwrap_or(0),
        value: row.try_get("value")?,
        should_trigger: row.try_get("should_trigger")?,
        should_warn: row.try_get("should_warn")?,
    })
}
