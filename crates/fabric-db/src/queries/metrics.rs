use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{MetricKind, MetricSample};

/// Parameters for inserting a new metric sample.
pub struct NewMetricSample<'a> {
    pub kind: MetricKind,
    pub name: &'a str,
    pub value: f64,
    pub labels: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Insert a single metric sample, returning its assigned row id.
pub async fn insert(pool: &SqlitePool, new: NewMetricSample<'_>) -> Result<i64> {
    let labels = serde_json::to_string(&new.labels).context("failed to serialize labels")?;
    let kind_str = new.kind.to_string();
    let rec = sqlx::query(
        r#"
        INSERT INTO metric_samples (kind, name, value, labels, recorded_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(kind_str)
    .bind(new.name)
    .bind(new.value)
    .bind(labels)
    .bind(new.recorded_at)
    .execute(pool)
    .await
    .context("failed to insert metric sample")?;
    Ok(rec.last_insert_rowid())
}

/// Fetch samples of a given kind and name within `[since, until]`, ordered
/// by timestamp ascending.
pub async fn query_range(
    pool: &SqlitePool,
    kind: MetricKind,
    name: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<MetricSample>> {
    let kind_str = kind.to_string();
    let rows = sqlx::query_as::<_, MetricSample>(
        r#"
        SELECT id, kind, name, value, labels, recorded_at
        FROM metric_samples
        WHERE kind = ? AND name = ? AND recorded_at >= ? AND recorded_at <= ?
        ORDER BY recorded_at ASC
        "#,
    )
    .bind(kind_str)
    .bind(name)
    .bind(since)
    .bind(until)
    .fetch_all(pool)
    .await
    .context("failed to query metric samples")?;
    Ok(rows)
}

/// Delete samples recorded before `cutoff`, returning the number removed.
pub async fn compact(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM metric_samples WHERE recorded_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to compact metric samples")?;
    Ok(result.rows_affected())
}
