//! The Metrics Store facade (spec component C9): a channel-fed single
//! writer over `fabric-db`'s `metric_samples` table, plus the in-memory
//! aggregation reducers spec.md §4.8 asks for.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use fabric_db::models::{MetricKind, MetricSample};
use fabric_db::queries::metrics as metrics_db;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The eight reducers `aggregate` supports (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    P50,
    P95,
    P99,
}

/// Conjunctive filter over a metric name and its label set.
#[derive(Debug, Clone, Default)]
pub struct MetricFilter {
    pub labels: BTreeMap<String, String>,
}

impl MetricFilter {
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn matches(&self, sample: &MetricSample) -> bool {
        self.labels.iter().all(|(k, v)| {
            sample
                .labels
                .0
                .get(k)
                .and_then(|value| value.as_str())
                .is_some_and(|s| s == v)
        })
    }
}

struct AppendRequest {
    kind: MetricKind,
    name: String,
    value: f64,
    labels: serde_json::Value,
    recorded_at: DateTime<Utc>,
    ack: oneshot::Sender<anyhow::Result<i64>>,
}

/// Channel-fed, single-writer append store backed by the embedded
/// `metrics.db` (spec §4.8: "single-writer per kind is sufficient;
/// readers are lock-free snapshots").
pub struct MetricsStore {
    pool: SqlitePool,
    tx: mpsc::Sender<AppendRequest>,
    writer: JoinHandle<()>,
    enqueue_timeout: Duration,
    samples_dropped: Arc<AtomicU64>,
}

impl MetricsStore {
    /// Spawn the background writer task and return a handle. `queue_capacity`
    /// bounds the channel; `enqueue_timeout` is the backpressure grace
    /// period before a sample is dropped (spec §4.8).
    pub fn new(pool: SqlitePool, queue_capacity: usize, enqueue_timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<AppendRequest>(queue_capacity.max(1));
        let writer_pool = pool.clone();
        let writer = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let result = metrics_db::insert(
                    &writer_pool,
                    metrics_db::NewMetricSample {
                        kind: req.kind,
                        name: &req.name,
                        value: req.value,
                        labels: req.labels,
                        recorded_at: req.recorded_at,
                    },
                )
                .await;
                let _ = req.ack.send(result);
            }
        });

        Self {
            pool,
            tx,
            writer,
            enqueue_timeout,
            samples_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// How many samples have been dropped due to backpressure (exposed via
    /// `/metrics/system` per spec §6).
    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped.load(Ordering::Relaxed)
    }

    /// Append a sample. Blocks up to `enqueue_timeout` if the writer is
    /// backed up; past that the sample is dropped and the counter bumped.
    pub async fn append(&self, kind: MetricKind, name: impl Into<String>, value: f64, labels: serde_json::Value) -> anyhow::Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let req = AppendRequest {
            kind,
            name: name.into(),
            value,
            labels,
            recorded_at: Utc::now(),
            ack: ack_tx,
        };

        let send_result = tokio::time::timeout(self.enqueue_timeout, self.tx.send(req)).await;
        match send_result {
            Ok(Ok(())) => {}
            _ => {
                self.samples_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        match tokio::time::timeout(self.enqueue_timeout, ack_rx).await {
            Ok(Ok(insert_result)) => insert_result.map(|_| ()),
            _ => {
                self.samples_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Query raw samples of `kind`/`name` within `[since, until]`, applying
    /// `filter`'s label conjunction in-memory (the underlying table only
    /// indexes on kind/name/time).
    pub async fn query(
        &self,
        kind: MetricKind,
        name: &str,
        filter: &MetricFilter,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MetricSample>> {
        let rows = metrics_db::query_range(&self.pool, kind, name, since, until).await?;
        Ok(rows.into_iter().filter(|s| filter.matches(s)).collect())
    }

    /// Bucket `[since, until]` by `bucket` and reduce each non-empty bucket
    /// with `reducer` (spec §4.8: eight reducers, bucketStart ordered
    /// ascending).
    pub async fn aggregate(
        &self,
        kind: MetricKind,
        name: &str,
        filter: &MetricFilter,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        bucket: Duration,
        reducer: Reducer,
    ) -> anyhow::Result<Vec<(DateTime<Utc>, f64)>> {
        let samples = self.query(kind, name, filter, since, until).await?;
        let bucket_secs = bucket.as_secs().max(1) as i64;

        let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for sample in &samples {
            let offset_secs = (sample.recorded_at - since).num_seconds().max(0);
            let bucket_index = offset_secs / bucket_secs;
            buckets.entry(bucket_index).or_default().push(sample.value);
        }

        Ok(buckets
            .into_iter()
            .map(|(index, mut values)| {
                let bucket_start = since + chrono::Duration::seconds(index * bucket_secs);
                let reduced = reduce(&mut values, reducer);
                (bucket_start, reduced)
            })
            .collect())
    }

    /// Remove samples older than `cutoff`, returning the count removed.
    pub async fn compact(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        metrics_db::compact(&self.pool, cutoff).await
    }

    /// Flush and stop the background writer.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.writer.await;
    }
}

fn reduce(values: &mut [f64], reducer: Reducer) -> f64 {
    match reducer {
        Reducer::Count => values.len() as f64,
        Reducer::Sum => values.iter().sum(),
        Reducer::Avg => {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        }
        Reducer::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Reducer::P50 => percentile(values, 0.50),
        Reducer::P95 => percentile(values, 0.95),
        Reducer::P99 => percentile(values, 0.99),
    }
}

/// Nearest-rank percentile over `values`, sorting in place.
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p * values.len() as f64).ceil() as usize).clamp(1, values.len());
    values[rank - 1]
}

/// Zero-valued default timestamp used only by doc examples; never exposed
/// as API surface.
#[allow(dead_code)]
fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().expect("epoch is a valid timestamp")
}
