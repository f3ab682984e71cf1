//! The Alert Manager (spec component C10): periodic rule evaluation over the
//! Metrics Store, alert dedup and cooldown-based auto-resolve.
//!
//! Shaped after the corpus's invariant-definition builder
//! (`invariant/types.rs`'s `InvariantDefinition`) generalized from "one gate
//! check per task" to "one rule evaluated on a tick against an aggregated
//! metric window".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fabric_db::models::{Alert, AlertSeverity, MetricKind};
use fabric_db::queries::alerts as alerts_db;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::{MetricFilter, MetricsStore, Reducer};

/// Comparator an [`AlertRule`]'s predicate applies to the latest bucket
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Equal,
}

impl Comparator {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::GreaterThanOrEqual => value >= threshold,
            Self::LessThan => value < threshold,
            Self::LessThanOrEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// A named rule: aggregate a metric window by `reducer`, apply `comparator`
/// against `threshold` to the latest bucket (spec §4.9).
///
/// `name` doubles as the alert's `ruleId`; severity lives on the rule, not
/// on any alert it opens, so editing severity never retroactively changes
/// an alert already in flight.
#[derive(Debug, Clone)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    pub metric_kind: MetricKind,
    pub metric_name: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub window: Duration,
    pub bucket: Duration,
    pub reducer: Reducer,
    pub severity: AlertSeverity,
    pub cooldown: Duration,
    pub filter: MetricFilter,
    pub enabled: bool,
}

impl AlertRule {
    /// Required fields: `name`, the metric to aggregate, and the
    /// threshold test. Everything else defaults to a 5-minute window
    /// reduced by `count` into a single bucket, `Medium` severity, a
    /// 5-minute cooldown, enabled.
    pub fn new(name: impl Into<String>, metric_name: impl Into<String>, comparator: Comparator, threshold: f64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            metric_kind: MetricKind::Performance,
            metric_name: metric_name.into(),
            comparator,
            threshold,
            window: Duration::from_secs(300),
            bucket: Duration::from_secs(300),
            reducer: Reducer::Count,
            severity: AlertSeverity::Medium,
            cooldown: Duration::from_secs(300),
            filter: MetricFilter::default(),
            enabled: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn metric_kind(mut self, kind: MetricKind) -> Self {
        self.metric_kind = kind;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.bucket = window;
        self.window = window;
        self
    }

    pub fn reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn filter(mut self, filter: MetricFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The Alert Manager: owns a rule set, ticks on an interval, and drives
/// alert open/resolve lifecycle against `metrics.db` (spec §4.9).
pub struct AlertManager {
    pool: SqlitePool,
    metrics: Arc<MetricsStore>,
    rules: Vec<AlertRule>,
}

impl AlertManager {
    pub fn new(pool: SqlitePool, metrics: Arc<MetricsStore>, rules: Vec<AlertRule>) -> Self {
        Self { pool, metrics, rules }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Evaluate every enabled rule once. Rule evaluations within a tick are
    /// independent (spec §4.9 "Ordering"); a failure evaluating one rule
    /// does not stop the others.
    pub async fn tick(&self) -> Vec<anyhow::Result<Option<Alert>>> {
        let mut outcomes = Vec::with_capacity(self.rules.len());
        for rule in self.rules.iter().filter(|r| r.enabled) {
            outcomes.push(self.evaluate_rule(rule).await);
        }
        outcomes
    }

    async fn evaluate_rule(&self, rule: &AlertRule) -> anyhow::Result<Option<Alert>> {
        let until = Utc::now();
        let since = until - chrono::Duration::from_std(rule.window).unwrap_or(chrono::Duration::zero());

        let buckets = self
            .metrics
            .aggregate(
                rule.metric_kind,
                &rule.metric_name,
                &rule.filter,
                since,
                until,
                rule.bucket,
                rule.reducer,
            )
            .await?;

        let latest_value = buckets.last().map(|(_, v)| *v).unwrap_or(0.0);
        let predicate_holds = rule.comparator.holds(latest_value, rule.threshold);

        let active = alerts_db::find_active_for_rule(&self.pool, &rule.name).await?;

        match (predicate_holds, active) {
            (true, Some(existing)) => {
                alerts_db::touch(&self.pool, existing.id, until).await?;
                Ok(None)
            }
            (true, None) => {
                let alert = alerts_db::open(
                    &self.pool,
                    alerts_db::NewAlert {
                        id: Uuid::new_v4(),
                        rule_name: &rule.name,
                        severity: rule.severity,
                        message: if rule.description.is_empty() {
                            format!("{} breached threshold {}", rule.metric_name, rule.threshold)
                        } else {
                            rule.description.clone()
                        },
                        opened_at: until,
                    },
                )
                .await?;
                Ok(Some(alert))
            }
            (false, Some(existing)) => {
                let age = (until - existing.last_seen_at).to_std().unwrap_or(Duration::ZERO);
                if age >= rule.cooldown {
                    alerts_db::resolve(&self.pool, existing.id, until).await?;
                }
                Ok(None)
            }
            (false, None) => Ok(None),
        }
    }

    /// Acknowledge an alert by id. Idempotent: acking an already-resolved
    /// or already-acknowledged alert affects zero rows (spec §8
    /// "Idempotence").
    pub async fn acknowledge(&self, id: Uuid) -> anyhow::Result<u64> {
        alerts_db::acknowledge(&self.pool, id).await
    }

    /// Resolve an alert by id, whether from an operator action or the
    /// cooldown path inside [`Self::evaluate_rule`].
    pub async fn resolve(&self, id: Uuid) -> anyhow::Result<u64> {
        alerts_db::resolve(&self.pool, id, Utc::now()).await
    }

    pub async fn active_alerts(&self) -> anyhow::Result<Vec<Alert>> {
        alerts_db::list_active(&self.pool).await
    }

    /// Spawn a background task that calls [`Self::tick`] on `interval`
    /// until the returned handle is aborted.
    pub fn spawn_ticker(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for outcome in self.tick().await {
                    if let Err(err) = outcome {
                        tracing::warn!(error = %err, "alert rule evaluation failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_test_utils::create_test_store;

    async fn manager(rules: Vec<AlertRule>) -> (AlertManager, fabric_test_utils::TestStore) {
        let store = create_test_store().await.unwrap();
        let metrics = Arc::new(MetricsStore::new(store.pool.clone(), 64, Duration::from_secs(1)));
        let manager = AlertManager::new(store.pool.clone(), metrics, rules);
        (manager, store)
    }

    #[tokio::test]
    async fn opens_alert_when_predicate_holds() {
        let rule = AlertRule::new("high_failure_rate", "task_failures", Comparator::GreaterThan, 0.0)
            .reducer(Reducer::Sum)
            .window(Duration::from_secs(60));
        let (manager, _guard) = manager(vec![rule]).await;

        manager
            .metrics
            .append(MetricKind::Performance, "task_failures", 1.0, serde_json::json!({}))
            .await
            .unwrap();

        let outcomes = manager.tick().await;
        assert_eq!(outcomes.len(), 1);
        let opened = outcomes.into_iter().next().unwrap().unwrap();
        assert!(opened.is_some());

        let active = manager.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn dedups_to_one_active_alert_per_rule() {
        let rule = AlertRule::new("high_failure_rate", "task_failures", Comparator::GreaterThan, 0.0)
            .reducer(Reducer::Sum)
            .window(Duration::from_secs(60));
        let (manager, _guard) = manager(vec![rule]).await;

        manager
            .metrics
            .append(MetricKind::Performance, "task_failures", 1.0, serde_json::json!({}))
            .await
            .unwrap();

        manager.tick().await;
        manager.tick().await;
        manager.tick().await;

        let active = manager.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn does_not_resolve_before_cooldown_elapses() {
        let rule = AlertRule::new("high_failure_rate", "task_failures", Comparator::GreaterThan, 0.0)
            .reducer(Reducer::Sum)
            .window(Duration::from_millis(50))
            .cooldown(Duration::from_secs(3600));
        let (manager, _guard) = manager(vec![rule]).await;

        manager
            .metrics
            .append(MetricKind::Performance, "task_failures", 1.0, serde_json::json!({}))
            .await
            .unwrap();
        manager.tick().await;

        // The sample ages out of the (short) window, so the predicate now
        // reads false, but the hour-long cooldown hasn't elapsed yet: the
        // alert must stay Active rather than auto-resolve.
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.tick().await;

        let active = manager.active_alerts().await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn resolves_once_predicate_false_and_cooldown_elapsed() {
        let rule = AlertRule::new("high_failure_rate", "task_failures", Comparator::GreaterThan, 0.0)
            .reducer(Reducer::Sum)
            .window(Duration::from_millis(50))
            .cooldown(Duration::from_millis(10));
        let (manager, _guard) = manager(vec![rule]).await;

        manager
            .metrics
            .append(MetricKind::Performance, "task_failures", 1.0, serde_json::json!({}))
            .await
            .unwrap();
        manager.tick().await;
        assert_eq!(manager.active_alerts().await.unwrap().len(), 1);

        // Once the sample ages out of the window the predicate reads false;
        // the cooldown (10ms) has long since elapsed since the alert was
        // last seen active, so the next tick resolves it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.tick().await;

        assert!(manager.active_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_then_resolve_is_idempotent() {
        let rule = AlertRule::new("high_failure_rate", "task_failures", Comparator::GreaterThan, 0.0)
            .reducer(Reducer::Sum)
            .window(Duration::from_secs(60));
        let (manager, _guard) = manager(vec![rule]).await;
        manager
            .metrics
            .append(MetricKind::Performance, "task_failures", 1.0, serde_json::json!({}))
            .await
            .unwrap();
        manager.tick().await;
        let active = manager.active_alerts().await.unwrap();
        let id = active[0].id;

        assert_eq!(manager.acknowledge(id).await.unwrap(), 1);
        assert_eq!(manager.acknowledge(id).await.unwrap(), 0);

        assert_eq!(manager.resolve(id).await.unwrap(), 1);
        assert_eq!(manager.resolve(id).await.unwrap(), 0);
    }
}
