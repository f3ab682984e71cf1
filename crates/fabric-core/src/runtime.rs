//! The Fabric runtime facade: wires the pieces spec.md §2's data-flow
//! paragraph names for a single Task -- registry selection, the Retry
//! Engine, Evolver notification on failure, and a Monitoring performance
//! sample -- into one call, so that an embedding process doesn't have to
//! re-derive the wiring `fabric-core`'s own tests do by hand.

use std::sync::Arc;
use std::time::Instant as StdInstant;

use fabric_db::models::{ErrorKind, MetricKind};

use crate::evolver::Evolver;
use crate::metrics::MetricsStore;
use crate::registry::ResolverRegistry;
use crate::retry::{self, RetryPolicy};
use crate::task::{ResolveContext, Task, TaskError};

const RESOLVE_LATENCY_METRIC: &str = "task_latency_ms";

/// Ties a [`ResolverRegistry`], a default [`RetryPolicy`], and the optional
/// [`MetricsStore`]/[`Evolver`] collaborators together for single-Task
/// resolution (spec §2: "Task arrives -> Registry selects a Resolver ->
/// Retry Engine drives `resolve` -> on repeated failure the Evolver is
/// notified -> Monitoring records the call").
///
/// Multi-step work goes through [`crate::executor::Executor`] instead; this
/// facade only covers the single-resolver path.
pub struct Fabric {
    registry: Arc<ResolverRegistry>,
    default_policy: RetryPolicy,
    metrics: Option<Arc<MetricsStore>>,
    evolver: Option<Arc<Evolver>>,
}

impl Fabric {
    pub fn new(registry: Arc<ResolverRegistry>, default_policy: RetryPolicy) -> Self {
        Self {
            registry,
            default_policy,
            metrics: None,
            evolver: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_evolver(mut self, evolver: Arc<Evolver>) -> Self {
        self.evolver = Some(evolver);
        self
    }

    /// Resolve `task` by looking up its resolver (by name, latest version)
    /// in the registry and driving it through the Retry Engine with
    /// `policy`, or the Fabric's default policy when `policy` is `None`.
    ///
    /// On a terminal failure this notifies the Evolver (which only acts
    /// once its own threshold/interval preconditions are met, per §4.7) and
    /// always records a performance sample, matching spec §2's data flow
    /// for a single resolver call.
    pub async fn resolve_task(&self, task: Task, policy: Option<&RetryPolicy>, ctx: &ResolveContext) -> Task {
        let name = task.task_type.clone();
        let Some(resolver) = self.registry.get_latest(&name).await else {
            let failed = task.fail(TaskError::new(
                ErrorKind::NotFound,
                format!("no resolver registered for '{name}'"),
            ));
            self.record_performance(&name, false).await;
            return failed;
        };
        let version = resolver.metadata().version;

        let policy = policy.unwrap_or(&self.default_policy);
        let started = StdInstant::now();
        let result = retry::call(resolver, task, ctx, policy).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.record_performance_ms(&name, result.is_success(), elapsed_ms).await;

        if !result.is_success() {
            if let Some(error) = result.error.clone() {
                self.notify_evolver(&name, &version, error, ctx).await;
            }
        }

        result
    }

    async fn notify_evolver(&self, name: &str, version: &semver::Version, error: TaskError, ctx: &ResolveContext) {
        let Some(evolver) = &self.evolver else {
            return;
        };
        if evolver.record_failure(name, version, error).await.is_err() {
            return;
        }
        // The Evolver itself re-checks the threshold/interval/lock
        // preconditions (spec §4.7); calling it on every failure is safe
        // and just a no-op below threshold.
        let _ = evolver.evolve(name, version, ctx).await;
    }

    async fn record_performance_ms(&self, name: &str, success: bool, elapsed_ms: f64) {
        if let Some(metrics) = &self.metrics {
            let _ = metrics
                .append(
                    MetricKind::Performance,
                    RESOLVE_LATENCY_METRIC,
                    elapsed_ms,
                    serde_json::json!({"component": name, "op": "resolve", "success": success}),
                )
                .await;
        }
    }

    async fn record_performance(&self, name: &str, success: bool) {
        self.record_performance_ms(name, success, 0.0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolver::EvolverConfig;
    use crate::resolver::{HealthReport, Resolver, ResolverMetadata};
    use crate::retry::BackoffStrategy;
    use async_trait::async_trait;
    use fabric_test_utils::create_test_store;
    use semver::Version;
    use std::time::Duration;

    struct EchoResolver;

    #[async_trait]
    impl Resolver for EchoResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("echo", Version::new(1, 0, 0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            let text = task.input.get("text").cloned().unwrap_or(serde_json::Value::Null);
            task.succeed(serde_json::json!({"text": text}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    struct AlwaysFailResolver;

    #[async_trait]
    impl Resolver for AlwaysFailResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("bad", Version::new(1, 0, 0))
                .evolution_threshold_failures(2)
                .min_evolution_interval(Duration::from_secs(0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.fail(TaskError::new(ErrorKind::Network, "nope"))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    #[tokio::test]
    async fn unregistered_task_type_is_not_found_and_still_records_a_sample() {
        let store = create_test_store().await.unwrap();
        let registry = Arc::new(ResolverRegistry::new());
        let metrics = Arc::new(MetricsStore::new(store.pool.clone(), 16, Duration::from_secs(1)));
        let fabric = Fabric::new(registry, RetryPolicy::new(1, BackoffStrategy::Constant)).with_metrics(Arc::clone(&metrics));

        let task = Task::new("missing", serde_json::json!({}));
        let done = fabric.resolve_task(task, None, &ResolveContext::new()).await;
        assert_eq!(done.error.unwrap().kind, ErrorKind::NotFound);

        let samples = metrics
            .query(
                MetricKind::Performance,
                RESOLVE_LATENCY_METRIC,
                &crate::metrics::MetricFilter::default(),
                chrono::Utc::now() - chrono::Duration::minutes(1),
                chrono::Utc::now() + chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn successful_resolve_records_a_performance_sample() {
        let store = create_test_store().await.unwrap();
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(EchoResolver)).await.unwrap();
        let metrics = Arc::new(MetricsStore::new(store.pool.clone(), 16, Duration::from_secs(1)));
        let fabric = Fabric::new(registry, RetryPolicy::new(1, BackoffStrategy::Constant)).with_metrics(Arc::clone(&metrics));

        let task = Task::new("echo", serde_json::json!({"text": "hi"}));
        let done = fabric.resolve_task(task, None, &ResolveContext::new()).await;
        assert!(done.is_success());
        assert_eq!(done.result.unwrap()["text"], "hi");

        let samples = metrics
            .query(
                MetricKind::Performance,
                RESOLVE_LATENCY_METRIC,
                &crate::metrics::MetricFilter::default(),
                chrono::Utc::now() - chrono::Duration::minutes(1),
                chrono::Utc::now() + chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.0["success"], true);
    }

    /// Repeated failures routed through the facade notify the Evolver,
    /// which evolves the resolver once its own threshold is met -- without
    /// the caller ever touching `Evolver` directly.
    #[tokio::test]
    async fn repeated_failures_drive_evolution_via_the_facade() {
        struct FixedCandidate;
        #[async_trait]
        impl Resolver for FixedCandidate {
            fn metadata(&self) -> ResolverMetadata {
                ResolverMetadata::new("bad", Version::new(1, 1, 0))
            }
            async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
                task.succeed(serde_json::json!({}))
            }
            async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
                HealthReport::healthy()
            }
        }
        struct StubGenerator {
            registry: Arc<ResolverRegistry>,
        }
        #[async_trait]
        impl Resolver for StubGenerator {
            fn metadata(&self) -> ResolverMetadata {
                ResolverMetadata::new("generator", Version::new(1, 0, 0)).capability("evolve_resolver")
            }
            async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
                // A real generator resolver would call out to produce a new
                // implementation; this stub just registers the
                // already-written candidate the Evolver should verify.
                let _ = self.registry.register(Arc::new(FixedCandidate)).await;
                task.succeed(serde_json::json!({"version": "1.1.0"}))
            }
            async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
                HealthReport::healthy()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(AlwaysFailResolver)).await.unwrap();
        registry
            .register(Arc::new(StubGenerator { registry: Arc::clone(&registry) }))
            .await
            .unwrap();

        let evolver = Arc::new(Evolver::with_persistence(
            Arc::clone(&registry),
            EvolverConfig::default(),
            dir.path().to_owned(),
        ));
        let fabric = Fabric::new(Arc::clone(&registry), RetryPolicy::new(1, BackoffStrategy::Constant)).with_evolver(evolver);

        for _ in 0..2 {
            let task = Task::new("bad", serde_json::json!({}));
            let done = fabric.resolve_task(task, None, &ResolveContext::new()).await;
            assert!(!done.is_success());
        }

        assert_eq!(registry.get_latest("bad").await.unwrap().metadata().version, Version::new(1, 1, 0));

        // The next call to "bad" now resolves against the evolved version.
        let task = Task::new("bad", serde_json::json!({}));
        let done = fabric.resolve_task(task, None, &ResolveContext::new()).await;
        assert!(done.is_success());
    }
}
