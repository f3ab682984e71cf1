//! The Evolver (spec component C8): watches per-resolver failure records
//! and drives the evolve-or-degrade control loop, generalizing the
//! corpus's gate/invariant machinery (bounded, timed verification runs
//! gating an accept/reject decision) from "did this task's worktree pass
//! its checks" to "does this candidate resolver still pass the baseline
//! the current one passes".

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_db::fsstore;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::registry::ResolverRegistry;
use crate::resolver::BaselineReport;
use crate::task::{ResolveContext, Task, TaskError};

/// Capability a generator resolver must advertise to participate in
/// evolution (spec §4.7 step 3).
const GENERATOR_CAPABILITY: &str = "evolve_resolver";

/// One observed resolve failure, appended to a per-resolver rolling ring
/// (spec §9: default window size 256).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub resolver_version: Version,
    pub error: TaskError,
    pub occurred_at: DateTime<Utc>,
}

/// What the generator resolver is expected to return: the version of an
/// already-registered candidate entry for the Evolver to verify and, on
/// success, promote.
#[derive(Debug, Deserialize)]
struct GeneratedCandidate {
    version: Version,
}

/// Outcome of one [`Evolver::evolve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvolutionOutcome {
    /// Preconditions in spec §4.7 weren't all met; nothing was attempted.
    NotEligible,
    /// No resolver advertises `evolve_resolver`; nothing was attempted.
    NoGenerator,
    /// The generator's candidate failed verification; the resolver is
    /// untouched and eligibility backs off by `minEvolutionInterval`.
    Rejected,
    /// The candidate passed verification and is now the registry's latest
    /// version for this name.
    Accepted { version: Version },
    /// The bounded rejection budget was exhausted; the resolver is marked
    /// `degraded` and evolution is halted until an operator clears it.
    HumanInterventionRequested,
}

#[derive(Debug, Clone)]
struct EligibilityState {
    last_evolved_at: Option<DateTime<Utc>>,
    consecutive_rejections: u32,
    human_intervention_requested: bool,
}

impl Default for EligibilityState {
    fn default() -> Self {
        Self {
            last_evolved_at: None,
            consecutive_rejections: 0,
            human_intervention_requested: false,
        }
    }
}

/// Tuning knobs for [`Evolver`], distinct per resolver only insofar as
/// [`crate::resolver::ResolverMetadata`] carries its own threshold/interval
/// -- these are the Evolver's own process-wide limits.
#[derive(Debug, Clone)]
pub struct EvolverConfig {
    pub failure_window_size: usize,
    /// Consecutive rejected candidates before a `HumanInterventionRequested`
    /// circuit break (spec §4.7 step 6's "bounded retry budget").
    pub max_consecutive_rejections: u32,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            failure_window_size: 256,
            max_consecutive_rejections: 3,
        }
    }
}

/// Watches failure records and drives the evolve-or-degrade loop for each
/// resolver name, one per-name lock at a time (spec §5: "Evolver lock:
/// per-resolver-name mutex; no global lock").
pub struct Evolver {
    resolver_registry: Arc<ResolverRegistry>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    eligibility: RwLock<HashMap<String, EligibilityState>>,
    dir: Option<PathBuf>,
    config: EvolverConfig,
}

impl Evolver {
    pub fn new(resolver_registry: Arc<ResolverRegistry>, config: EvolverConfig) -> Self {
        Self {
            resolver_registry,
            locks: RwLock::new(HashMap::new()),
            eligibility: RwLock::new(HashMap::new()),
            dir: None,
            config,
        }
    }

    pub fn with_persistence(resolver_registry: Arc<ResolverRegistry>, config: EvolverConfig, dir: PathBuf) -> Self {
        Self {
            resolver_registry,
            locks: RwLock::new(HashMap::new()),
            eligibility: RwLock::new(HashMap::new()),
            dir: Some(dir),
            config,
        }
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(name) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(name.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    fn ring_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{name}.jsonl")))
    }

    /// Record a resolve failure for `name`. Failure records for a name no
    /// longer present in the registry are discarded (spec §4.7:
    /// "orphaned by unregister").
    pub async fn record_failure(&self, name: &str, version: &Version, error: TaskError) -> anyhow::Result<()> {
        if self.resolver_registry.get(name, version).await.is_none() {
            return Ok(());
        }
        let Some(path) = self.ring_path(name) else {
            return Ok(());
        };
        let record = FailureRecord {
            resolver_version: version.clone(),
            error,
            occurred_at: Utc::now(),
        };
        fsstore::append_ring_line(&path, &record, self.config.failure_window_size).await
    }

    async fn failure_count_in_window(&self, name: &str) -> usize {
        let Some(path) = self.ring_path(name) else {
            return 0;
        };
        fsstore::read_ring_lines::<FailureRecord>(&path)
            .await
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Check spec §4.7's three preconditions and, if met, run the full
    /// evolution flow for `name`@`version`.
    pub async fn evolve(&self, name: &str, version: &Version, ctx: &ResolveContext) -> EvolutionOutcome {
        let lock = self.lock_for(name).await;
        let _guard = lock.lock().await;

        let Some(current) = self.resolver_registry.get(name, version).await else {
            return EvolutionOutcome::NotEligible;
        };
        let meta = current.metadata();
        if meta.degraded {
            return EvolutionOutcome::NotEligible;
        }

        let now = Utc::now();
        {
            let eligibility = self.eligibility.read().await;
            if let Some(state) = eligibility.get(name) {
                if state.human_intervention_requested {
                    return EvolutionOutcome::NotEligible;
                }
                if let Some(last) = state.last_evolved_at {
                    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                    if elapsed < meta.min_evolution_interval {
                        return EvolutionOutcome::NotEligible;
                    }
                }
            }
        }

        let failures = self.failure_count_in_window(name).await;
        if (failures as u32) < meta.evolution_threshold_failures {
            return EvolutionOutcome::NotEligible;
        }

        let generators = self.resolver_registry.find_by_capability(GENERATOR_CAPABILITY).await;
        let Some(generator) = generators.first() else {
            return EvolutionOutcome::NoGenerator;
        };

        let baseline = current.run_baseline_tests(&ctx.child()).await;

        let failure_window_path = self.ring_path(name);
        let failure_window: Vec<FailureRecord> = match &failure_window_path {
            Some(path) => fsstore::read_ring_lines(path).await.unwrap_or_default(),
            None => Vec::new(),
        };

        let generation_task = Task::new(
            "evolve_resolver",
            serde_json::json!({
                "resolver_name": name,
                "current_version": version.to_string(),
                "failure_window": failure_window,
            }),
        );
        let generated = generator.resolve(generation_task, &ctx.child()).await;
        if !generated.is_success() {
            return self.reject(name, version).await;
        }
        let Some(result) = generated.result else {
            return self.reject(name, version).await;
        };
        let Ok(candidate_info) = serde_json::from_value::<GeneratedCandidate>(result) else {
            return self.reject(name, version).await;
        };

        let Some(candidate) = self.resolver_registry.get(name, &candidate_info.version).await else {
            return self.reject(name, version).await;
        };

        let candidate_baseline = candidate.run_baseline_tests(&ctx.child()).await;
        if !verifies_against_baseline(&baseline, &candidate_baseline) {
            return self.reject(name, version).await;
        }

        let mut eligibility = self.eligibility.write().await;
        let state = eligibility.entry(name.to_owned()).or_default();
        state.last_evolved_at = Some(now);
        state.consecutive_rejections = 0;
        EvolutionOutcome::Accepted { version: candidate_info.version }
    }

    /// Record a rejected evolution attempt, backing eligibility off by
    /// `minEvolutionInterval` (spec §4.7 step 5), and circuit-break into
    /// `HumanInterventionRequested` once the bounded retry budget (step 6)
    /// is exhausted.
    async fn reject(&self, name: &str, version: &Version) -> EvolutionOutcome {
        let now = Utc::now();
        let mut eligibility = self.eligibility.write().await;
        let state = eligibility.entry(name.to_owned()).or_default();
        state.last_evolved_at = Some(now);
        state.consecutive_rejections += 1;

        if state.consecutive_rejections >= self.config.max_consecutive_rejections {
            state.human_intervention_requested = true;
            drop(eligibility);
            let _ = self.resolver_registry.mark_degraded(name, version).await;
            return EvolutionOutcome::HumanInterventionRequested;
        }
        EvolutionOutcome::Rejected
    }
}

/// A candidate passes verification when it passes every case the current
/// resolver's baseline passed. If the current resolver opts out of
/// baseline testing (`None`), there is nothing to regress against and any
/// candidate verifies; if the current resolver has a baseline but the
/// candidate opts out, verification fails conservatively.
fn verifies_against_baseline(current: &Option<BaselineReport>, candidate: &Option<BaselineReport>) -> bool {
    match (current, candidate) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(current), Some(candidate)) => current
            .cases_passed
            .iter()
            .all(|case| candidate.cases_passed.iter().any(|c| c == case)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{HealthReport, Resolver, ResolverMetadata};
    use crate::task::ResolveContext;
    use async_trait::async_trait;

    struct FlakyV1;

    #[async_trait]
    impl Resolver for FlakyV1 {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("flaky", Version::new(1, 0, 0))
                .evolution_threshold_failures(2)
                .min_evolution_interval(Duration::from_secs(0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.fail(TaskError::new(fabric_db::models::ErrorKind::Network, "flaky"))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }

        async fn run_baseline_tests(&self, _ctx: &ResolveContext) -> Option<BaselineReport> {
            Some(BaselineReport {
                passed: true,
                cases_passed: vec!["basic".to_owned()],
                cases_failed: vec![],
            })
        }
    }

    struct FixedV2;

    #[async_trait]
    impl Resolver for FixedV2 {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("flaky", Version::new(1, 1, 0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.succeed(serde_json::json!({}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }

        async fn run_baseline_tests(&self, _ctx: &ResolveContext) -> Option<BaselineReport> {
            Some(BaselineReport {
                passed: true,
                cases_passed: vec!["basic".to_owned(), "extra".to_owned()],
                cases_failed: vec![],
            })
        }
    }

    struct RegressedV2;

    #[async_trait]
    impl Resolver for RegressedV2 {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("flaky", Version::new(1, 2, 0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.succeed(serde_json::json!({}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }

        async fn run_baseline_tests(&self, _ctx: &ResolveContext) -> Option<BaselineReport> {
            Some(BaselineReport {
                passed: false,
                cases_passed: vec![],
                cases_failed: vec!["basic".to_owned()],
            })
        }
    }

    struct StubGenerator {
        candidate_version: Version,
    }

    #[async_trait]
    impl Resolver for StubGenerator {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("generator", Version::new(1, 0, 0)).capability(GENERATOR_CAPABILITY)
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.succeed(serde_json::json!({"version": self.candidate_version.to_string()}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    async fn seed(candidate: Arc<dyn Resolver>, generator_version: Version) -> (Arc<ResolverRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(FlakyV1)).await.unwrap();
        registry.register(candidate).await.unwrap();
        registry
            .register(Arc::new(StubGenerator { candidate_version: generator_version }))
            .await
            .unwrap();
        (registry, dir)
    }

    #[tokio::test]
    async fn not_eligible_below_failure_threshold() {
        let (registry, dir) = seed(Arc::new(FixedV2), Version::new(1, 1, 0)).await;
        let evolver = Evolver::with_persistence(Arc::clone(&registry), EvolverConfig::default(), dir.path().to_owned());
        let outcome = evolver.evolve("flaky", &Version::new(1, 0, 0), &ResolveContext::new()).await;
        assert_eq!(outcome, EvolutionOutcome::NotEligible);
    }

    #[tokio::test]
    async fn accepts_candidate_that_preserves_baseline() {
        let (registry, dir) = seed(Arc::new(FixedV2), Version::new(1, 1, 0)).await;
        let evolver = Evolver::with_persistence(Arc::clone(&registry), EvolverConfig::default(), dir.path().to_owned());
        let err = TaskError::new(fabric_db::models::ErrorKind::Network, "down");
        for _ in 0..2 {
            evolver.record_failure("flaky", &Version::new(1, 0, 0), err.clone()).await.unwrap();
        }
        let outcome = evolver.evolve("flaky", &Version::new(1, 0, 0), &ResolveContext::new()).await;
        assert_eq!(outcome, EvolutionOutcome::Accepted { version: Version::new(1, 1, 0) });
    }

    #[tokio::test]
    async fn rejects_candidate_that_regresses_baseline() {
        let (registry, dir) = seed(Arc::new(RegressedV2), Version::new(1, 2, 0)).await;
        let evolver = Evolver::with_persistence(Arc::clone(&registry), EvolverConfig::default(), dir.path().to_owned());
        let err = TaskError::new(fabric_db::models::ErrorKind::Network, "down");
        for _ in 0..2 {
            evolver.record_failure("flaky", &Version::new(1, 0, 0), err.clone()).await.unwrap();
        }
        let outcome = evolver.evolve("flaky", &Version::new(1, 0, 0), &ResolveContext::new()).await;
        assert_eq!(outcome, EvolutionOutcome::Rejected);
    }

    #[tokio::test]
    async fn no_generator_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(FlakyV1)).await.unwrap();
        let evolver = Evolver::with_persistence(Arc::clone(&registry), EvolverConfig::default(), dir.path().to_owned());
        let err = TaskError::new(fabric_db::models::ErrorKind::Network, "down");
        for _ in 0..2 {
            evolver.record_failure("flaky", &Version::new(1, 0, 0), err.clone()).await.unwrap();
        }
        let outcome = evolver.evolve("flaky", &Version::new(1, 0, 0), &ResolveContext::new()).await;
        assert_eq!(outcome, EvolutionOutcome::NoGenerator);
    }
}
