//! The Mastery Executor (spec component C7): drives a [`MasteryPlan`] to a
//! terminal state, generalizing the corpus's DAG orchestrator (semaphore
//! fan-out, mpsc fan-in, cancellation with a drain grace period) from a
//! flat agent-task DAG to resolver-selector steps.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_db::fsstore;
use fabric_db::models::{ErrorKind, PlanStatus, StepStatus};
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::mastery::{MasteryPlan, OnError, Step};
use crate::registry::ResolverRegistry;
use crate::retry::RetryPolicy;
use crate::task::{ResolveContext, Task, TaskError};

/// Per-step bookkeeping kept for the lifetime of a running (or completed)
/// [`Execution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when a failing step's `OnError::Compensate` policy names this
    /// step as the compensating target (spec §4.6: "Failed, trigger s"). A
    /// compensating step only ever becomes ready once this is set -- never
    /// via ordinary dependency satisfaction.
    #[serde(default)]
    pub triggered: bool,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
            triggered: false,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }
}

/// A complete record of one run of a [`MasteryPlan`], appended to the
/// bounded history ring on terminal status (spec §4.6 "History").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub plan_name: String,
    pub plan_version: Version,
    pub task_id: Uuid,
    pub status: PlanStatus,
    pub steps: HashMap<String, StepRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl Execution {
    /// Final output: the output of every step with no dependents (a sink
    /// in the DAG), merged into one object. Callers that need a single
    /// step's output should index `steps` directly.
    pub fn merged_output(&self, plan: &MasteryPlan) -> serde_json::Value {
        let has_dependent: std::collections::HashSet<&str> = plan
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();
        let mut out = serde_json::Map::new();
        for step in &plan.steps {
            if has_dependent.contains(step.id.as_str()) {
                continue;
            }
            if let Some(record) = self.steps.get(&step.id) {
                if let Some(serde_json::Value::Object(obj)) = &record.output {
                    out.extend(obj.clone());
                }
            }
        }
        serde_json::Value::Object(out)
    }
}

/// Tuning knobs for a single [`Executor::run`] call.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of steps running concurrently.
    pub fanout_limit: usize,
    /// Bounded grace period after cancellation before still-Running steps
    /// are force-marked Cancelled regardless of their own progress (spec
    /// §5 "bounded grace period (default 5s)").
    pub cancel_grace: Duration,
    /// Directory holding one history ring file per plan name, or `None` to
    /// skip persistence (e.g. in unit tests).
    pub history_dir: Option<PathBuf>,
    pub history_ring_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            fanout_limit: 8,
            cancel_grace: Duration::from_secs(5),
            history_dir: None,
            history_ring_size: 200,
        }
    }
}

struct StepDone {
    id: String,
    task: Task,
}

/// Runs [`MasteryPlan`]s against a [`ResolverRegistry`], tracking the step
/// state machine in spec §4.6.
pub struct Executor {
    resolver_registry: Arc<ResolverRegistry>,
    retry_policy: RetryPolicy,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(resolver_registry: Arc<ResolverRegistry>, retry_policy: RetryPolicy, config: ExecutorConfig) -> Self {
        Self {
            resolver_registry,
            retry_policy,
            config,
        }
    }

    /// Drive `plan` to a terminal [`PlanStatus`], starting from
    /// `initial_input`. `task_id` identifies the caller-visible Task this
    /// Mastery run satisfies (used only for the history record).
    pub async fn run(&self, plan: Arc<MasteryPlan>, task_id: Uuid, initial_input: serde_json::Value, ctx: ResolveContext) -> Execution {
        plan.validate().expect("Executor::run requires an already-validated plan");

        let started_at = Utc::now();
        let mut steps: HashMap<String, StepRecord> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::pending()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.fanout_limit.max(1)));
        let (tx, mut rx) = mpsc::channel::<StepDone>(plan.steps.len().max(1));
        let mut in_flight: usize = 0;
        let mut plan_failed = false;
        let mut cancelling = false;
        let cancel_deadline = ctx.deadline;

        loop {
            if !cancelling && ctx.is_cancelled() {
                cancelling = true;
            }

            propagate_skips(&plan, &mut steps);

            if !plan_failed && !cancelling {
                let ready = ready_steps(&plan, &steps);
                for step in ready {
                    steps.get_mut(&step.id).unwrap().status = StepStatus::Running;
                    steps.get_mut(&step.id).unwrap().started_at = Some(Utc::now());
                    in_flight += 1;

                    let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore never closed");
                    let input = bind_step_input(step, &initial_input, &steps);
                    let task = Task::new(step.resolver_name.clone(), input);
                    let resolver_registry = Arc::clone(&self.resolver_registry);
                    let retry_policy = self.retry_policy.clone();
                    let step_ctx = step
                        .timeout
                        .map(|t| ctx.child().with_timeout(t))
                        .unwrap_or_else(|| ctx.child());
                    let tx = tx.clone();
                    let step_id = step.id.clone();
                    let step_name = step.resolver_name.clone();
                    let selector = step.selector.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        let resolved = resolver_registry.resolve_selector(&step_name, &selector).await;
                        let task = match resolved {
                            Some(resolver) => {
                                if step_ctx.is_expired() {
                                    task.fail(TaskError::new(ErrorKind::Timeout, "step deadline already elapsed"))
                                } else {
                                    crate::retry::call(resolver, task, &step_ctx, &retry_policy).await
                                }
                            }
                            None => task.fail(TaskError::new(
                                ErrorKind::NotFound,
                                format!("no resolver registered for '{step_name}'"),
                            )),
                        };
                        let _ = tx.send(StepDone { id: step_id, task }).await;
                    });
                }
            }

            if in_flight == 0 {
                break;
            }

            if cancelling {
                let grace = cancel_deadline
                    .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
                    .unwrap_or(self.config.cancel_grace)
                    .min(self.config.cancel_grace);
                match tokio::time::timeout(grace, rx.recv()).await {
                    Ok(Some(done)) => {
                        in_flight -= 1;
                        apply_step_result(&plan, &mut steps, done, &mut plan_failed);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        // Grace period elapsed: force every still-Running step
                        // to Cancelled regardless of its own progress.
                        for record in steps.values_mut() {
                            if record.status == StepStatus::Running {
                                record.status = StepStatus::Cancelled;
                                record.ended_at = Some(Utc::now());
                            }
                        }
                        break;
                    }
                }
            } else if let Some(done) = rx.recv().await {
                in_flight -= 1;
                apply_step_result(&plan, &mut steps, done, &mut plan_failed);
            } else {
                break;
            }
        }

        let status = if cancelling {
            PlanStatus::Cancelled
        } else if plan_failed {
            PlanStatus::Failed
        } else if steps.values().all(|r| matches!(r.status, StepStatus::Succeeded | StepStatus::Skipped)) {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };

        let execution = Execution {
            plan_name: plan.name.clone(),
            plan_version: plan.version.clone(),
            task_id,
            status,
            steps,
            started_at,
            ended_at: Utc::now(),
        };

        if let Some(dir) = &self.config.history_dir {
            let path = history_path(dir, &plan.name);
            if let Err(e) = fsstore::append_ring_line(&path, &execution, self.config.history_ring_size).await {
                tracing::warn!(plan = %plan.name, error = %e, "failed to persist execution history");
            }
        }

        execution
    }
}

fn history_path(dir: &Path, plan_name: &str) -> PathBuf {
    dir.join(format!("{plan_name}.jsonl"))
}

fn apply_step_result(plan: &MasteryPlan, steps: &mut HashMap<String, StepRecord>, done: StepDone, plan_failed: &mut bool) {
    let step = plan.steps.iter().find(|s| s.id == done.id).expect("step id from this plan");
    let record = steps.get_mut(&done.id).expect("step record initialized for every plan step");
    record.ended_at = Some(Utc::now());

    if done.task.is_success() {
        record.status = StepStatus::Succeeded;
        record.output = done.task.result;
        return;
    }

    if done.task.status == fabric_db::models::TaskStatus::Cancelled {
        record.status = StepStatus::Cancelled;
        return;
    }

    record.error = done.task.error;
    match &step.on_error {
        OnError::Propagate => {
            record.status = StepStatus::Failed;
            *plan_failed = true;
        }
        OnError::SkipOptional => {
            record.status = StepStatus::Skipped;
        }
        OnError::Compensate(compensating_id) => {
            record.status = StepStatus::Failed;
            if let Some(compensate_record) = steps.get_mut(compensating_id) {
                if compensate_record.status == StepStatus::Pending {
                    compensate_record.triggered = true;
                }
            }
        }
    }
}

/// Ids of every step named as an `OnError::Compensate` target somewhere in
/// the plan. These never become ready via ordinary dependency
/// satisfaction -- only once their trigger fails and sets `triggered`.
fn compensation_targets(plan: &MasteryPlan) -> std::collections::HashSet<&str> {
    plan.steps
        .iter()
        .filter_map(|s| match &s.on_error {
            OnError::Compensate(target) => Some(target.as_str()),
            _ => None,
        })
        .collect()
}

/// Steps whose `depends_on` set is fully `Succeeded` and which are still
/// `Pending`. A compensating step (an `OnError::Compensate` target) is
/// ready only once its trigger has explicitly fired (spec §4.6: "Failed,
/// trigger s"), never merely because its own `depends_on` is satisfied.
fn ready_steps<'a>(plan: &'a MasteryPlan, steps: &HashMap<String, StepRecord>) -> Vec<&'a Step> {
    let targets = compensation_targets(plan);
    plan.steps
        .iter()
        .filter(|s| {
            let record = &steps[&s.id];
            if record.status != StepStatus::Pending {
                return false;
            }
            let deps_satisfied = s.depends_on.iter().all(|d| steps[d].status == StepStatus::Succeeded);
            if targets.contains(s.id.as_str()) {
                record.triggered && deps_satisfied
            } else {
                deps_satisfied
            }
        })
        .collect()
}

/// Fixpoint: any `Pending` step with a `Failed` or `Skipped` dependency can
/// never become ready, so mark it `Skipped` rather than hang the plan
/// forever waiting on a dependency that will never succeed. Likewise, a
/// compensating step whose trigger reached a terminal state *without*
/// failing (so it was never triggered, and never will be) can also never
/// become ready, and is skipped the same way.
fn propagate_skips(plan: &MasteryPlan, steps: &mut HashMap<String, StepRecord>) {
    loop {
        let mut changed = false;
        for step in &plan.steps {
            if steps[&step.id].status != StepStatus::Pending {
                continue;
            }
            let blocked = step
                .depends_on
                .iter()
                .any(|d| matches!(steps[d].status, StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled));
            if blocked {
                steps.get_mut(&step.id).unwrap().status = StepStatus::Skipped;
                changed = true;
            }
        }
        for step in &plan.steps {
            let OnError::Compensate(target_id) = &step.on_error else {
                continue;
            };
            let fired_or_pending = matches!(steps[&step.id].status, StepStatus::Failed | StepStatus::Pending | StepStatus::Running);
            if fired_or_pending {
                continue;
            }
            if let Some(target_record) = steps.get_mut(target_id) {
                if target_record.status == StepStatus::Pending && !target_record.triggered {
                    target_record.status = StepStatus::Skipped;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

/// Resolve a step's `input_template` against the initial Mastery input and
/// prior steps' outputs. A string value of the exact form `${initial}` or
/// `${initial.<path>}` / `${steps.<id>}` / `${steps.<id>.<path>}` is
/// replaced wholesale by the referenced value; any other value (including
/// non-matching strings) is passed through unchanged.
fn bind_step_input(step: &Step, initial_input: &serde_json::Value, steps: &HashMap<String, StepRecord>) -> serde_json::Value {
    fn walk(value: &serde_json::Value, initial: &serde_json::Value, steps: &HashMap<String, StepRecord>) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => resolve_reference(s, initial, steps).unwrap_or_else(|| value.clone()),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| walk(v, initial, steps)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), walk(v, initial, steps))).collect(),
            ),
            other => other.clone(),
        }
    }
    walk(&step.input_template, initial_input, steps)
}

fn resolve_reference(s: &str, initial: &serde_json::Value, steps: &HashMap<String, StepRecord>) -> Option<serde_json::Value> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    let mut parts = inner.split('.');
    match parts.next()? {
        "initial" => {
            let rest: Vec<&str> = parts.collect();
            Some(index_path(initial, &rest))
        }
        "steps" => {
            let step_id = parts.next()?;
            let rest: Vec<&str> = parts.collect();
            let output = steps.get(step_id)?.output.clone().unwrap_or(serde_json::Value::Null);
            Some(index_path(&output, &rest))
        }
        _ => None,
    }
}

fn index_path(value: &serde_json::Value, path: &[&str]) -> serde_json::Value {
    let mut current = value;
    for key in path {
        current = current.get(key).unwrap_or(&serde_json::Value::Null);
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mastery::MasteryPlan;
    use crate::resolver::{HealthReport, Resolver, ResolverMetadata};
    use crate::retry::BackoffStrategy;
    use async_trait::async_trait;

    struct EchoNumberResolver {
        name: &'static str,
        field: &'static str,
        value: i64,
        delay: Duration,
    }

    #[async_trait]
    impl Resolver for EchoNumberResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new(self.name, Version::new(1, 0, 0)).output_field(self.field)
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            task.succeed(serde_json::json!({ self.field: self.value }))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    struct MergeResolver;

    #[async_trait]
    impl Resolver for MergeResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("merge", Version::new(1, 0, 0)).output_field("sum")
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            let a = task.input.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
            let b = task.input.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
            task.succeed(serde_json::json!({"sum": a + b}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    struct AlwaysFailResolver;

    #[async_trait]
    impl Resolver for AlwaysFailResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("always_fail", Version::new(1, 0, 0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.fail(TaskError::new(ErrorKind::Network, "nope"))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    struct SleepForeverResolver;

    #[async_trait]
    impl Resolver for SleepForeverResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("sleepy", Version::new(1, 0, 0))
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            tokio::time::sleep(Duration::from_secs(10)).await;
            task.succeed(serde_json::json!({}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    fn no_retry_policy() -> RetryPolicy {
        RetryPolicy::new(1, BackoffStrategy::Constant)
    }

    #[tokio::test]
    async fn fan_out_fan_in_merges_outputs() {
        let registry = Arc::new(ResolverRegistry::new());
        registry
            .register(Arc::new(EchoNumberResolver { name: "a_src", field: "a", value: 1, delay: Duration::ZERO }))
            .await
            .unwrap();
        registry
            .register(Arc::new(EchoNumberResolver { name: "b_src", field: "b", value: 2, delay: Duration::ZERO }))
            .await
            .unwrap();
        registry.register(Arc::new(MergeResolver)).await.unwrap();

        let plan = Arc::new(
            MasteryPlan::new("fanout", Version::new(1, 0, 0))
                .step(Step::new("a", "a_src"))
                .step(Step::new("b", "b_src"))
                .step(
                    Step::new("c", "merge")
                        .depends_on("a")
                        .depends_on("b")
                        .input_template(serde_json::json!({
                            "a": "${steps.a.a}",
                            "b": "${steps.b.b}",
                        })),
                ),
        );

        let executor = Executor::new(registry, no_retry_policy(), ExecutorConfig::default());
        let execution = executor.run(plan.clone(), Uuid::new_v4(), serde_json::json!({}), ResolveContext::new()).await;

        assert_eq!(execution.status, PlanStatus::Completed);
        assert_eq!(execution.steps["c"].output, Some(serde_json::json!({"sum": 3})));
        assert_eq!(execution.merged_output(&plan), serde_json::json!({"sum": 3}));
    }

    #[tokio::test]
    async fn propagate_failure_fails_plan_and_skips_dependents() {
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(AlwaysFailResolver)).await.unwrap();
        registry
            .register(Arc::new(EchoNumberResolver { name: "downstream", field: "x", value: 1, delay: Duration::ZERO }))
            .await
            .unwrap();

        let plan = Arc::new(
            MasteryPlan::new("fails", Version::new(1, 0, 0))
                .step(Step::new("a", "always_fail"))
                .step(Step::new("b", "downstream").depends_on("a")),
        );

        let executor = Executor::new(registry, no_retry_policy(), ExecutorConfig::default());
        let execution = executor.run(plan, Uuid::new_v4(), serde_json::json!({}), ResolveContext::new()).await;

        assert_eq!(execution.status, PlanStatus::Failed);
        assert_eq!(execution.steps["a"].status, StepStatus::Failed);
        assert_eq!(execution.steps["b"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn skip_optional_does_not_fail_plan() {
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(AlwaysFailResolver)).await.unwrap();

        let plan = Arc::new(
            MasteryPlan::new("optional", Version::new(1, 0, 0))
                .step(Step::new("a", "always_fail").on_error(OnError::SkipOptional)),
        );

        let executor = Executor::new(registry, no_retry_policy(), ExecutorConfig::default());
        let execution = executor.run(plan, Uuid::new_v4(), serde_json::json!({}), ResolveContext::new()).await;

        assert_eq!(execution.status, PlanStatus::Completed);
        assert_eq!(execution.steps["a"].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn compensate_runs_the_compensating_step_when_the_trigger_fails() {
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(AlwaysFailResolver)).await.unwrap();
        registry
            .register(Arc::new(EchoNumberResolver { name: "comp", field: "fixed", value: 1, delay: Duration::ZERO }))
            .await
            .unwrap();

        let plan = Arc::new(
            MasteryPlan::new("compensated", Version::new(1, 0, 0))
                .step(Step::new("a", "always_fail").on_error(OnError::Compensate("c".to_owned())))
                .step(Step::new("c", "comp")),
        );

        let executor = Executor::new(registry, no_retry_policy(), ExecutorConfig::default());
        let execution = executor.run(plan, Uuid::new_v4(), serde_json::json!({}), ResolveContext::new()).await;

        assert_eq!(execution.steps["a"].status, StepStatus::Failed);
        assert_eq!(execution.steps["c"].status, StepStatus::Succeeded);
        assert_eq!(execution.steps["c"].output, Some(serde_json::json!({"fixed": 1})));
        // The trigger itself ends Failed, so the plan as a whole is not
        // Completed even though the compensating step succeeded.
        assert_eq!(execution.status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn compensate_skips_the_compensating_step_when_the_trigger_succeeds() {
        let registry = Arc::new(ResolverRegistry::new());
        registry
            .register(Arc::new(EchoNumberResolver { name: "a_src", field: "a", value: 1, delay: Duration::ZERO }))
            .await
            .unwrap();
        registry.register(Arc::new(AlwaysFailResolver)).await.unwrap();

        let plan = Arc::new(
            MasteryPlan::new("not_compensated", Version::new(1, 0, 0))
                .step(Step::new("a", "a_src").on_error(OnError::Compensate("c".to_owned())))
                .step(Step::new("c", "always_fail")),
        );

        let executor = Executor::new(registry, no_retry_policy(), ExecutorConfig::default());
        let execution = executor.run(plan, Uuid::new_v4(), serde_json::json!({}), ResolveContext::new()).await;

        assert_eq!(execution.steps["a"].status, StepStatus::Succeeded);
        assert_eq!(execution.steps["c"].status, StepStatus::Skipped);
        assert_eq!(execution.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_stops_plan_within_grace_period() {
        let registry = Arc::new(ResolverRegistry::new());
        registry.register(Arc::new(SleepForeverResolver)).await.unwrap();

        let plan = Arc::new(MasteryPlan::new("cancel_me", Version::new(1, 0, 0)).step(Step::new("a", "sleepy")));

        let ctx = ResolveContext::new();
        let cancel_token = ctx.cancellation.clone();
        let config = ExecutorConfig {
            cancel_grace: Duration::from_millis(200),
            ..ExecutorConfig::default()
        };
        let executor = Executor::new(registry, no_retry_policy(), config);

        let run = tokio::spawn({
            let plan = plan.clone();
            async move { executor.run(plan, Uuid::new_v4(), serde_json::json!({}), ctx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();

        let execution = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert_eq!(execution.status, PlanStatus::Cancelled);
        assert_eq!(execution.steps["a"].status, StepStatus::Cancelled);
    }
}
