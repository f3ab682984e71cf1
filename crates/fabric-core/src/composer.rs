//! The Mastery Composer (spec component C6): produces a [`MasteryPlan`]
//! from a task description, either by reusing an existing plan or by
//! synthesizing one from a planning resolver's capability list.

use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mastery::{MasteryPlan, MasteryPlanError, OnError, Step};
use crate::registry::{Embedder, MasteryRegistry, ResolverRegistry, VersionSelector};
use crate::task::{ResolveContext, Task};

/// A planning resolver advertises capability `"plan"` and is expected to
/// return a JSON object shaped `{"capabilities": ["cap1", "cap2", ...]}`
/// giving the ordered list of capabilities a synthesized plan should bind,
/// one step per capability.
const PLANNING_CAPABILITY: &str = "plan";

/// Reasons the Composer could not produce a plan (spec §4.5: "Reject plans
/// that are not DAGs").
#[derive(Debug, Error)]
pub enum ComposerFailure {
    #[error("no mastery registry plan matched and no planning resolver (capability '{PLANNING_CAPABILITY}') is registered")]
    NoPlanningResolver,
    #[error("planning resolver failed: {0}")]
    PlanningResolverFailed(String),
    #[error("planning resolver returned a result that was not a capability list")]
    MalformedPlanningResult,
    #[error("no resolver is registered for capability '{0}'")]
    NoResolverForCapability(String),
    #[error("synthesized plan is invalid: {0}")]
    InvalidPlan(#[from] MasteryPlanError),
}

#[derive(Debug, Deserialize)]
struct PlanningResult {
    capabilities: Vec<String>,
}

/// Request describing the work a composed Mastery should accomplish.
#[derive(Debug, Clone, Serialize)]
pub struct ComposeRequest {
    pub description: String,
    pub initial_input: serde_json::Value,
}

/// Produce a plan for `request`, reusing an existing registered Mastery
/// when its description scores at least `reuse_threshold` against the
/// request (spec §4.5 step 1), otherwise synthesizing one via a planning
/// resolver (steps 2-5).
pub async fn compose(
    request: &ComposeRequest,
    mastery_registry: &MasteryRegistry,
    resolver_registry: &ResolverRegistry,
    embedder: Option<&dyn Embedder>,
    reuse_threshold: f32,
    ctx: &ResolveContext,
) -> Result<Arc<MasteryPlan>, ComposerFailure> {
    let existing = mastery_registry
        .semantic_search(&request.description, embedder, 1)
        .await;
    if let Some((score, plan)) = existing.into_iter().next() {
        if score >= reuse_threshold {
            return Ok(plan);
        }
    }

    synthesize(request, resolver_registry, ctx).await
}

async fn synthesize(
    request: &ComposeRequest,
    resolver_registry: &ResolverRegistry,
    ctx: &ResolveContext,
) -> Result<Arc<MasteryPlan>, ComposerFailure> {
    let planners = resolver_registry.find_by_capability(PLANNING_CAPABILITY).await;
    let planner = planners.first().ok_or(ComposerFailure::NoPlanningResolver)?;

    let planning_task = Task::new(
        "compose",
        serde_json::json!({
            "description": request.description,
            "input": request.initial_input,
        }),
    );
    let planned = planner.resolve(planning_task, &ctx.child()).await;
    if !planned.is_success() {
        let message = planned
            .error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "planning resolver returned no error detail".to_owned());
        return Err(ComposerFailure::PlanningResolverFailed(message));
    }
    let result = planned.result.ok_or(ComposerFailure::MalformedPlanningResult)?;
    let planning: PlanningResult =
        serde_json::from_value(result).map_err(|_| ComposerFailure::MalformedPlanningResult)?;

    let mut plan = MasteryPlan::new(
        sanitize_plan_name(&request.description),
        Version::new(0, 1, 0),
    )
    .description(request.description.clone());

    let mut bound_steps: Vec<(String, Vec<String>)> = Vec::new();
    for (i, capability) in planning.capabilities.iter().enumerate() {
        let candidates = resolver_registry.find_by_capability(capability).await;
        let resolver = candidates
            .first()
            .ok_or_else(|| ComposerFailure::NoResolverForCapability(capability.clone()))?;
        let meta = resolver.metadata();

        let step_id = format!("step_{i}_{capability}");
        // Depend on every earlier step whose resolver advertises an output
        // field this step might consume (spec §4.5 step 4: wire data deps
        // from declared result fields rather than hand-authoring them).
        let mut depends_on = Vec::new();
        let mut input_template = serde_json::json!({ "initial": "${initial}" });
        for (earlier_id, earlier_fields) in &bound_steps {
            if earlier_fields.is_empty() {
                continue;
            }
            depends_on.push(earlier_id.clone());
            let obj = input_template.as_object_mut().expect("object literal");
            for field in earlier_fields {
                obj.insert(field.clone(), serde_json::json!(format!("${{steps.{earlier_id}.{field}}}")));
            }
        }

        let mut step = Step::new(step_id.clone(), meta.name.clone())
            .selector(VersionSelector::Latest)
            .on_error(OnError::Propagate)
            .input_template(input_template);
        for dep in &depends_on {
            step = step.depends_on(dep.clone());
        }
        plan = plan.step(step);
        bound_steps.push((step_id, meta.output_fields.clone()));
    }

    plan.validate()?;
    Ok(Arc::new(plan))
}

fn sanitize_plan_name(description: &str) -> String {
    let mut name: String = description
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    name.truncate(48);
    if name.is_empty() {
        name = "composed_plan".to_owned();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{HealthReport, Resolver, ResolverMetadata};
    use async_trait::async_trait;

    struct StubPlanningResolver;

    #[async_trait]
    impl Resolver for StubPlanningResolver {
        fn metadata(&self) -> ResolverMetadata {
            ResolverMetadata::new("planner", Version::new(1, 0, 0)).capability(PLANNING_CAPABILITY)
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.succeed(serde_json::json!({"capabilities": ["fetch", "summarize"]}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    struct StubCapabilityResolver {
        name: &'static str,
        capability: &'static str,
        output_fields: Vec<&'static str>,
    }

    #[async_trait]
    impl Resolver for StubCapabilityResolver {
        fn metadata(&self) -> ResolverMetadata {
            let mut m = ResolverMetadata::new(self.name, Version::new(1, 0, 0)).capability(self.capability);
            for f in &self.output_fields {
                m = m.output_field(*f);
            }
            m
        }

        async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
            task.succeed(serde_json::json!({}))
        }

        async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
            HealthReport::healthy()
        }
    }

    async fn seeded_resolver_registry() -> ResolverRegistry {
        let registry = ResolverRegistry::new();
        registry.register(Arc::new(StubPlanningResolver)).await.unwrap();
        registry
            .register(Arc::new(StubCapabilityResolver {
                name: "fetcher",
                capability: "fetch",
                output_fields: vec!["document"],
            }))
            .await
            .unwrap();
        registry
            .register(Arc::new(StubCapabilityResolver {
                name: "summarizer",
                capability: "summarize",
                output_fields: vec!["summary"],
            }))
            .await
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn synthesizes_plan_from_planning_resolver() {
        let resolver_registry = seeded_resolver_registry().await;
        let mastery_registry = MasteryRegistry::new();
        let request = ComposeRequest {
            description: "fetch a document and summarize it".to_owned(),
            initial_input: serde_json::json!({"url": "https://example.com"}),
        };
        let plan = compose(
            &request,
            &mastery_registry,
            &resolver_registry,
            None,
            0.85,
            &ResolveContext::new(),
        )
        .await
        .unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].resolver_name, "fetcher");
        assert_eq!(plan.steps[1].resolver_name, "summarizer");
        assert_eq!(plan.steps[1].depends_on, vec!["step_0_fetch".to_owned()]);
    }

    #[tokio::test]
    async fn reuses_existing_plan_above_threshold() {
        let resolver_registry = seeded_resolver_registry().await;
        let mastery_registry = MasteryRegistry::new();
        let existing = MasteryPlan::new("onboarding", Version::new(1, 0, 0))
            .description("fetch a document and summarize it")
            .step(Step::new("a", "fetcher"));
        mastery_registry.register(existing).await.unwrap();

        let request = ComposeRequest {
            description: "fetch a document and summarize it".to_owned(),
            initial_input: serde_json::json!({}),
        };
        let plan = compose(
            &request,
            &mastery_registry,
            &resolver_registry,
            None,
            0.5,
            &ResolveContext::new(),
        )
        .await
        .unwrap();
        assert_eq!(plan.name, "onboarding");
    }

    #[tokio::test]
    async fn no_planning_resolver_is_composer_failure() {
        let resolver_registry = ResolverRegistry::new();
        let mastery_registry = MasteryRegistry::new();
        let request = ComposeRequest {
            description: "do anything".to_owned(),
            initial_input: serde_json::json!({}),
        };
        let err = compose(
            &request,
            &mastery_registry,
            &resolver_registry,
            None,
            0.85,
            &ResolveContext::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ComposerFailure::NoPlanningResolver));
    }

    #[tokio::test]
    async fn missing_capability_resolver_is_composer_failure() {
        let resolver_registry = ResolverRegistry::new();
        resolver_registry.register(Arc::new(StubPlanningResolver)).await.unwrap();
        let mastery_registry = MasteryRegistry::new();
        let request = ComposeRequest {
            description: "fetch and summarize".to_owned(),
            initial_input: serde_json::json!({}),
        };
        let err = compose(
            &request,
            &mastery_registry,
            &resolver_registry,
            None,
            0.85,
            &ResolveContext::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ComposerFailure::NoResolverForCapability(c) if c == "fetch"));
    }
}
