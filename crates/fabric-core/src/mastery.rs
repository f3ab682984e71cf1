//! Mastery value types (spec component C6): a versioned DAG of steps bound
//! to resolvers, either synthesized by the Composer or authored as static
//! TOML (a supplemental feature generalizing the corpus's
//! `plan/toml_format.rs`).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use fabric_db::models::PlanStatus;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::registry::VersionSelector;

/// What to do when a step's resolve attempt exhausts its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "step_id")]
pub enum OnError {
    /// Fail the whole Mastery run.
    Propagate,
    /// Skip this step and continue; dependents that require its output
    /// also skip, transitively.
    SkipOptional,
    /// Run the named compensating step instead, then continue.
    Compensate(String),
}

/// A single unit of work within a [`MasteryPlan`]: a capability/name
/// selector bound to a version constraint, plus its upstream data
/// dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub resolver_name: String,
    #[serde(default = "default_selector")]
    pub selector: VersionSelector,
    /// Step ids whose output this step's input depends on. The executor
    /// will not start this step until all of these have completed.
    pub depends_on: Vec<String>,
    pub on_error: OnError,
    /// JSON-pointer-ish template for building this step's task input from
    /// the Mastery's initial input and completed steps' outputs. Kept as an
    /// opaque JSON value; the executor does simple key substitution rather
    /// than a full templating pass.
    pub input_template: serde_json::Value,
    /// Maximum time the Executor allows this step to run before failing it
    /// with `ErrorKind::Timeout` (spec §3 Step.timeout). `None` means no
    /// per-step deadline beyond the context's own.
    #[serde(default, with = "optional_duration_secs")]
    pub timeout: Option<Duration>,
}

mod optional_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

fn default_selector() -> VersionSelector {
    VersionSelector::Latest
}

impl Step {
    pub fn new(id: impl Into<String>, resolver_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resolver_name: resolver_name.into(),
            selector: VersionSelector::Latest,
            depends_on: Vec::new(),
            on_error: OnError::Propagate,
            input_template: serde_json::json!({}),
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    pub fn input_template(mut self, template: serde_json::Value) -> Self {
        self.input_template = template;
        self
    }

    pub fn selector(mut self, selector: VersionSelector) -> Self {
        self.selector = selector;
        self
    }
}

/// A named, versioned DAG of [`Step`]s, either synthesized by the Composer
/// or authored directly as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryPlan {
    pub name: String,
    pub version: Version,
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub status: PlanStatus,
}

/// Raised during DAG validation (spec §4.6 invariant: no cycles, every
/// `depends_on` id exists).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MasteryPlanError {
    #[error("step '{0}' depends on unknown step '{1}'")]
    UnknownDependency(String, String),
    #[error("mastery plan contains a dependency cycle")]
    Cycle,
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),
}

impl MasteryPlan {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            steps: Vec::new(),
            status: PlanStatus::Running,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate that every `depends_on` id refers to a real step and that
    /// the dependency graph has no cycles, via Kahn's algorithm.
    pub fn validate(&self) -> Result<(), MasteryPlanError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.clone()) {
                return Err(MasteryPlanError::DuplicateStepId(step.id.clone()));
            }
        }
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(MasteryPlanError::UnknownDependency(step.id.clone(), dep.clone()));
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> =
            self.steps.iter().map(|s| (s.id.as_str(), s.depends_on.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents.entry(dep.as_str()).or_default().push(&step.id);
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop() {
            visited += 1;
            if let Some(deps) = dependents.get(id) {
                for dependent in deps {
                    let degree = in_degree.get_mut(dependent).expect("index built from same step set");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(dependent);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            return Err(MasteryPlanError::Cycle);
        }
        Ok(())
    }

    /// Topological execution order (one valid linearization). Callers that
    /// want maximal fan-out should instead schedule "ready" steps layer by
    /// layer; this is used by the Executor to seed its ready queue.
    pub fn topological_order(&self) -> Result<Vec<String>, MasteryPlanError> {
        self.validate()?;
        let mut in_degree: HashMap<&str, usize> =
            self.steps.iter().map(|s| (s.id.as_str(), s.depends_on.len())).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                dependents.entry(dep.as_str()).or_default().push(&step.id);
            }
        }
        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        queue.sort();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(id) = queue.first().copied() {
            queue.remove(0);
            order.push(id.to_string());
            if let Some(deps) = dependents.get(id) {
                for dependent in deps {
                    let degree = in_degree.get_mut(dependent).expect("index built from same step set");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(dependent);
                        queue.sort();
                    }
                }
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_linear_chain() {
        let plan = MasteryPlan::new("demo", Version::new(1, 0, 0))
            .step(Step::new("a", "echo"))
            .step(Step::new("b", "echo").depends_on("a"));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let plan = MasteryPlan::new("demo", Version::new(1, 0, 0)).step(Step::new("a", "echo").depends_on("ghost"));
        assert_eq!(
            plan.validate(),
            Err(MasteryPlanError::UnknownDependency("a".into(), "ghost".into()))
        );
    }

    #[test]
    fn validate_rejects_cycle() {
        let plan = MasteryPlan::new("demo", Version::new(1, 0, 0))
            .step(Step::new("a", "echo").depends_on("b"))
            .step(Step::new("b", "echo").depends_on("a"));
        assert_eq!(plan.validate(), Err(MasteryPlanError::Cycle));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let plan = MasteryPlan::new("demo", Version::new(1, 0, 0))
            .step(Step::new("a", "echo"))
            .step(Step::new("a", "echo"));
        assert_eq!(plan.validate(), Err(MasteryPlanError::DuplicateStepId("a".into())));
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let plan = MasteryPlan::new("demo", Version::new(1, 0, 0))
            .step(Step::new("a", "echo"))
            .step(Step::new("b", "echo").depends_on("a"))
            .step(Step::new("c", "echo").depends_on("a"))
            .step(Step::new("d", "echo").depends_on("b").depends_on("c"));
        let order = plan.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }
}
