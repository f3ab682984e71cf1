//! The `Resolver` contract (spec component C3): the only seam through
//! which the fabric touches concrete task-handling logic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::task::{ResolveContext, Task};

/// Identity and discovery metadata for a registered resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverMetadata {
    pub name: String,
    pub version: Version,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub description: String,
    /// Field names this resolver's result is expected to carry, standing in
    /// for a full result-schema (spec §3's `resultSchema`): the Composer
    /// uses this to wire a later step's input to an earlier step's output
    /// without needing a schema validator.
    pub output_fields: Vec<String>,
    /// Recursion guard (spec §3): this resolver may only invoke resolvers
    /// of strictly lower depth. Leaf resolvers (no sub-resolver calls) use
    /// depth 0.
    pub depth: u32,
    /// Number of failed tasks in the rolling window that makes this
    /// resolver eligible for evolution (spec §4.7).
    pub evolution_threshold_failures: u32,
    /// Minimum time between successive evolutions of this resolver name.
    #[serde(with = "duration_secs")]
    pub min_evolution_interval: Duration,
    /// Set by the Evolver when it gives up evolving a chronically-failing
    /// resolver (spec §4.7). Degraded entries sort after non-degraded ones
    /// in registry lookups but are never evicted.
    pub degraded: bool,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl ResolverMetadata {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            capabilities: Vec::new(),
            tags: Vec::new(),
            description: String::new(),
            output_fields: Vec::new(),
            depth: 0,
            evolution_threshold_failures: 5,
            min_evolution_interval: Duration::from_secs(60),
            degraded: false,
        }
    }

    pub fn capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn output_field(mut self, field: impl Into<String>) -> Self {
        self.output_fields.push(field.into());
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn evolution_threshold_failures(mut self, n: u32) -> Self {
        self.evolution_threshold_failures = n;
        self
    }

    pub fn min_evolution_interval(mut self, interval: Duration) -> Self {
        self.min_evolution_interval = interval;
        self
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.iter().any(|c| c == cap)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether `self` may invoke a resolver with the given depth (spec §3:
    /// strictly lower depth only, preventing recursive resolver calls).
    pub fn may_invoke_depth(&self, callee_depth: u32) -> bool {
        callee_depth < self.depth
    }
}

/// Outcome of a [`Resolver::health_check`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            checked_at: Utc::now(),
        }
    }
}

/// Outcome of [`Resolver::run_baseline_tests`], used by the Evolver to
/// gate a candidate replacement against the set of cases the current
/// resolver already passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineReport {
    pub passed: bool,
    pub cases_passed: Vec<String>,
    pub cases_failed: Vec<String>,
}

/// The contract every task-handling collaborator implements.
///
/// Object-safe (`#[async_trait]`, every method takes `&self` and returns a
/// concrete or boxed type), so registries store `Arc<dyn Resolver>`.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn metadata(&self) -> ResolverMetadata;

    /// Attempt the task. Takes ownership and returns it with its terminal
    /// (or retry-eligible) status set; must never panic across this
    /// boundary without the caller (the Retry Engine) being able to
    /// recover -- see `crate::retry::call`.
    async fn resolve(&self, task: Task, ctx: &ResolveContext) -> Task;

    /// Lightweight liveness/readiness probe, independent of `resolve`.
    async fn health_check(&self, ctx: &ResolveContext) -> HealthReport;

    /// Optional self-test bundle used by the Evolver to establish a
    /// baseline before accepting a candidate replacement. `None` means
    /// this resolver opts out of evolution gating.
    async fn run_baseline_tests(&self, _ctx: &ResolveContext) -> Option<BaselineReport> {
        None
    }
}

// Compile-time assertion: Resolver must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Resolver) {}
};
