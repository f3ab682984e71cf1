//! Shared test scaffolding for the fabric crates: an embedded SQLite
//! `metrics.db` with migrations applied, and a handful of canned
//! [`Resolver`] implementations for composing Masteries in tests without
//! every crate hand-rolling its own stubs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fabric_core::{HealthReport, ResolveContext, Resolver, ResolverMetadata, Task};
use fabric_db::pool;
use semver::Version;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// An isolated `metrics.db` for a single test. Dropping this removes the
/// backing temp directory; keep it alive for the duration of the test.
pub struct TestStore {
    pub pool: SqlitePool,
    _dir: TempDir,
}

/// Create a fresh, migrated SQLite store in a temp directory.
pub async fn create_test_store() -> anyhow::Result<TestStore> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("metrics.db");

    let opts = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;

    pool::run_migrations(&pool, pool::default_migrations_path()).await?;

    Ok(TestStore { pool, _dir: dir })
}

/// Always succeeds, returning its input's `field` value (default: the
/// whole input) under `field` in the result, after an optional delay.
pub struct EchoResolver {
    name: String,
    version: Version,
    capability: Option<String>,
    delay: Option<std::time::Duration>,
}

impl EchoResolver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Version::new(1, 0, 0),
            capability: None,
            delay: None,
        }
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Resolver for EchoResolver {
    fn metadata(&self) -> ResolverMetadata {
        let mut meta = ResolverMetadata::new(self.name.clone(), self.version.clone());
        if let Some(cap) = &self.capability {
            meta = meta.capability(cap.clone());
        }
        meta
    }

    async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let input = task.input.clone();
        task.succeed(serde_json::json!({ "echo": input }))
    }

    async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
        HealthReport::healthy()
    }
}

/// Fails its first `fail_times` resolve attempts with a retryable error,
/// then succeeds. Useful for exercising `fabric_core::retry`.
pub struct FlakyResolver {
    name: String,
    version: Version,
    fail_times: u32,
    attempts: AtomicU32,
}

impl FlakyResolver {
    pub fn new(name: impl Into<String>, fail_times: u32) -> Self {
        Self {
            name: name.into(),
            version: Version::new(1, 0, 0),
            fail_times,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Resolver for FlakyResolver {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new(self.name.clone(), self.version.clone())
    }

    async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            task.fail(fabric_core::TaskError::new(
                fabric_db::models::ErrorKind::Network,
                "transient failure",
            ))
        } else {
            task.succeed(serde_json::json!({ "ok": true }))
        }
    }

    async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
        HealthReport::healthy()
    }
}

/// Always fails with a non-retryable validation error.
pub struct AlwaysFailResolver {
    name: String,
    version: Version,
}

impl AlwaysFailResolver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Version::new(1, 0, 0),
        }
    }
}

#[async_trait]
impl Resolver for AlwaysFailResolver {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new(self.name.clone(), self.version.clone())
    }

    async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
        task.fail(fabric_core::TaskError::new(
            fabric_db::models::ErrorKind::Validation,
            "always fails",
        ))
    }

    async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
        HealthReport::healthy()
    }
}

/// Advertises capability `"plan"` and returns a fixed capability list for
/// the Composer to bind one step per capability.
pub struct StubPlanningResolver {
    capabilities: Vec<String>,
}

impl StubPlanningResolver {
    pub fn new(capabilities: Vec<impl Into<String>>) -> Self {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Resolver for StubPlanningResolver {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new("test_planner", Version::new(1, 0, 0)).capability("plan")
    }

    async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
        task.succeed(serde_json::json!({ "capabilities": self.capabilities }))
    }

    async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
        HealthReport::healthy()
    }
}

/// Advertises capability `"evolve_resolver"` and returns a fixed candidate
/// version for the Evolver to verify and promote.
pub struct StubGeneratorResolver {
    candidate_version: Version,
}

impl StubGeneratorResolver {
    pub fn new(candidate_version: Version) -> Self {
        Self { candidate_version }
    }
}

#[async_trait]
impl Resolver for StubGeneratorResolver {
    fn metadata(&self) -> ResolverMetadata {
        ResolverMetadata::new("test_generator", Version::new(1, 0, 0)).capability("evolve_resolver")
    }

    async fn resolve(&self, task: Task, _ctx: &ResolveContext) -> Task {
        task.succeed(serde_json::json!({ "version": self.candidate_version.to_string() }))
    }

    async fn health_check(&self, _ctx: &ResolveContext) -> HealthReport {
        HealthReport::healthy()
    }
}

/// Convenience wrapper for tests that just need an `Arc<dyn Resolver>`.
pub fn arc<R: Resolver + 'static>(resolver: R) -> Arc<dyn Resolver> {
    Arc::new(resolver)
}
