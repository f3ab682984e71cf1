//! The Mastery Registry (spec component C5): the same versioned arena
//! shape as [`super::resolver_registry::ResolverRegistry`], specialized to
//! [`crate::mastery::MasteryPlan`] so the Composer can reuse an existing
//! plan before synthesizing a new one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use fabric_db::fsstore;
use semver::Version;
use tokio::sync::RwLock;

use super::embedder::{cosine_similarity, substring_overlap_score, Embedder};
use crate::mastery::MasteryPlan;

fn file_stem(name: &str, version: &Version) -> String {
    format!("{name}@{version}")
}

struct Inner {
    arena: HashMap<(String, Version), Arc<MasteryPlan>>,
    by_name: HashMap<String, Vec<Version>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            arena: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

/// Versioned, persisted store of Mastery plans, indexed by name and
/// discoverable via semantic search over their descriptions (same
/// reuse-before-synthesize pattern the Composer drives at threshold 0.85).
pub struct MasteryRegistry {
    inner: RwLock<Inner>,
    dir: Option<PathBuf>,
}

impl MasteryRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            dir: None,
        }
    }

    pub fn with_persistence(dir: PathBuf) -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            dir: Some(dir),
        }
    }

    /// Load every `*.json` plan already persisted under this registry's
    /// directory, e.g. on process startup.
    pub async fn load_all(&self) -> Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let plans: Vec<MasteryPlan> = fsstore::read_all_json(dir).await?;
        let mut inner = self.inner.write().await;
        for plan in plans {
            let key = (plan.name.clone(), plan.version.clone());
            let versions = inner.by_name.entry(plan.name.clone()).or_default();
            if !versions.contains(&plan.version) {
                versions.push(plan.version.clone());
                versions.sort();
            }
            inner.arena.insert(key, Arc::new(plan));
        }
        Ok(())
    }

    pub async fn register(&self, plan: MasteryPlan) -> Result<Arc<MasteryPlan>> {
        plan.validate().context("refusing to register an invalid mastery plan")?;
        let key = (plan.name.clone(), plan.version.clone());
        let plan = Arc::new(plan);

        let mut inner = self.inner.write().await;
        let versions = inner.by_name.entry(key.0.clone()).or_default();
        if !versions.contains(&key.1) {
            versions.push(key.1.clone());
            versions.sort();
        }
        inner.arena.insert(key.clone(), Arc::clone(&plan));
        drop(inner);

        if let Some(dir) = &self.dir {
            fsstore::write_json(dir, &file_stem(&key.0, &key.1), plan.as_ref())
                .await
                .context("failed to persist mastery plan")?;
        }
        Ok(plan)
    }

    pub async fn get(&self, name: &str, version: &Version) -> Option<Arc<MasteryPlan>> {
        let inner = self.inner.read().await;
        inner.arena.get(&(name.to_owned(), version.clone())).cloned()
    }

    pub async fn get_latest(&self, name: &str) -> Option<Arc<MasteryPlan>> {
        let inner = self.inner.read().await;
        let version = inner.by_name.get(name)?.last()?.clone();
        inner.arena.get(&(name.to_owned(), version)).cloned()
    }

    /// Rank registered plans by similarity of `goal` to their description.
    /// Same embedder-or-token-overlap fallback as the resolver registry.
    pub async fn semantic_search(
        &self,
        goal: &str,
        embedder: Option<&dyn Embedder>,
        top_k: usize,
    ) -> Vec<(f32, Arc<MasteryPlan>)> {
        let inner = self.inner.read().await;
        let goal_embedding = embedder.map(|e| e.embed(goal));

        let mut scored: Vec<(f32, Arc<MasteryPlan>)> = inner
            .arena
            .values()
            .map(|plan| {
                let score = match (&goal_embedding, embedder) {
                    (Some(ge), Some(emb)) => cosine_similarity(ge, &emb.embed(&plan.description)),
                    _ => substring_overlap_score(goal, &plan.description),
                };
                (score, Arc::clone(plan))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.arena.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MasteryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
