//! The TaskResolver Registry (spec component C4).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fabric_db::fsstore;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::embedder::{cosine_similarity, substring_overlap_score, Embedder};
use crate::resolver::{HealthReport, Resolver, ResolverMetadata};
use crate::task::ResolveContext;

/// A version constraint used when binding a Mastery step to a concrete
/// resolver (spec §4.5 selector resolution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "version")]
pub enum VersionSelector {
    Exact(Version),
    /// `^1.2.0`-style: compatible-with, per semver caret rules.
    Caret(Version),
    Latest,
}

impl VersionSelector {
    fn matches(&self, v: &Version) -> bool {
        match self {
            Self::Exact(want) => want == v,
            Self::Caret(want) => caret_compatible(want, v),
            Self::Latest => true,
        }
    }
}

fn caret_compatible(want: &Version, have: &Version) -> bool {
    if want.major > 0 {
        have.major == want.major && (have.minor, have.patch) >= (want.minor, want.patch)
    } else if want.minor > 0 {
        have.major == 0 && have.minor == want.minor && have.patch >= want.patch
    } else {
        have.major == 0 && have.minor == 0 && have.patch == want.patch
    }
}

/// Metadata record persisted to disk for each registered resolver version.
/// The live `Arc<dyn Resolver>` is never persisted -- only the process
/// that registers a resolver can supply its behavior; this record exists
/// so the `degraded` flag and discovery metadata survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    metadata: ResolverMetadata,
}

fn file_stem(name: &str, version: &Version) -> String {
    format!("{name}@{version}")
}

struct Inner {
    arena: HashMap<(String, Version), Arc<dyn Resolver>>,
    metadata: HashMap<(String, Version), ResolverMetadata>,
    by_name: HashMap<String, Vec<Version>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            arena: HashMap::new(),
            metadata: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    fn latest_version(&self, name: &str) -> Option<&Version> {
        self.by_name.get(name).and_then(|versions| versions.last())
    }

    fn insert(&mut self, resolver: Arc<dyn Resolver>, degraded_carry_forward: bool) {
        let mut meta = resolver.metadata();
        meta.degraded = meta.degraded || degraded_carry_forward;
        let key = (meta.name.clone(), meta.version.clone());

        let versions = self.by_name.entry(meta.name.clone()).or_default();
        if !versions.contains(&meta.version) {
            versions.push(meta.version.clone());
            versions.sort();
        }

        self.metadata.insert(key.clone(), meta);
        self.arena.insert(key, resolver);
    }
}

/// Versioned, multi-indexed registry of task resolvers.
///
/// Every mutating call persists the affected entry's metadata to
/// `dir/<name>@<version>.json` before returning (when a directory is
/// configured), so degraded flags and discovery metadata survive restarts
/// even though the resolver implementations themselves are supplied fresh
/// by the host process on every startup.
pub struct ResolverRegistry {
    inner: RwLock<Inner>,
    dir: Option<PathBuf>,
}

impl ResolverRegistry {
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

    /// Register a resolver, carrying forward any previously-persisted
    /// `degraded` flag for the same `(name, version)`.
    pub async fn register(&self, resolver: Arc<dyn Resolver>) -> Result<()> {
        let meta = resolver.metadata();
        let degraded_carry_forward = if let Some(dir) = &self.dir {
            fsstore::read_json::<PersistedEntry>(dir, &file_stem(&meta.name, &meta.version))
                .await?
                .map(|p| p.metadata.degraded)
                .unwrap_or(false)
        } else {
            false
        };

        let mut inner = self.inner.write().await;
        inner.insert(resolver, degraded_carry_forward);
        let persisted_meta = inner.metadata.get(&(meta.name.clone(), meta.version.clone())).cloned();
        drop(inner);

        if let (Some(dir), Some(persisted_meta)) = (&self.dir, persisted_meta) {
            fsstore::write_json(
                dir,
                &file_stem(&meta.name, &meta.version),
                &PersistedEntry { metadata: persisted_meta },
            )
            .await
            .context("failed to persist resolver registry entry")?;
        }
        Ok(())
    }

    pub async fn get(&self, name: &str, version: &Version) -> Option<Arc<dyn Resolver>> {
        let inner = self.inner.read().await;
        inner.arena.get(&(name.to_owned(), version.clone())).cloned()
    }

    pub async fn get_latest(&self, name: &str) -> Option<Arc<dyn Resolver>> {
        let inner = self.inner.read().await;
        let version = inner.latest_version(name)?.clone();
        inner.arena.get(&(name.to_owned(), version)).cloned()
    }

    /// Resolve a `VersionSelector` against the name's version index,
    /// preferring the highest matching version (never a lexicographic
    /// comparison -- semver ordering throughout).
    pub async fn resolve_selector(
        &self,
        name: &str,
        selector: &VersionSelector,
    ) -> Option<Arc<dyn Resolver>> {
        let inner = self.inner.read().await;
        let versions = inner.by_name.get(name)?;
        let matched = versions.iter().rev().find(|v| selector.matches(v))?.clone();
        inner.arena.get(&(name.to_owned(), matched)).cloned()
    }

    /// Remove a `(name, version)` entry. The next-highest remaining version
    /// for that name (if any) becomes the new "latest" automatically, since
    /// `get_latest`/`resolve_selector` always read the live version index
    /// rather than a cached flag (spec §4.3 unregister contract).
    pub async fn unregister(&self, name: &str, version: &Version) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let key = (name.to_owned(), version.clone());
        let removed = inner.arena.remove(&key).is_some();
        inner.metadata.remove(&key);
        if let Some(versions) = inner.by_name.get_mut(name) {
            versions.retain(|v| v != version);
            if versions.is_empty() {
                inner.by_name.remove(name);
            }
        }
        drop(inner);
        if removed {
            if let Some(dir) = &self.dir {
                fsstore::remove(dir, &file_stem(name, version))
                    .await
                    .context("failed to remove persisted resolver registry entry")?;
            }
        }
        Ok(removed)
    }

    /// Invoke every registered entry's `health_check` concurrently, each
    /// bounded by `per_entry_timeout`. Per-entry failures (timeout or a
    /// panicking probe) are reported as unhealthy rather than propagated,
    /// so one bad resolver cannot fail the whole roll-up (spec §4.3).
    pub async fn health_rollup(
        &self,
        ctx: &ResolveContext,
        per_entry_timeout: Duration,
    ) -> HashMap<(String, Version), HealthReport> {
        let entries: Vec<((String, Version), Arc<dyn Resolver>)> = {
            let inner = self.inner.read().await;
            inner
                .arena
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let checks = entries.into_iter().map(|(key, resolver)| {
            let ctx = ctx.child();
            async move {
                let report = match tokio::time::timeout(
                    per_entry_timeout,
                    resolver.health_check(&ctx),
                )
                .await
                {
                    Ok(report) => report,
                    Err(_) => HealthReport::unhealthy("health check timed out"),
                };
                (key, report)
            }
        });

        futures::future::join_all(checks).await.into_iter().collect()
    }

    pub async fn mark_degraded(&self, name: &str, version: &Version) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (name.to_owned(), version.clone());
        if let Some(meta) = inner.metadata.get_mut(&key) {
            meta.degraded = true;
        }
        let persisted = inner.metadata.get(&key).cloned();
        drop(inner);
        if let (Some(dir), Some(meta)) = (&self.dir, persisted) {
            fsstore::write_json(
                dir,
                &file_stem(name, version),
                &PersistedEntry { metadata: meta },
            )
            .await
            .context("failed to persist degraded flag")?;
        }
        Ok(())
    }

    /// Resolvers advertising `tag`, non-degraded entries first.
    pub async fn find_by_tag(&self, tag: &str) -> Vec<Arc<dyn Resolver>> {
        self.find_by(|m| m.has_tag(tag)).await
    }

    /// Resolvers advertising `capability`, non-degraded entries first.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<Arc<dyn Resolver>> {
        self.find_by(|m| m.has_capability(capability)).await
    }

    /// Non-degraded entries first; within that, shallower `depth` first,
    /// then newest `version` first (spec §4.3: "ordered by (depth
    /// ascending, version descending)").
    async fn find_by(&self, pred: impl Fn(&ResolverMetadata) -> bool) -> Vec<Arc<dyn Resolver>> {
        let inner = self.inner.read().await;
        let mut matches: Vec<(&ResolverMetadata, Arc<dyn Resolver>)> = inner
            .metadata
            .iter()
            .filter(|(_, m)| pred(m))
            .map(|(key, m)| (m, inner.arena.get(key).expect("metadata/arena desync").clone()))
            .collect();
        matches.sort_by_key(|(m, _)| (m.degraded, m.depth, std::cmp::Reverse(m.version.clone())));
        matches.into_iter().map(|(_, r)| r).collect()
    }

    /// Rank resolvers by similarity to `query`. Uses `embedder` when
    /// supplied; otherwise falls back to a deterministic token-overlap
    /// score over each resolver's description and tags (non-semantic,
    /// documented, never fails the call). Degraded entries sort after
    /// non-degraded ones at equal score.
    pub async fn semantic_search(
        &self,
        query: &str,
        embedder: Option<&dyn Embedder>,
        top_k: usize,
    ) -> Vec<(f32, Arc<dyn Resolver>)> {
        let inner = self.inner.read().await;
        let query_embedding = embedder.map(|e| e.embed(query));

        let mut scored: Vec<(f32, bool, Arc<dyn Resolver>)> = inner
            .metadata
            .iter()
            .map(|(key, m)| {
                let resolver = inner.arena.get(key).expect("metadata/arena desync").clone();
                let text = format!("{} {}", m.description, m.tags.join(" "));
                let score = match (&query_embedding, embedder) {
                    (Some(qe), Some(emb)) => cosine_similarity(qe, &emb.embed(&text)),
                    _ => substring_overlap_score(query, &text),
                };
                (score, m.degraded, resolver)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.into_iter().take(top_k).map(|(s, _, r)| (s, r)).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.arena.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
