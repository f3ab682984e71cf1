//! Embedded persistence for the task-resolution fabric.
//!
//! `metrics.db` (SQLite, via [`pool`]) holds the append-only metric sample
//! stream and the alert lifecycle table. Everything else -- resolver and
//! mastery registries, execution history, evolver bookkeeping -- lives as
//! flat JSON files under the configured data directory; see [`fsstore`].

pub mod config;
pub mod fsstore;
pub mod models;
pub mod pool;
pub mod queries;
