//! Queries against the embedded `metrics.db` store.

pub mod alerts;
pub mod metrics;
