//! The `Task` value type and the context threaded through every resolve,
//! registry, and store call.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_db::models::{ErrorKind, TaskStatus};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A typed error produced by a failed [`crate::resolver::Resolver::resolve`]
/// call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<String>,
    /// Whether a fresh attempt is worth making. Defaults to
    /// `kind.default_retryable()` but a resolver may override it for a
    /// specific failure (e.g. a `Validation` error it knows is transient).
    pub retryable: bool,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = kind.default_retryable();
        Self {
            kind,
            message: message.into(),
            detail: None,
            retryable,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

/// A unit of work routed through a [`crate::resolver::Resolver`].
///
/// `resolve` takes ownership of a `Task` and hands it back with a terminal
/// (or retry-eligible) status set; it is never mutated in place by more
/// than one collaborator at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub input: serde_json::Value,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            input,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            attempt: 0,
            created_at: Utc::now(),
        }
    }

    pub fn succeed(mut self, result: serde_json::Value) -> Self {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self
    }

    pub fn fail(mut self, error: TaskError) -> Self {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.result = None;
        self
    }

    pub fn cancel(mut self) -> Self {
        self.status = TaskStatus::Cancelled;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Per-call context threaded through resolve/registry/store operations:
/// cooperative cancellation, an optional deadline, and a correlation id for
/// cross-component tracing.
#[derive(Clone)]
pub struct ResolveContext {
    pub correlation_id: Uuid,
    pub deadline: Option<Instant>,
    pub cancellation: CancellationToken,
}

impl ResolveContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn child(&self) -> Self {
        Self {
            correlation_id: self.correlation_id,
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }
}

impl Default for ResolveContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_pending() {
        let t = Task::new("echo", serde_json::json!({"msg": "hi"}));
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.result.is_none());
        assert!(t.error.is_none());
    }

    #[test]
    fn succeed_sets_result_and_clears_error() {
        let t = Task::new("echo", serde_json::json!({}))
            .fail(TaskError::new(ErrorKind::Network, "boom"))
            .succeed(serde_json::json!({"ok": true}));
        assert!(t.is_success());
        assert!(t.error.is_none());
        assert_eq!(t.result, Some(serde_json::json!({"ok": true})));
    }

    #[test]
    fn fail_sets_error_and_clears_result() {
        let t = Task::new("echo", serde_json::json!({}))
            .succeed(serde_json::json!({"ok": true}))
            .fail(TaskError::new(ErrorKind::Timeout, "too slow"));
        assert!(!t.is_success());
        assert!(t.result.is_none());
        assert_eq!(t.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn task_error_default_retryability_follows_kind() {
        let e = TaskError::new(ErrorKind::Network, "down");
        assert!(e.retryable);
        let e = TaskError::new(ErrorKind::Validation, "bad input");
        assert!(!e.retryable);
    }

    #[test]
    fn context_child_shares_deadline_but_own_cancellation() {
        let parent = ResolveContext::new().with_timeout(Duration::from_secs(5));
        let child = parent.child();
        assert_eq!(parent.correlation_id, child.correlation_id);
        assert!(!child.is_cancelled());
        parent.cancellation.cancel();
        // child tokens inherit cancellation from their parent
        assert!(child.is_cancelled());
    }
}
