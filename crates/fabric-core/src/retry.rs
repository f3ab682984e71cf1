//! The Retry Engine (spec component C2): drives repeated resolve attempts
//! with a configurable backoff strategy, generalizing the corpus's
//! provider-retry decorator pattern (constant/linear/exponential/fibonacci
//! backoff tables with optional jitter) to the fabric's closed
//! [`fabric_db::models::ErrorKind`] set.

use std::sync::Arc;
use std::time::Duration;

use fabric_db::models::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::resolver::Resolver;
use crate::task::{ResolveContext, Task, TaskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
    Fibonacci,
    Jittered,
}

/// Retry policy: attempt budget, backoff shape, and which error kinds are
/// worth retrying.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    retryable: Arc<dyn Fn(ErrorKind) -> bool + Send + Sync>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            retryable: Arc::new(ErrorKind::default_retryable),
        }
    }

    pub fn base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn jitter_factor(mut self, f: f64) -> Self {
        self.jitter_factor = f;
        self
    }

    /// Override which error kinds are considered worth retrying.
    pub fn retryable_when(mut self, f: impl Fn(ErrorKind) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Arc::new(f);
        self
    }

    fn is_retryable(&self, error: &TaskError) -> bool {
        error.retryable && (self.retryable)(error.kind)
    }

    /// Delay to sleep *before* the given attempt number (1-indexed),
    /// clamped to `max_delay`. Attempt 1 never sleeps -- the caller skips
    /// this for the first try.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let n = attempt.max(1) as u64;
        let unclamped = match self.strategy {
            BackoffStrategy::Constant => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * n as u32,
            BackoffStrategy::Exponential | BackoffStrategy::Jittered => {
                let factor = 1u64.checked_shl((n - 1).min(32) as u32).unwrap_or(u64::MAX);
                self.base_delay.saturating_mul(factor.min(u32::MAX as u64) as u32)
            }
            BackoffStrategy::Fibonacci => {
                let fib = fibonacci(n);
                self.base_delay.saturating_mul(fib.min(u32::MAX as u64) as u32)
            }
        };
        let clamped = unclamped.min(self.max_delay);
        if self.strategy == BackoffStrategy::Jittered {
            jitter(clamped, self.jitter_factor)
        } else {
            clamped
        }
    }
}

fn fibonacci(n: u64) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

fn jitter(base: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return base;
    }
    let factor = factor.min(1.0);
    let millis = base.as_millis() as f64;
    let spread = millis * factor;
    let delta = rand::rng().random_range(-spread..=spread);
    let jittered = (millis + delta).max(0.0);
    Duration::from_millis(jittered as u64)
}

/// Drive `resolver` through up to `policy.max_attempts` resolve attempts.
///
/// Stops early on success, on a non-retryable error, when `ctx` is
/// cancelled, or when `ctx`'s deadline would be exceeded by the next
/// sleep. A panicking resolver is caught via a spawned task boundary and
/// turned into an `ErrorKind::Internal` task error rather than unwinding
/// into the caller.
pub async fn call(
    resolver: Arc<dyn Resolver>,
    task: Task,
    ctx: &ResolveContext,
    policy: &RetryPolicy,
) -> Task {
    let mut current = task;
    for attempt in 1..=policy.max_attempts {
        if ctx.is_cancelled() {
            return current.fail(TaskError::new(ErrorKind::Cancelled, "cancelled before attempt"));
        }
        if attempt > 1 {
            let delay = policy.delay_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => {
                    return current.fail(TaskError::new(ErrorKind::Cancelled, "cancelled during backoff"));
                }
            }
        }

        current.attempt = attempt;
        let attempt_task = current.clone();
        let resolver = Arc::clone(&resolver);
        let ctx_owned = ctx.child();

        let joined = tokio::spawn(async move { resolver.resolve(attempt_task, &ctx_owned).await }).await;

        current = match joined {
            Ok(result) => result,
            Err(join_err) => current.fail(
                TaskError::new(ErrorKind::Internal, "resolver panicked")
                    .with_detail(join_err.to_string()),
            ),
        };

        if current.is_success() {
            info!(task_id = %current.id, attempt, "resolve succeeded");
            return current;
        }

        let Some(error) = current.error.clone() else {
            // A resolver returned a non-success status with no error; treat
            // as terminal rather than looping forever.
            return current;
        };

        if !policy.is_retryable(&error) || attempt == policy.max_attempts {
            warn!(task_id = %current.id, attempt, kind = %error.kind, "giving up");
            return current;
        }
    }
    current
}
