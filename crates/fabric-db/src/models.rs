use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The closed set of error kinds a [`crate::models::TaskError`] may carry.
///
/// Retryability defaults (see `ErrorKind::default_retryable`) reflect whether
/// a fresh attempt is likely to succeed without any other state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Network,
    Authentication,
    RateLimit,
    Timeout,
    Resource,
    Configuration,
    Dependency,
    State,
    BusinessLogic,
    Internal,
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind is retryable absent an explicit policy override.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::Timeout | Self::Resource | Self::Internal
        )
    }

    /// Monitoring API status-code mapping (spec §7).
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Validation => 400,
            Self::Authentication => 401,
            Self::RateLimit => 429,
            Self::State => 409,
            Self::Resource | Self::Dependency => 503,
            Self::Network | Self::Timeout | Self::Configuration | Self::BusinessLogic => 400,
            Self::Internal => 500,
            Self::Cancelled => 499,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Resource => "resource",
            Self::Configuration => "configuration",
            Self::Dependency => "dependency",
            Self::State => "state",
            Self::BusinessLogic => "business_logic",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorKind {
    type Err = ErrorKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_found" => Ok(Self::NotFound),
            "validation" => Ok(Self::Validation),
            "network" => Ok(Self::Network),
            "authentication" => Ok(Self::Authentication),
            "rate_limit" => Ok(Self::RateLimit),
            "timeout" => Ok(Self::Timeout),
            "resource" => Ok(Self::Resource),
            "configuration" => Ok(Self::Configuration),
            "dependency" => Ok(Self::Dependency),
            "state" => Ok(Self::State),
            "business_logic" => Ok(Self::BusinessLogic),
            "internal" => Ok(Self::Internal),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ErrorKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorKind`] string.
#[derive(Debug, Clone)]
pub struct ErrorKindParseError(pub String);

impl fmt::Display for ErrorKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error kind: {:?}", self.0)
    }
}

impl std::error::Error for ErrorKindParseError {}

// ---------------------------------------------------------------------------

/// Terminal/non-terminal status of a [`crate::models::Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single step within a running [`crate::models::Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StepStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StepStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepStatus`] string.
#[derive(Debug, Clone)]
pub struct StepStatusParseError(pub String);

impl fmt::Display for StepStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step status: {:?}", self.0)
    }
}

impl std::error::Error for StepStatusParseError {}

// ---------------------------------------------------------------------------

/// Terminal/non-terminal status of a whole Mastery [`crate::models::Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Default for PlanStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Severity of an [`crate::models::AlertRule`] / open [`crate::models::Alert`].
///
/// Severity is a property of the rule, not of an individual open alert: it
/// is never mutated on an alert already in flight (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for AlertSeverity {
    type Err = AlertSeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(AlertSeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AlertSeverity`] string.
#[derive(Debug, Clone)]
pub struct AlertSeverityParseError(pub String);

impl fmt::Display for AlertSeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid alert severity: {:?}", self.0)
    }
}

impl std::error::Error for AlertSeverityParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of an [`crate::models::Alert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Acknowledged,
    Resolved,
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        };
        f.write_str(s)
    }
}

impl FromStr for AlertState {
    type Err = AlertStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            other => Err(AlertStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AlertState`] string.
#[derive(Debug, Clone)]
pub struct AlertStateParseError(pub String);

impl fmt::Display for AlertStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid alert state: {:?}", self.0)
    }
}

impl std::error::Error for AlertStateParseError {}

// ---------------------------------------------------------------------------

/// The kind of a [`crate::models::MetricSample`], mirrored as its own column
/// so a single table can hold all four monitoring streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    System,
    Health,
    Performance,
    Alert,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::Health => "health",
            Self::Performance => "performance",
            Self::Alert => "alert",
        };
        f.write_str(s)
    }
}

impl FromStr for MetricKind {
    type Err = MetricKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "health" => Ok(Self::Health),
            "performance" => Ok(Self::Performance),
            "alert" => Ok(Self::Alert),
            other => Err(MetricKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MetricKind`] string.
#[derive(Debug, Clone)]
pub struct MetricKindParseError(pub String);

impl fmt::Display for MetricKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid metric kind: {:?}", self.0)
    }
}

impl std::error::Error for MetricKindParseError {}

// ---------------------------------------------------------------------------
// Row structs (metrics.db)
// ---------------------------------------------------------------------------

/// A single recorded metric sample, appended to `metrics.db`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MetricSample {
    pub id: i64,
    pub kind: MetricKind,
    pub name: String,
    pub value: f64,
    pub labels: sqlx::types::Json<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

/// An open or resolved alert, persisted to `metrics.db`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Alert {
    pub id: Uuid,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub state: AlertState,
    pub message: String,
    pub opened_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
