//! Core data model: tasks, workflows, results, and their status enums.
//!
//! Every status enum carries a `Display`/`FromStr` pair so the same stable
//! snake_case identifiers are used on the wire, in persistence backends, and
//! in log output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// The transition graph:
///
/// ```text
/// created  -> queued
/// queued   -> ready
/// ready    -> running
/// running  -> completed
/// running  -> failed
/// running  -> retrying
/// retrying -> ready
/// any non-terminal -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Ready,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (the task will never run again).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether a transition from `self` to `to` is a valid edge in the
    /// state graph.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        if !self.is_terminal() && to == Self::Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (Self::Created, Self::Queued)
                | (Self::Queued, Self::Ready)
                | (Self::Ready, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Retrying)
                | (Self::Retrying, Self::Ready)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Retrying => "retrying",
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
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
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

/// Dispatch priority of a task. `Urgent` drains before `High`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    /// Queue-level index: 0 = urgent .. 3 = low.
    pub fn index(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// The next-higher priority, or `self` when already `Urgent`.
    /// Used by the queue's aging promotion.
    pub fn promoted(self) -> Priority {
        match self {
            Self::Urgent | Self::High => Self::Urgent,
            Self::Normal => Self::High,
            Self::Low => Self::Normal,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Aggregate status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
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

impl FromStr for WorkflowStatus {
    type Err = WorkflowStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorkflowStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStatusParseError(pub String);

impl fmt::Display for WorkflowStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStatusParseError {}

// ---------------------------------------------------------------------------

/// How a workflow reacts to a permanently failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// First permanent failure fails the workflow and cancels the rest.
    #[default]
    FailFast,
    /// Only the failed task's dependent closure is cancelled; siblings run on.
    ContinueOnError,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FailFast => "fail_fast",
            Self::ContinueOnError => "continue_on_error",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureStrategy {
    type Err = FailureStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail_fast" => Ok(Self::FailFast),
            "continue_on_error" => Ok(Self::ContinueOnError),
            other => Err(FailureStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailureStrategy`] string.
#[derive(Debug, Clone)]
pub struct FailureStrategyParseError(pub String);

impl fmt::Display for FailureStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure strategy: {:?}", self.0)
    }
}

impl std::error::Error for FailureStrategyParseError {}

// ---------------------------------------------------------------------------

/// Health of a provider session as observed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for HealthState {
    type Err = HealthStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(HealthStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`HealthState`] string.
#[derive(Debug, Clone)]
pub struct HealthStateParseError(pub String);

impl fmt::Display for HealthStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid health state: {:?}", self.0)
    }
}

impl std::error::Error for HealthStateParseError {}

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// Build the globally-unique task id for a workflow member.
///
/// Document-local ids (used in `dependencies` and substitution tokens) are
/// unique only within their workflow; the store key embeds the workflow id.
pub fn qualified_task_id(workflow_id: &Uuid, local_id: &str) -> String {
    format!("{workflow_id}:{local_id}")
}

/// Split a qualified task id back into `(workflow_id, local_id)`.
///
/// Returns `None` for standalone task ids (no workflow prefix).
pub fn split_task_id(id: &str) -> Option<(Uuid, &str)> {
    let (prefix, local) = id.split_once(':')?;
    let workflow_id = Uuid::parse_str(prefix).ok()?;
    Some((workflow_id, local))
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// A task -- a single unit of work routed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally-unique id (`<workflow_id>:<local_id>` for workflow members).
    pub id: String,
    /// Owning workflow. Mandatory for workflow members.
    pub workflow_id: Option<Uuid>,
    /// Document-local id, referenced by sibling `dependencies` and by
    /// substitution tokens.
    pub local_id: String,
    /// Optional human-readable label.
    pub name: Option<String>,
    /// Protocol id, e.g. `llm/v1`.
    pub protocol: String,
    /// Method within the protocol, e.g. `chat`.
    pub method: String,
    /// Parameter tree; string leaves may contain substitution tokens.
    pub params: Value,
    /// Qualified ids of sibling tasks that must complete first.
    pub dependencies: Vec<String>,
    pub priority: Priority,
    /// Per-attempt timeout; the engine default applies when absent.
    pub timeout_secs: Option<u64>,
    pub retry: RetryPolicy,
    pub status: TaskStatus,
    /// Number of dispatch attempts so far (the first attempt counts).
    pub attempt: u32,
    /// Error recorded against the final attempt, if the task failed.
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Per-attempt timeout, falling back to `default` when unset.
    pub fn timeout_or(&self, default_secs: u64) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }
}

/// The canonical outcome of a task's final attempt. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub workflow_id: Option<Uuid>,
    /// `completed` or `failed`.
    pub status: TaskStatus,
    /// Free-form mapping returned by the provider on success.
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub duration_ms: Option<u64>,
    pub provider_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A workflow -- an acyclic graph of tasks submitted and tracked as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Qualified task ids in document order.
    pub tasks: Vec<String>,
    pub status: WorkflowStatus,
    pub failure_strategy: FailureStrategy,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A pending retry as persisted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub task_id: String,
    pub fire_at: DateTime<Utc>,
    /// The attempt count at the time the retry was scheduled.
    pub attempt: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
