//! Persistence contract used by the engine, ingestion, and the retry
//! scheduler.
//!
//! Guarantees required of every backend: per-call atomicity, read-your-writes
//! for a single writer, and durability of any write that returned success.
//! No cross-entity transactions -- the engine re-derives consistency on
//! recovery instead of relying on the write path.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::error::TaskError;
use crate::model::{RetryRecord, Task, TaskResult, TaskStatus, Workflow, WorkflowStatus};

/// Backend failure classification. Transient errors are retryable by the
/// caller; integrity violations are fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient persistence failure: {0}")]
    Transient(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Mutation applied together with a task status change.
#[derive(Debug, Clone, Default)]
pub struct TaskStatusUpdate {
    pub attempt: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
}

/// Everything the engine reloads on startup: non-terminal workflows, all of
/// their tasks, and every pending retry.
#[derive(Debug, Default)]
pub struct PendingState {
    pub workflows: Vec<Workflow>,
    pub tasks: Vec<Task>,
    pub retries: Vec<RetryRecord>,
}

/// Durable storage for workflows, tasks, task results, and the retry
/// schedule.
#[async_trait]
pub trait Store: Send + Sync {
    // -- workflows ----------------------------------------------------------

    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Update a workflow's aggregate status and counters.
    async fn update_workflow_aggregate(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        completed: u32,
        failed: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    // -- tasks --------------------------------------------------------------

    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Point update of a task's status plus attempt/timestamps/error.
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError>;

    /// All tasks of a workflow, ordered by creation time then id.
    async fn list_tasks_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError>;

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, StoreError>;

    // -- results ------------------------------------------------------------

    async fn put_result(&self, result: &TaskResult) -> Result<(), StoreError>;

    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError>;

    // -- retries ------------------------------------------------------------

    /// Persist a scheduled retry. Overwrites any previous entry for the task.
    async fn upsert_retry(
        &self,
        task_id: &str,
        fire_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError>;

    async fn delete_retry(&self, task_id: &str) -> Result<(), StoreError>;

    /// Atomically remove and return every retry due at or before `now`.
    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError>;

    // -- recovery -----------------------------------------------------------

    /// Crash-recovery snapshot; see [`PendingState`].
    async fn enumerate_pending_on_startup(&self) -> Result<PendingState, StoreError>;
}

/// Apply a [`TaskStatusUpdate`] to an owned task. Shared by backends.
pub(crate) fn apply_status_update(task: &mut Task, status: TaskStatus, update: TaskStatusUpdate) {
    task.status = status;
    if let Some(attempt) = update.attempt {
        task.attempt = attempt;
    }
    if update.started_at.is_some() {
        task.started_at = update.started_at;
    }
    if update.completed_at.is_some() {
        task.completed_at = update.completed_at;
    }
    if update.error.is_some() {
        task.error = update.error;
    }
}

/// Deterministic task ordering used by `list_tasks_by_workflow`.
pub(crate) fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
