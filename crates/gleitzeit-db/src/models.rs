//! Row structs mirroring the SQL schema, plus conversions to and from the
//! core model types.
//!
//! Status and priority columns hold the snake_case identifiers emitted by
//! the core `Display` impls; decoding goes through `FromStr`, so a row with
//! an unknown identifier surfaces as an integrity error rather than a panic.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use gleitzeit_core::model::{RetryRecord, Task, TaskResult, Workflow};
use gleitzeit_core::store::StoreError;

fn integrity(context: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Integrity(format!("{context}: {detail}"))
}

/// A row of the `workflows` table.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub tasks: Vec<String>,
    pub status: String,
    pub failure_strategy: String,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(Workflow {
            id: row.id,
            name: row.name,
            description: row.description,
            tasks: row.tasks,
            status: row
                .status
                .parse()
                .map_err(|e| integrity("workflow status", e))?,
            failure_strategy: row
                .failure_strategy
                .parse()
                .map_err(|e| integrity("failure strategy", e))?,
            total: row.total as u32,
            completed: row.completed as u32,
            failed: row.failed as u32,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// A row of the `tasks` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub workflow_id: Option<Uuid>,
    pub local_id: String,
    pub name: Option<String>,
    pub protocol: String,
    pub method: String,
    pub params: Value,
    pub dependencies: Vec<String>,
    pub priority: String,
    pub timeout_secs: Option<i64>,
    pub retry: Value,
    pub status: String,
    pub attempt: i32,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            workflow_id: row.workflow_id,
            local_id: row.local_id,
            name: row.name,
            protocol: row.protocol,
            method: row.method,
            params: row.params,
            dependencies: row.dependencies,
            priority: row
                .priority
                .parse()
                .map_err(|e| integrity("task priority", e))?,
            timeout_secs: row.timeout_secs.map(|t| t as u64),
            retry: serde_json::from_value(row.retry)
                .map_err(|e| integrity("retry policy", e))?,
            status: row.status.parse().map_err(|e| integrity("task status", e))?,
            attempt: row.attempt as u32,
            error: row
                .error
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| integrity("task error", e))?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// A row of the `task_results` table.
#[derive(Debug, Clone, FromRow)]
pub struct TaskResultRow {
    pub task_id: String,
    pub workflow_id: Option<Uuid>,
    pub status: String,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub duration_ms: Option<i64>,
    pub provider_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskResultRow> for TaskResult {
    type Error = StoreError;

    fn try_from(row: TaskResultRow) -> Result<Self, Self::Error> {
        Ok(TaskResult {
            task_id: row.task_id,
            workflow_id: row.workflow_id,
            status: row
                .status
                .parse()
                .map_err(|e| integrity("result status", e))?,
            result: row.result,
            error: row
                .error
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| integrity("result error", e))?,
            duration_ms: row.duration_ms.map(|d| d as u64),
            provider_id: row.provider_id,
            created_at: row.created_at,
        })
    }
}

/// A row of the `retries` table.
#[derive(Debug, Clone, FromRow)]
pub struct RetryRow {
    pub task_id: String,
    pub fire_at: DateTime<Utc>,
    pub attempt: i32,
}

impl From<RetryRow> for RetryRecord {
    fn from(row: RetryRow) -> Self {
        RetryRecord {
            task_id: row.task_id,
            fire_at: row.fire_at,
            attempt: row.attempt as u32,
        }
    }
}

/// Serialize a core error value for the `error` JSONB column.
pub(crate) fn error_to_json(
    error: &gleitzeit_core::error::TaskError,
) -> Result<Value, StoreError> {
    serde_json::to_value(error).map_err(|e| integrity("task error encode", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_row_roundtrips_through_core_type() {
        let row = TaskRow {
            id: "wf:t1".to_owned(),
            workflow_id: Some(Uuid::new_v4()),
            local_id: "t1".to_owned(),
            name: None,
            protocol: "llm/v1".to_owned(),
            method: "chat".to_owned(),
            params: json!({"prompt": "hi"}),
            dependencies: vec![],
            priority: "high".to_owned(),
            timeout_secs: Some(60),
            retry: json!({"max_attempts": 2}),
            status: "queued".to_owned(),
            attempt: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let task = Task::try_from(row).expect("should convert");
        assert_eq!(task.priority, gleitzeit_core::model::Priority::High);
        assert_eq!(task.retry.max_attempts, 2);
        assert_eq!(task.timeout_secs, Some(60));
    }

    #[test]
    fn unknown_status_is_an_integrity_error() {
        let row = WorkflowRow {
            id: Uuid::new_v4(),
            name: "bad".to_owned(),
            description: None,
            tasks: vec![],
            status: "limbo".to_owned(),
            failure_strategy: "fail_fast".to_owned(),
            total: 0,
            completed: 0,
            failed: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        let err = Workflow::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }
}
