//! PostgreSQL implementation of the core `Store` contract.
//!
//! All queries are runtime-checked (`sqlx::query_as` with binds), so no
//! database is required at compile time. Connection-level failures map to
//! transient store errors; constraint and decode failures are integrity
//! errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use gleitzeit_core::model::{RetryRecord, Task, TaskResult, TaskStatus, Workflow, WorkflowStatus};
use gleitzeit_core::store::{PendingState, Store, StoreError, TaskStatusUpdate};

use crate::models::{error_to_json, RetryRow, TaskResultRow, TaskRow, WorkflowRow};

/// `Store` backend over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Classify a sqlx failure for the store contract.
fn store_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => StoreError::Integrity(db.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_) => StoreError::Integrity(e.to_string()),
        _ => StoreError::Transient(e.to_string()),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflows \
               (id, name, description, tasks, status, failure_strategy, \
                total, completed, failed, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (id) DO UPDATE SET \
               name = EXCLUDED.name, \
               description = EXCLUDED.description, \
               tasks = EXCLUDED.tasks, \
               status = EXCLUDED.status, \
               failure_strategy = EXCLUDED.failure_strategy, \
               total = EXCLUDED.total, \
               completed = EXCLUDED.completed, \
               failed = EXCLUDED.failed, \
               completed_at = EXCLUDED.completed_at",
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.tasks)
        .bind(workflow.status.to_string())
        .bind(workflow.failure_strategy.to_string())
        .bind(workflow.total as i32)
        .bind(workflow.completed as i32)
        .bind(workflow.failed as i32)
        .bind(workflow.created_at)
        .bind(workflow.completed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(Workflow::try_from).transpose()
    }

    async fn update_workflow_aggregate(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        completed: u32,
        failed: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE workflows \
             SET status = $1, completed = $2, failed = $3, \
                 completed_at = COALESCE($4, completed_at) \
             WHERE id = $5",
        )
        .bind(status.to_string())
        .bind(completed as i32)
        .bind(failed as i32)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workflow", id.to_string()));
        }
        Ok(())
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let retry = serde_json::to_value(&task.retry)
            .map_err(|e| StoreError::Integrity(format!("retry policy encode: {e}")))?;
        let error = task.error.as_ref().map(error_to_json).transpose()?;
        sqlx::query(
            "INSERT INTO tasks \
               (id, workflow_id, local_id, name, protocol, method, params, \
                dependencies, priority, timeout_secs, retry, status, attempt, \
                error, created_at, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
                     $14, $15, $16, $17) \
             ON CONFLICT (id) DO UPDATE SET \
               params = EXCLUDED.params, \
               status = EXCLUDED.status, \
               attempt = EXCLUDED.attempt, \
               error = EXCLUDED.error, \
               started_at = EXCLUDED.started_at, \
               completed_at = EXCLUDED.completed_at",
        )
        .bind(&task.id)
        .bind(task.workflow_id)
        .bind(&task.local_id)
        .bind(&task.name)
        .bind(&task.protocol)
        .bind(&task.method)
        .bind(&task.params)
        .bind(&task.dependencies)
        .bind(task.priority.to_string())
        .bind(task.timeout_secs.map(|t| t as i64))
        .bind(retry)
        .bind(task.status.to_string())
        .bind(task.attempt as i32)
        .bind(error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(Task::try_from).transpose()
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError> {
        let error = update.error.as_ref().map(error_to_json).transpose()?;
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = $1, \
                 attempt = COALESCE($2, attempt), \
                 started_at = COALESCE($3, started_at), \
                 completed_at = COALESCE($4, completed_at), \
                 error = COALESCE($5, error) \
             WHERE id = $6",
        )
        .bind(status.to_string())
        .bind(update.attempt.map(|a| a as i32))
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", id));
        }
        Ok(())
    }

    async fn list_tasks_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT $2",
        )
        .bind(status.to_string())
        .bind(limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(Task::try_from).collect()
    }

    async fn put_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        let error = result.error.as_ref().map(error_to_json).transpose()?;
        sqlx::query(
            "INSERT INTO task_results \
               (task_id, workflow_id, status, result, error, duration_ms, \
                provider_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (task_id) DO UPDATE SET \
               status = EXCLUDED.status, \
               result = EXCLUDED.result, \
               error = EXCLUDED.error, \
               duration_ms = EXCLUDED.duration_ms, \
               provider_id = EXCLUDED.provider_id, \
               created_at = EXCLUDED.created_at",
        )
        .bind(&result.task_id)
        .bind(result.workflow_id)
        .bind(result.status.to_string())
        .bind(&result.result)
        .bind(error)
        .bind(result.duration_ms.map(|d| d as i64))
        .bind(&result.provider_id)
        .bind(result.created_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        let row =
            sqlx::query_as::<_, TaskResultRow>("SELECT * FROM task_results WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_err)?;
        row.map(TaskResult::try_from).transpose()
    }

    async fn upsert_retry(
        &self,
        task_id: &str,
        fire_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO retries (task_id, fire_at, attempt) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (task_id) DO UPDATE SET \
               fire_at = EXCLUDED.fire_at, \
               attempt = EXCLUDED.attempt",
        )
        .bind(task_id)
        .bind(fire_at)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn delete_retry(&self, task_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM retries WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        let rows = sqlx::query_as::<_, RetryRow>(
            "DELETE FROM retries WHERE fire_at <= $1 RETURNING task_id, fire_at, attempt",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let mut due: Vec<RetryRecord> = rows.into_iter().map(RetryRecord::from).collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(due)
    }

    async fn enumerate_pending_on_startup(&self) -> Result<PendingState, StoreError> {
        let workflow_rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE status = 'running' \
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let workflows: Vec<Workflow> = workflow_rows
            .into_iter()
            .map(Workflow::try_from)
            .collect::<Result<_, _>>()?;

        let task_rows = sqlx::query_as::<_, TaskRow>(
            "SELECT t.* FROM tasks t \
             JOIN workflows w ON w.id = t.workflow_id \
             WHERE w.status = 'running' \
             ORDER BY t.created_at ASC, t.id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let tasks: Vec<Task> = task_rows
            .into_iter()
            .map(Task::try_from)
            .collect::<Result<_, _>>()?;

        let retry_rows = sqlx::query_as::<_, RetryRow>(
            "SELECT * FROM retries ORDER BY fire_at ASC, task_id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        let retries = retry_rows.into_iter().map(RetryRecord::from).collect();

        Ok(PendingState {
            workflows,
            tasks,
            retries,
        })
    }
}
