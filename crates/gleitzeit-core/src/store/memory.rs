//! In-memory store: the default backend for tests and embedded use.
//!
//! State lives in a single mutex-guarded map set; no lock is held across an
//! await point. Cloning the handle shares the underlying state, which lets a
//! test restart an engine against "the same database".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{RetryRecord, Task, TaskResult, TaskStatus, Workflow, WorkflowStatus};

use super::{
    apply_status_update, sort_tasks, PendingState, Store, StoreError, TaskStatusUpdate,
};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    tasks: HashMap<String, Task>,
    results: HashMap<String, TaskResult>,
    retries: HashMap<String, RetryRecord>,
}

/// Shared in-memory backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.lock().workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.lock().workflows.get(&id).cloned())
    }

    async fn update_workflow_aggregate(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        completed: u32,
        failed: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let workflow = inner
            .workflows
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("workflow", id.to_string()))?;
        workflow.status = status;
        workflow.completed = completed;
        workflow.failed = failed;
        if completed_at.is_some() {
            workflow.completed_at = completed_at;
        }
        Ok(())
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        self.lock().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("task", id))?;
        apply_status_update(task, status, update);
        Ok(())
    }

    async fn list_tasks_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.workflow_id == Some(workflow_id))
            .cloned()
            .collect();
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    async fn list_tasks_by_status(
        &self,
        status: TaskStatus,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        sort_tasks(&mut tasks);
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn put_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        self.lock()
            .results
            .insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.lock().results.get(task_id).cloned())
    }

    async fn upsert_retry(
        &self,
        task_id: &str,
        fire_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError> {
        self.lock().retries.insert(
            task_id.to_owned(),
            RetryRecord {
                task_id: task_id.to_owned(),
                fire_at,
                attempt,
            },
        );
        Ok(())
    }

    async fn delete_retry(&self, task_id: &str) -> Result<(), StoreError> {
        self.lock().retries.remove(task_id);
        Ok(())
    }

    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        let mut inner = self.lock();
        let due_ids: Vec<String> = inner
            .retries
            .values()
            .filter(|r| r.fire_at <= now)
            .map(|r| r.task_id.clone())
            .collect();
        let mut due: Vec<RetryRecord> = due_ids
            .iter()
            .filter_map(|id| inner.retries.remove(id))
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.task_id.cmp(&b.task_id)));
        Ok(due)
    }

    async fn enumerate_pending_on_startup(&self) -> Result<PendingState, StoreError> {
        let inner = self.lock();
        let mut workflows: Vec<Workflow> = inner
            .workflows
            .values()
            .filter(|w| !w.status.is_terminal())
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut tasks: Vec<Task> = Vec::new();
        for workflow in &workflows {
            tasks.extend(
                inner
                    .tasks
                    .values()
                    .filter(|t| t.workflow_id == Some(workflow.id))
                    .cloned(),
            );
        }
        sort_tasks(&mut tasks);

        let mut retries: Vec<RetryRecord> = inner.retries.values().cloned().collect();
        retries.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.task_id.cmp(&b.task_id)));

        Ok(PendingState {
            workflows,
            tasks,
            retries,
        })
    }
}
