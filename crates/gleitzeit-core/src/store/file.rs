//! Embedded file store: one JSON document per entity under per-keyspace
//! subdirectories.
//!
//! Writes go to a temp file in the same directory followed by a rename, so a
//! crash never leaves a half-written document. A single writer lock keeps
//! read-modify-write updates atomic per call.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{RetryRecord, Task, TaskResult, TaskStatus, Workflow, WorkflowStatus};

use super::{
    apply_status_update, sort_tasks, PendingState, Store, StoreError, TaskStatusUpdate,
};

const WORKFLOWS: &str = "workflows";
const TASKS: &str = "tasks";
const RESULTS: &str = "task_results";
const RETRIES: &str = "retries";

/// Durable store rooted at a local directory.
pub struct FileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for keyspace in [WORKFLOWS, TASKS, RESULTS, RETRIES] {
            tokio::fs::create_dir_all(root.join(keyspace))
                .await
                .map_err(io_err)?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entity ids may contain the `<workflow>:<local>` separator, which is
    /// not a safe filename character everywhere.
    fn file_key(id: &str) -> String {
        id.replace(':', "__")
    }

    fn entity_path(&self, keyspace: &str, id: &str) -> PathBuf {
        self.root.join(keyspace).join(format!("{}.json", Self::file_key(id)))
    }

    async fn read_entity<T: DeserializeOwned>(
        &self,
        keyspace: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let path = self.entity_path(keyspace, id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Integrity(format!("corrupt document {}: {e}", path.display())))
    }

    async fn write_entity<T: Serialize>(
        &self,
        keyspace: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        let path = self.entity_path(keyspace, id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Integrity(format!("failed to serialize {keyspace} entity: {e}")))?;
        tokio::fs::write(&tmp, &bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn delete_entity(&self, keyspace: &str, id: &str) -> Result<(), StoreError> {
        let path = self.entity_path(keyspace, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn read_keyspace<T: DeserializeOwned>(&self, keyspace: &str) -> Result<Vec<T>, StoreError> {
        let dir = self.root.join(keyspace);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(io_err)?;
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::Integrity(format!("corrupt document {}: {e}", path.display()))
            })?;
            out.push(value);
        }
        Ok(out)
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

#[async_trait]
impl Store for FileStore {
    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_entity(WORKFLOWS, &workflow.id.to_string(), workflow)
            .await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        self.read_entity(WORKFLOWS, &id.to_string()).await
    }

    async fn update_workflow_aggregate(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        completed: u32,
        failed: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut workflow: Workflow = self
            .read_entity(WORKFLOWS, &id.to_string())
            .await?
            .ok_or_else(|| StoreError::not_found("workflow", id.to_string()))?;
        workflow.status = status;
        workflow.completed = completed;
        workflow.failed = failed;
        if completed_at.is_some() {
            workflow.completed_at = completed_at;
        }
        self.write_entity(WORKFLOWS, &id.to_string(), &workflow).await
    }

    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_entity(TASKS, &task.id, task).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.read_entity(TASKS, id).await
    }

    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut task: Task = self
            .read_entity(TASKS, id)
            .await?
            .ok_or_else(|| StoreError::not_found("task", id))?;
        apply_status_update(&mut task, status, update);
        self.write_entity(TASKS, id, &task).await
    }

    async fn list_tasks_by_workflow(&self, workflow_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .read_keyspace::<Task>(TASKS)
            .await?
            .into_iter()
            .filter(|t| t.workflow_id == Some(workflow_id))
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
            .read_keyspace::<Task>(TASKS)
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect();
        sort_tasks(&mut tasks);
        if let Some(limit) = limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn put_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_entity(RESULTS, &result.task_id, result).await
    }

    async fn get_result(&self, task_id: &str) -> Result<Option<TaskResult>, StoreError> {
        self.read_entity(RESULTS, task_id).await
    }

    async fn upsert_retry(
        &self,
        task_id: &str,
        fire_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let record = RetryRecord {
            task_id: task_id.to_owned(),
            fire_at,
            attempt,
        };
        self.write_entity(RETRIES, task_id, &record).await
    }

    async fn delete_retry(&self, task_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.delete_entity(RETRIES, task_id).await
    }

    async fn pop_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<RetryRecord>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut due: Vec<RetryRecord> = self
            .read_keyspace::<RetryRecord>(RETRIES)
            .await?
            .into_iter()
            .filter(|r| r.fire_at <= now)
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.task_id.cmp(&b.task_id)));
        for record in &due {
            self.delete_entity(RETRIES, &record.task_id).await?;
        }
        Ok(due)
    }

    async fn enumerate_pending_on_startup(&self) -> Result<PendingState, StoreError> {
        let mut workflows: Vec<Workflow> = self
            .read_keyspace::<Workflow>(WORKFLOWS)
            .await?
            .into_iter()
            .filter(|w| !w.status.is_terminal())
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let live: std::collections::HashSet<Uuid> = workflows.iter().map(|w| w.id).collect();
        let mut tasks: Vec<Task> = self
            .read_keyspace::<Task>(TASKS)
            .await?
            .into_iter()
            .filter(|t| t.workflow_id.is_some_and(|wf| live.contains(&wf)))
            .collect();
        sort_tasks(&mut tasks);

        let mut retries = self.read_keyspace::<RetryRecord>(RETRIES).await?;
        retries.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.task_id.cmp(&b.task_id)));

        Ok(PendingState {
            workflows,
            tasks,
            retries,
        })
    }
}
