//! Offline workflow commands: validate, submit, status, result, cancel.
//!
//! These talk to the store directly. `submit` persists the workflow in
//! `queued` state; a `serve` process picks it up during startup recovery.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use uuid::Uuid;

use gleitzeit_core::error::{ErrorCode, TaskError};
use gleitzeit_core::ingest::{self, WorkflowDocument};
use gleitzeit_core::model::{qualified_task_id, TaskStatus, WorkflowStatus};
use gleitzeit_core::store::{Store, TaskStatusUpdate};

/// Load a workflow document from a TOML (default) or JSON file.
pub fn load_document(path: &str) -> Result<WorkflowDocument> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file {path}"))?;
    let doc = if Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    {
        ingest::parse_document_json(&contents)
            .with_context(|| format!("failed to parse JSON workflow {path}"))?
    } else {
        ingest::parse_document_toml(&contents)
            .with_context(|| format!("failed to parse TOML workflow {path}"))?
    };
    Ok(doc)
}

/// `gleitzeit validate <file>`: parse, expand, and validate without
/// persisting anything.
pub fn run_validate(file: &str) -> Result<()> {
    let doc = load_document(file)?;
    let materialized = ingest::materialize(&doc)?;

    println!("{}: OK", doc.name);
    println!("  tasks: {}", materialized.tasks.len());
    println!(
        "  initially ready: {}",
        materialized.initially_ready().len()
    );
    Ok(())
}

/// `gleitzeit submit <file>`: validate and persist in queued state.
pub async fn run_submit(store: &Arc<dyn Store>, file: &str) -> Result<Uuid> {
    let doc = load_document(file)?;
    let materialized = ingest::materialize(&doc)?;

    store.put_workflow(&materialized.workflow).await?;
    for task in &materialized.tasks {
        store.put_task(task).await?;
    }

    println!("{}", materialized.workflow.id);
    Ok(materialized.workflow.id)
}

/// `gleitzeit status <workflow-id>`: print the aggregate and per-task view.
pub async fn run_status(store: &Arc<dyn Store>, workflow_id: &str) -> Result<()> {
    let workflow_id: Uuid = workflow_id
        .parse()
        .with_context(|| format!("invalid workflow id {workflow_id:?}"))?;
    let Some(workflow) = store.get_workflow(workflow_id).await? else {
        bail!("workflow {workflow_id} not found");
    };
    let tasks = store.list_tasks_by_workflow(workflow_id).await?;

    println!("{} ({})", workflow.name, workflow.id);
    println!(
        "  status: {}  completed: {}/{}  failed: {}",
        workflow.status, workflow.completed, workflow.total, workflow.failed
    );
    println!();
    println!("  {:<24} {:<10} {:>7}  {}", "TASK", "STATUS", "ATTEMPT", "ERROR");
    for task in tasks {
        let error = task
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_default();
        println!(
            "  {:<24} {:<10} {:>7}  {}",
            task.local_id, task.status, task.attempt, error
        );
    }
    Ok(())
}

/// `gleitzeit result <workflow-id> <task-id>`: print the canonical result.
pub async fn run_result(store: &Arc<dyn Store>, workflow_id: &str, task_id: &str) -> Result<()> {
    let workflow_id: Uuid = workflow_id
        .parse()
        .with_context(|| format!("invalid workflow id {workflow_id:?}"))?;
    let qualified = qualified_task_id(&workflow_id, task_id);
    let Some(result) = store.get_result(&qualified).await? else {
        bail!("no result for task {task_id} in workflow {workflow_id}");
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// `gleitzeit cancel <workflow-id>`: offline cancellation of every
/// non-terminal task. A concurrently running `serve` should be cancelled
/// over its HTTP surface instead.
pub async fn run_cancel(store: &Arc<dyn Store>, workflow_id: &str) -> Result<()> {
    let workflow_id: Uuid = workflow_id
        .parse()
        .with_context(|| format!("invalid workflow id {workflow_id:?}"))?;
    let Some(workflow) = store.get_workflow(workflow_id).await? else {
        bail!("workflow {workflow_id} not found");
    };
    if workflow.status.is_terminal() {
        println!("workflow {workflow_id} is already {}", workflow.status);
        return Ok(());
    }

    let now = Utc::now();
    let mut cancelled = 0usize;
    for task in store.list_tasks_by_workflow(workflow_id).await? {
        if task.status.is_terminal() {
            continue;
        }
        store
            .update_task_status(
                &task.id,
                TaskStatus::Cancelled,
                TaskStatusUpdate {
                    completed_at: Some(now),
                    error: Some(TaskError::new(ErrorCode::Cancelled, "workflow cancelled")),
                    ..TaskStatusUpdate::default()
                },
            )
            .await?;
        store.delete_retry(&task.id).await?;
        cancelled += 1;
    }
    store
        .update_workflow_aggregate(
            workflow_id,
            WorkflowStatus::Cancelled,
            workflow.completed,
            workflow.failed,
            Some(now),
        )
        .await?;

    println!("cancelled {cancelled} task(s) in workflow {workflow_id}");
    Ok(())
}
