//! Workflow ingestion: validation, batch expansion, and materialization of a
//! document into persistable entities.
//!
//! Validation rejects the whole document before anything is persisted;
//! materialization assigns the workflow id and the qualified task ids. The
//! engine (or an offline `submit`) persists the result in `queued` status
//! and seeds the ready queue.

pub mod document;

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::graph::DependencyGraph;
use crate::model::{
    qualified_task_id, FailureStrategy, Priority, Task, TaskStatus, Workflow, WorkflowStatus,
};
use crate::retry::RetryPolicy;
use crate::substitution;

pub use document::{parse_document_json, parse_document_toml, BatchSpec, TaskDocument, WorkflowDocument};

/// Errors that reject a workflow document.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("workflow must contain at least one task")]
    NoTasks,

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskId(String),

    #[error("invalid task id {0:?} (expected [A-Za-z0-9_-]+)")]
    InvalidTaskId(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("invalid priority {value:?} on task {task:?} (expected urgent, high, normal, or low)")]
    InvalidPriority { task: String, value: String },

    #[error("invalid failure strategy {0:?} (expected fail_fast or continue_on_error)")]
    InvalidFailureStrategy(String),

    #[error("invalid retry policy on task {task:?}: {reason}")]
    InvalidRetryPolicy { task: String, reason: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("malformed params on task {task:?}: {reason}")]
    MalformedParams { task: String, reason: String },

    #[error("batch workflow is missing its {0} section")]
    MissingBatchSection(&'static str),

    #[error("failed to scan batch directory {directory:?}: {reason}")]
    BatchScanFailed { directory: String, reason: String },

    #[error("batch pattern {pattern:?} matched no files under {directory:?}")]
    EmptyBatch { directory: String, pattern: String },
}

impl ValidationError {
    /// The wire code this rejection surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CycleDetected(_) => ErrorCode::WorkflowCircularDependency,
            _ => ErrorCode::WorkflowValidationFailed,
        }
    }
}

/// A validated document turned into persistable entities.
#[derive(Debug, Clone)]
pub struct MaterializedWorkflow {
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
}

impl MaterializedWorkflow {
    /// Qualified ids of tasks with no dependencies, in document order.
    pub fn initially_ready(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.id.clone())
            .collect()
    }
}

fn valid_local_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a concrete (already batch-expanded) document.
pub fn validate(doc: &WorkflowDocument) -> Result<(), ValidationError> {
    if let Some(strategy) = &doc.on_failure {
        strategy
            .parse::<FailureStrategy>()
            .map_err(|_| ValidationError::InvalidFailureStrategy(strategy.clone()))?;
    }

    if doc.tasks.is_empty() {
        return Err(ValidationError::NoTasks);
    }

    let mut seen = HashSet::new();
    for task in &doc.tasks {
        if !valid_local_id(&task.id) {
            return Err(ValidationError::InvalidTaskId(task.id.clone()));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(ValidationError::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in &doc.tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if let Some(priority) = &task.priority {
            priority
                .parse::<Priority>()
                .map_err(|_| ValidationError::InvalidPriority {
                    task: task.id.clone(),
                    value: priority.clone(),
                })?;
        }

        if let Some(retry) = &task.retry {
            if retry.max_attempts < 1 {
                return Err(ValidationError::InvalidRetryPolicy {
                    task: task.id.clone(),
                    reason: "max_attempts must be at least 1".to_owned(),
                });
            }
            if retry.base_delay_secs < 0.0 {
                return Err(ValidationError::InvalidRetryPolicy {
                    task: task.id.clone(),
                    reason: "base_delay_secs must not be negative".to_owned(),
                });
            }
        }

        substitution::validate_tokens(&task.params).map_err(|e| {
            ValidationError::MalformedParams {
                task: task.id.clone(),
                reason: e.to_string(),
            }
        })?;
    }

    // Cycle check over document-local ids, so the reported path reads the
    // way the author wrote it.
    let graph = DependencyGraph::from_edges(
        doc.tasks
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone())),
    )
    .map_err(|e| match e {
        crate::graph::GraphError::DuplicateNode(id) => ValidationError::DuplicateTaskId(id),
        crate::graph::GraphError::UnknownDependency { task, dependency } => {
            ValidationError::UnknownDependency { task, dependency }
        }
    })?;
    if let Some(cycle) = graph.find_cycle() {
        return Err(ValidationError::CycleDetected(cycle));
    }

    Ok(())
}

/// Match a filename against a `*`-wildcard pattern.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = name;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            let Some(pos) = rest.find(part) else {
                return false;
            };
            rest = &rest[pos + part.len()..];
        }
    }
    // Pattern ended with '*'.
    true
}

/// Expand a `type = "batch"` document into concrete tasks, one per matching
/// file. Each task receives the discovered path in its `path` parameter and
/// an id of `<template_id>-<file_stem>`.
pub fn expand_batch(doc: &WorkflowDocument) -> Result<WorkflowDocument, ValidationError> {
    if doc.kind.as_deref() != Some("batch") {
        return Ok(doc.clone());
    }
    let batch = doc
        .batch
        .as_ref()
        .ok_or(ValidationError::MissingBatchSection("batch"))?;
    let template = doc
        .template
        .as_ref()
        .ok_or(ValidationError::MissingBatchSection("template"))?;

    let entries = std::fs::read_dir(&batch.directory).map_err(|e| {
        ValidationError::BatchScanFailed {
            directory: batch.directory.clone(),
            reason: e.to_string(),
        }
    })?;

    let mut files: Vec<String> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ValidationError::BatchScanFailed {
            directory: batch.directory.clone(),
            reason: e.to_string(),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if wildcard_match(&batch.pattern, file_name) {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(ValidationError::EmptyBatch {
            directory: batch.directory.clone(),
            pattern: batch.pattern.clone(),
        });
    }

    let mut expanded = doc.clone();
    expanded.kind = None;
    expanded.batch = None;
    expanded.template = None;
    for file in &files {
        let stem = Path::new(file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let safe_stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();

        let mut task = template.clone();
        task.id = format!("{}-{safe_stem}", template.id);
        if let serde_json::Value::Object(map) = &mut task.params {
            map.insert("path".to_owned(), serde_json::Value::String(file.clone()));
        }
        expanded.tasks.push(task);
    }
    Ok(expanded)
}

/// Validate and turn a document into a [`MaterializedWorkflow`] with a fresh
/// workflow id. Batch documents are expanded first.
pub fn materialize(doc: &WorkflowDocument) -> Result<MaterializedWorkflow, ValidationError> {
    let doc = expand_batch(doc)?;
    validate(&doc)?;

    let workflow_id = Uuid::new_v4();
    let now = Utc::now();
    let failure_strategy = doc
        .on_failure
        .as_deref()
        .map(|s| s.parse::<FailureStrategy>())
        .transpose()
        .map_err(|e| ValidationError::InvalidFailureStrategy(e.0))?
        .unwrap_or_default();

    let tasks: Vec<Task> = doc
        .tasks
        .iter()
        .map(|t| Task {
            id: qualified_task_id(&workflow_id, &t.id),
            workflow_id: Some(workflow_id),
            local_id: t.id.clone(),
            name: t.name.clone(),
            protocol: t.protocol.clone(),
            method: t.method.clone(),
            params: t.params.clone(),
            dependencies: t
                .dependencies
                .iter()
                .map(|dep| qualified_task_id(&workflow_id, dep))
                .collect(),
            priority: t
                .priority
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or_default(),
            timeout_secs: t.timeout,
            retry: t.retry.clone().unwrap_or_else(RetryPolicy::default),
            status: TaskStatus::Queued,
            attempt: 0,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        })
        .collect();

    let workflow = Workflow {
        id: workflow_id,
        name: doc.name.clone(),
        description: doc.description.clone(),
        tasks: tasks.iter().map(|t| t.id.clone()).collect(),
        status: WorkflowStatus::Running,
        failure_strategy,
        total: tasks.len() as u32,
        completed: 0,
        failed: 0,
        created_at: now,
        completed_at: None,
    };

    Ok(MaterializedWorkflow { workflow, tasks })
}
