//! Submitter-facing surface of the engine: a cloneable handle that sends
//! commands into the event loop and exposes the broadcast event stream.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::TaskError;
use crate::ingest::{ValidationError, WorkflowDocument};
use crate::model::{TaskResult, TaskStatus, Workflow};
use crate::registry::ProtocolSpec;
use crate::store::StoreError;

/// Errors surfaced to submitters.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("task {0:?} not found")]
    TaskNotFound(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The ready queue cannot take the workflow's initial tasks right now.
    /// Retryable backpressure; resubmit later.
    #[error("ready queue is full; resubmit later")]
    Backpressure,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("protocol registration failed: {0}")]
    Protocol(String),

    #[error("internal engine error: {0}")]
    Internal(String),

    #[error("engine is shut down")]
    ShutDown,
}

/// Per-task line of a workflow status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusLine {
    pub id: String,
    pub local_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Aggregate view returned by `get_workflow_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub workflow: Workflow,
    pub tasks: Vec<TaskStatusLine>,
}

/// Events published to subscribers while workflows execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowSubmitted {
        workflow_id: Uuid,
    },
    TaskStarted {
        workflow_id: Option<Uuid>,
        task_id: String,
        attempt: u32,
    },
    TaskCompleted {
        workflow_id: Option<Uuid>,
        task_id: String,
    },
    TaskFailed {
        workflow_id: Option<Uuid>,
        task_id: String,
        error: TaskError,
    },
    TaskRetrying {
        workflow_id: Option<Uuid>,
        task_id: String,
        attempt: u32,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
    },
    WorkflowFailed {
        workflow_id: Uuid,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
    },
}

/// Commands accepted by the engine loop.
pub(crate) enum EngineCommand {
    SubmitWorkflow {
        document: Box<WorkflowDocument>,
        reply: oneshot::Sender<Result<Uuid, EngineError>>,
    },
    RegisterProtocol {
        spec: ProtocolSpec,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    WorkflowStatus {
        workflow_id: Uuid,
        reply: oneshot::Sender<Result<WorkflowStatusReport, EngineError>>,
    },
    TaskResult {
        task_id: String,
        reply: oneshot::Sender<Result<Option<TaskResult>, EngineError>>,
    },
    CancelWorkflow {
        workflow_id: Uuid,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    CancelTask {
        task_id: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// Cloneable client handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) commands: mpsc::Sender<EngineCommand>,
    pub(crate) events: broadcast::Sender<WorkflowEvent>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| EngineError::ShutDown)?;
        rx.await.map_err(|_| EngineError::ShutDown)?
    }

    /// Validate, persist, and start a workflow. Returns the new workflow id.
    pub async fn submit_workflow(&self, document: WorkflowDocument) -> Result<Uuid, EngineError> {
        self.request(|reply| EngineCommand::SubmitWorkflow {
            document: Box::new(document),
            reply,
        })
        .await
    }

    /// Register a protocol catalogue. Idempotent per identical definition.
    pub async fn register_protocol(&self, spec: ProtocolSpec) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::RegisterProtocol { spec, reply })
            .await
    }

    pub async fn workflow_status(
        &self,
        workflow_id: Uuid,
    ) -> Result<WorkflowStatusReport, EngineError> {
        self.request(|reply| EngineCommand::WorkflowStatus { workflow_id, reply })
            .await
    }

    /// Fetch the canonical result of a terminal task, by qualified task id.
    pub async fn task_result(
        &self,
        task_id: impl Into<String>,
    ) -> Result<Option<TaskResult>, EngineError> {
        let task_id = task_id.into();
        self.request(|reply| EngineCommand::TaskResult { task_id, reply })
            .await
    }

    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        self.request(|reply| EngineCommand::CancelWorkflow { workflow_id, reply })
            .await
    }

    pub async fn cancel_task(&self, task_id: impl Into<String>) -> Result<(), EngineError> {
        let task_id = task_id.into();
        self.request(|reply| EngineCommand::CancelTask { task_id, reply })
            .await
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }
}
