//! Execution engine: the single event loop that drains the ready queue,
//! dispatches tasks to providers, correlates responses, advances the
//! dependency graph, and drives retries, cancellation, and recovery.
//!
//! All mutable in-memory indices (queue, per-workflow readiness trackers,
//! correlation table, provider registry) live inside this loop; everything
//! else talks to it over channels.

mod handle;

pub use handle::{
    EngineError, EngineHandle, TaskStatusLine, WorkflowEvent, WorkflowStatusReport,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, TaskError};
use crate::graph::{DependencyGraph, ReadinessTracker};
use crate::ingest::{self, WorkflowDocument};
use crate::model::{
    split_task_id, FailureStrategy, Task, TaskResult, TaskStatus, Workflow, WorkflowStatus,
};
use crate::queue::{QueueConfig, QueueError, QueuedTask, ReadyQueue};
use crate::registry::{ProviderRegistry, RegistryConfig, RegistryError};
use crate::scheduler::{RetryFired, RetryScheduler, SchedulerHandle};
use crate::store::{Store, StoreError, TaskStatusUpdate};
use crate::substitution::{self, SubstitutionContext};
use crate::transport::{EventBus, RequestEnvelope, ResponseEnvelope, ResponseStatus, TransportError, TransportEvent};

use handle::EngineCommand;

/// What to do with a task found in `running` state after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Re-queue for a fresh attempt, assuming provider-side idempotency.
    #[default]
    Requeue,
    /// Mark failed so an operator can investigate.
    FailForInvestigation,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum tasks in flight at once (the dispatch semaphore).
    pub max_concurrent_tasks: usize,
    pub queue: QueueConfig,
    pub registry: RegistryConfig,
    /// Applied when a task declares no timeout of its own.
    pub default_timeout_secs: u64,
    /// Delay before re-presenting a task that found no provider.
    pub no_provider_retry_delay: Duration,
    /// Whether `provider_disconnected` failures consume an attempt.
    pub disconnect_consumes_attempt: bool,
    pub recovery: RecoveryPolicy,
    /// Heartbeat cadence expected of providers; two missed intervals
    /// deregister the session.
    pub heartbeat_interval: Duration,
    /// Broadcast buffer for workflow events.
    pub event_buffer: usize,
    /// Bounded backoff for transient persistence failures.
    pub persist_retry_attempts: u32,
    pub persist_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            queue: QueueConfig::default(),
            registry: RegistryConfig::default(),
            default_timeout_secs: 300,
            no_provider_retry_delay: Duration::from_secs(5),
            disconnect_consumes_attempt: true,
            recovery: RecoveryPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            event_buffer: 256,
            persist_retry_attempts: 3,
            persist_retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Internal events produced by the engine's own timers.
#[derive(Debug)]
enum InternalEvent {
    TimeoutFired { correlation_id: Uuid },
}

/// Correlation-table entry for one in-flight request.
struct InFlight {
    task_id: String,
    workflow_id: Option<Uuid>,
    provider_id: String,
    attempt: u32,
    dispatched_at: std::time::Instant,
    timeout_timer: JoinHandle<()>,
}

/// Engine-side state of one live workflow.
struct WorkflowRuntime {
    workflow: Workflow,
    tasks: HashMap<String, Task>,
    tracker: ReadinessTracker,
    cancelled: bool,
}

impl WorkflowRuntime {
    fn build(workflow: Workflow, tasks: Vec<Task>) -> Result<Self> {
        let graph = DependencyGraph::from_edges(
            tasks
                .iter()
                .map(|t| (t.id.clone(), t.dependencies.clone())),
        )
        .context("workflow graph no longer consistent")?;
        let mut tracker = ReadinessTracker::new(graph);
        for task in &tasks {
            if task.status == TaskStatus::Completed {
                tracker.mark_completed(&task.id);
            }
        }
        Ok(Self {
            workflow,
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
            tracker,
            cancelled: false,
        })
    }

    fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }
}

/// The orchestrator. Construct with [`Engine::new`], then drive with
/// [`Engine::run`]; interact through the returned [`EngineHandle`] and
/// [`EventBus`].
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    bus: EventBus,
    registry: ProviderRegistry,
    queue: ReadyQueue,
    scheduler: SchedulerHandle,
    runtimes: HashMap<Uuid, WorkflowRuntime>,
    correlations: HashMap<Uuid, InFlight>,
    /// Running task -> its single correlation id.
    running: HashMap<String, Uuid>,
    commands: mpsc::Receiver<EngineCommand>,
    transport_events: mpsc::Receiver<TransportEvent>,
    retry_events: mpsc::Receiver<RetryFired>,
    internal_events: mpsc::Receiver<InternalEvent>,
    internal_tx: mpsc::Sender<InternalEvent>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl Engine {
    /// Build an engine over `store`. Returns the engine, the submitter
    /// handle, and the provider-facing event bus.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> (Self, EngineHandle, EventBus) {
        let (bus, transport_events) = EventBus::new(config.event_buffer);
        let (command_tx, commands) = mpsc::channel(64);
        let (internal_tx, internal_events) = mpsc::channel(64);
        let (retry_tx, retry_events) = mpsc::channel(64);
        let scheduler = RetryScheduler::spawn(retry_tx);
        let (events, _) = broadcast::channel(config.event_buffer.max(16));

        let engine = Self {
            registry: ProviderRegistry::new(config.registry.clone()),
            queue: ReadyQueue::new(config.queue.clone()),
            config,
            store,
            bus: bus.clone(),
            scheduler,
            runtimes: HashMap::new(),
            correlations: HashMap::new(),
            running: HashMap::new(),
            commands,
            transport_events,
            retry_events,
            internal_events,
            internal_tx,
            events: events.clone(),
        };
        let handle = EngineHandle {
            commands: command_tx,
            events,
        };
        (engine, handle, bus)
    }

    /// Register a protocol before the loop starts (providers connecting
    /// later can also register protocols via the handle).
    pub fn register_protocol(&mut self, spec: crate::registry::ProtocolSpec) -> Result<(), RegistryError> {
        self.registry.register_protocol(spec)
    }

    /// Run the loop until cancellation. Performs crash recovery first.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.recover().await.context("startup recovery failed")?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it.
        heartbeat.tick().await;

        info!("engine loop started");
        loop {
            self.pump_dispatch().await?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("engine loop cancelled");
                    break;
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await?,
                        None => break,
                    }
                }
                event = self.transport_events.recv() => {
                    match event {
                        Some(event) => self.handle_transport(event).await?,
                        None => break,
                    }
                }
                Some(fired) = self.retry_events.recv() => {
                    self.handle_retry_due(fired).await?;
                }
                Some(internal) = self.internal_events.recv() => {
                    self.handle_internal(internal).await?;
                }
                _ = heartbeat.tick() => {
                    self.sweep().await?;
                }
            }
        }

        // Stop timers for anything still in flight.
        for inflight in self.correlations.values() {
            inflight.timeout_timer.abort();
        }
        Ok(())
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Persistence helpers with bounded transient retry
    // -----------------------------------------------------------------------

    async fn persist<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut tries = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && tries + 1 < self.config.persist_retry_attempts => {
                    tries += 1;
                    warn!(error = %e, what, tries, "transient persistence failure, retrying");
                    tokio::time::sleep(self.config.persist_retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn store_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        update: TaskStatusUpdate,
    ) -> Result<(), StoreError> {
        let store = self.store.clone();
        let id = id.to_owned();
        self.persist("task status", move || {
            let store = store.clone();
            let id = id.clone();
            let update = update.clone();
            async move { store.update_task_status(&id, status, update).await }
        })
        .await
    }

    async fn store_result(&self, result: &TaskResult) -> Result<(), StoreError> {
        let store = self.store.clone();
        let result = result.clone();
        self.persist("task result", move || {
            let store = store.clone();
            let result = result.clone();
            async move { store.put_result(&result).await }
        })
        .await
    }

    async fn store_aggregate(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let store = self.store.clone();
        let workflow = workflow.clone();
        self.persist("workflow aggregate", move || {
            let store = store.clone();
            let workflow = workflow.clone();
            async move {
                store
                    .update_workflow_aggregate(
                        workflow.id,
                        workflow.status,
                        workflow.completed,
                        workflow.failed,
                        workflow.completed_at,
                    )
                    .await
            }
        })
        .await
    }

    async fn store_retry(&self, task_id: &str, fire_at: chrono::DateTime<Utc>, attempt: u32) -> Result<(), StoreError> {
        let store = self.store.clone();
        let task_id = task_id.to_owned();
        self.persist("retry schedule", move || {
            let store = store.clone();
            let task_id = task_id.clone();
            async move { store.upsert_retry(&task_id, fire_at, attempt).await }
        })
        .await
    }

    async fn store_delete_retry(&self, task_id: &str) -> Result<(), StoreError> {
        let store = self.store.clone();
        let task_id = task_id.to_owned();
        self.persist("retry removal", move || {
            let store = store.clone();
            let task_id = task_id.clone();
            async move { store.delete_retry(&task_id).await }
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) -> Result<()> {
        match cmd {
            EngineCommand::SubmitWorkflow { document, reply } => {
                let result = self.submit_workflow(*document).await;
                let _ = reply.send(result);
            }
            EngineCommand::RegisterProtocol { spec, reply } => {
                let result = self
                    .registry
                    .register_protocol(spec)
                    .map_err(|e| EngineError::Protocol(e.to_string()));
                let _ = reply.send(result);
            }
            EngineCommand::WorkflowStatus { workflow_id, reply } => {
                let result = self.workflow_status(workflow_id).await;
                let _ = reply.send(result);
            }
            EngineCommand::TaskResult { task_id, reply } => {
                let result = self
                    .store
                    .get_result(&task_id)
                    .await
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineCommand::CancelWorkflow { workflow_id, reply } => {
                let result = self.cancel_workflow(workflow_id).await;
                let _ = reply.send(result);
            }
            EngineCommand::CancelTask { task_id, reply } => {
                let result = self.cancel_task(task_id).await;
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    async fn submit_workflow(&mut self, document: WorkflowDocument) -> Result<Uuid, EngineError> {
        let materialized = ingest::materialize(&document)?;

        // Protocol/method existence is a warning at submission; providers
        // may register later (the dispatch path decides for real).
        for task in &materialized.tasks {
            if let Err(e) = self.registry.method_known(&task.protocol, &task.method) {
                warn!(
                    task_id = %task.id,
                    error = %e,
                    "submitted task names an unregistered operation; dispatch will retry or fail"
                );
            }
        }

        // Backpressure check up front so a rejected submission leaves no
        // partial state behind.
        let ready = materialized.initially_ready();
        if ready.len() > self.queue.remaining_capacity() {
            return Err(EngineError::Backpressure);
        }

        let workflow_id = materialized.workflow.id;
        self.persist("workflow", {
            let store = self.store.clone();
            let workflow = materialized.workflow.clone();
            move || {
                let store = store.clone();
                let workflow = workflow.clone();
                async move { store.put_workflow(&workflow).await }
            }
        })
        .await?;
        for task in &materialized.tasks {
            let store = self.store.clone();
            let task = task.clone();
            self.persist("task", move || {
                let store = store.clone();
                let task = task.clone();
                async move { store.put_task(&task).await }
            })
            .await?;
        }

        let runtime = WorkflowRuntime::build(
            materialized.workflow.clone(),
            materialized.tasks.clone(),
        )
        .map_err(|e| EngineError::Internal(e.to_string()))?;

        // A token referencing a task outside the dependency closure can
        // never resolve; flag it now, even though rejection happens at
        // dispatch time with unresolved_reference.
        for task in runtime.tasks.values() {
            let closure: HashSet<String> = runtime
                .tracker
                .graph()
                .transitive_dependencies(&task.id)
                .into_iter()
                .filter_map(|qualified| {
                    runtime.tasks.get(&qualified).map(|t| t.local_id.clone())
                })
                .collect();
            for referenced in substitution::referenced_tasks(&task.params) {
                if !closure.contains(&referenced) {
                    warn!(
                        task_id = %task.id,
                        referenced = %referenced,
                        "params reference a task outside the dependency closure"
                    );
                }
            }
        }
        self.runtimes.insert(workflow_id, runtime);

        info!(
            workflow_id = %workflow_id,
            tasks = materialized.tasks.len(),
            initially_ready = ready.len(),
            "workflow accepted"
        );
        self.emit(WorkflowEvent::WorkflowSubmitted { workflow_id });

        for task_id in ready {
            self.make_ready(&task_id).await?;
        }
        Ok(workflow_id)
    }

    async fn workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatusReport, EngineError> {
        if let Some(rt) = self.runtimes.get(&workflow_id) {
            let mut tasks: Vec<TaskStatusLine> = rt
                .tasks
                .values()
                .map(|t| TaskStatusLine {
                    id: t.id.clone(),
                    local_id: t.local_id.clone(),
                    status: t.status,
                    attempt: t.attempt,
                    error: t.error.clone(),
                })
                .collect();
            tasks.sort_by(|a, b| a.id.cmp(&b.id));
            return Ok(WorkflowStatusReport {
                workflow: rt.workflow.clone(),
                tasks,
            });
        }

        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        let tasks = self
            .store
            .list_tasks_by_workflow(workflow_id)
            .await?
            .into_iter()
            .map(|t| TaskStatusLine {
                id: t.id,
                local_id: t.local_id,
                status: t.status,
                attempt: t.attempt,
                error: t.error,
            })
            .collect();
        Ok(WorkflowStatusReport { workflow, tasks })
    }

    // -----------------------------------------------------------------------
    // Readiness and dispatch
    // -----------------------------------------------------------------------

    /// Transition a task to `ready` and enqueue it. Falls back to a delayed
    /// re-presentation when the queue is full.
    async fn make_ready(&mut self, task_id: &str) -> Result<(), EngineError> {
        let Some((workflow_id, _)) = split_task_id(task_id) else {
            return Ok(());
        };
        let Some(rt) = self.runtimes.get_mut(&workflow_id) else {
            return Ok(());
        };
        if rt.cancelled {
            return Ok(());
        }
        let Some(task) = rt.tasks.get_mut(task_id) else {
            return Ok(());
        };
        if !matches!(task.status, TaskStatus::Queued | TaskStatus::Retrying) {
            return Ok(());
        }

        let priority = task.priority;
        task.status = TaskStatus::Ready;
        self.store_task_status(task_id, TaskStatus::Ready, TaskStatusUpdate::default())
            .await?;

        match self.queue.push(task_id, Some(workflow_id), priority) {
            Ok(()) => Ok(()),
            Err(QueueError::Duplicate(id)) => {
                warn!(task_id = %id, "task already queued; skipping duplicate enqueue");
                Ok(())
            }
            Err(QueueError::Full { capacity }) => {
                // Internal backpressure: re-present shortly instead of
                // blocking the loop.
                debug!(task_id = %task_id, capacity, "ready queue full, delaying task");
                let attempt = {
                    let rt = self.runtimes.get(&workflow_id).expect("runtime exists");
                    rt.tasks.get(task_id).map(|t| t.attempt).unwrap_or(0)
                };
                self.schedule_requeue(task_id, self.config.no_provider_retry_delay, attempt)
                    .await?;
                Ok(())
            }
        }
    }

    /// Put a task into `retrying` with a scheduled re-presentation, without
    /// touching its attempt budget.
    async fn schedule_requeue(
        &mut self,
        task_id: &str,
        delay: Duration,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let fire_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.store_retry(task_id, fire_at, attempt).await?;
        self.set_task_status_mem(task_id, TaskStatus::Retrying);
        self.store_task_status(task_id, TaskStatus::Retrying, TaskStatusUpdate::default())
            .await?;
        self.scheduler.schedule(task_id, fire_at, attempt).await;
        Ok(())
    }

    fn set_task_status_mem(&mut self, task_id: &str, status: TaskStatus) {
        if let Some((workflow_id, _)) = split_task_id(task_id) {
            if let Some(rt) = self.runtimes.get_mut(&workflow_id) {
                if let Some(task) = rt.tasks.get_mut(task_id) {
                    task.status = status;
                }
            }
        }
    }

    /// Admission-controlled dispatch: drain the queue while under the
    /// concurrency limit.
    async fn pump_dispatch(&mut self) -> Result<()> {
        while self.correlations.len() < self.config.max_concurrent_tasks {
            let Some(next) = self.queue.pop() else {
                break;
            };
            self.dispatch_ready(next).await?;
        }
        Ok(())
    }

    async fn dispatch_ready(&mut self, queued: QueuedTask) -> Result<()> {
        let Some(workflow_id) = queued.workflow_id else {
            return Ok(());
        };
        let task_id = queued.task_id;

        // Snapshot what we need; a stale queue entry is silently dropped.
        let snapshot = {
            let Some(rt) = self.runtimes.get(&workflow_id) else {
                return Ok(());
            };
            if rt.cancelled {
                return Ok(());
            }
            let Some(task) = rt.tasks.get(&task_id) else {
                return Ok(());
            };
            if task.status != TaskStatus::Ready {
                debug!(task_id = %task_id, status = %task.status, "stale queue entry dropped");
                return Ok(());
            }
            task.clone()
        };

        debug_assert!(!self.running.contains_key(&task_id));

        // 1. Parameter substitution against completed dependency results.
        let params = match self.resolve_task_params(workflow_id, &snapshot).await {
            Ok(params) => params,
            Err(error) if error.code == ErrorCode::PersistenceTransient => {
                // The store hiccuped while loading dependency results; pause
                // this task, not the loop.
                warn!(task_id = %task_id, error = %error, "result lookup failed, delaying task");
                self.schedule_requeue(&task_id, self.config.no_provider_retry_delay, snapshot.attempt)
                    .await?;
                return Ok(());
            }
            Err(error) => {
                // Resolution failures are permanent task failures.
                self.fail_task(&task_id, error).await?;
                return Ok(());
            }
        };

        // 2. Provider selection.
        let provider_id = match self.registry.select(&snapshot.protocol, &snapshot.method, &[]) {
            Ok(provider_id) => provider_id,
            Err(e @ RegistryError::NoProviderAvailable { .. }) => {
                debug!(task_id = %task_id, error = %e, "no provider available, delaying task");
                self.schedule_requeue(&task_id, self.config.no_provider_retry_delay, snapshot.attempt)
                    .await?;
                return Ok(());
            }
            Err(e) => {
                self.fail_task(&task_id, TaskError::new(e.code(), e.to_string()))
                    .await?;
                return Ok(());
            }
        };

        // 3. Mark running, correlate, emit the request, arm the timeout.
        let attempt = snapshot.attempt + 1;
        let timeout = snapshot.timeout_or(self.config.default_timeout_secs);
        let correlation_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline_ms = started_at.timestamp_millis() + timeout.as_millis() as i64;

        self.store_task_status(
            &task_id,
            TaskStatus::Running,
            TaskStatusUpdate {
                attempt: Some(attempt),
                started_at: Some(started_at),
                ..TaskStatusUpdate::default()
            },
        )
        .await?;

        let request = RequestEnvelope {
            correlation_id,
            task_id: task_id.clone(),
            attempt,
            protocol: snapshot.protocol.clone(),
            method: snapshot.method.clone(),
            params,
            deadline_ms,
        };

        match self.bus.send_request(&provider_id, request) {
            Ok(()) => {}
            Err(e) => {
                // The session vanished or is saturated between selection and
                // send. Roll the task back and re-present it shortly.
                warn!(task_id = %task_id, provider_id = %provider_id, error = %e, "request send failed, rolling back dispatch");
                self.store_task_status(
                    &task_id,
                    TaskStatus::Retrying,
                    TaskStatusUpdate {
                        attempt: Some(snapshot.attempt),
                        ..TaskStatusUpdate::default()
                    },
                )
                .await?;
                if matches!(e, TransportError::Disconnected(_)) {
                    self.registry.deregister_provider(&provider_id);
                }
                self.set_task_status_mem(&task_id, TaskStatus::Retrying);
                let fire_at = Utc::now()
                    + chrono::Duration::from_std(self.config.no_provider_retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                self.store_retry(&task_id, fire_at, snapshot.attempt).await?;
                self.scheduler.schedule(&task_id, fire_at, snapshot.attempt).await;
                return Ok(());
            }
        }

        // Update in-memory task state.
        if let Some(rt) = self.runtimes.get_mut(&workflow_id) {
            if let Some(task) = rt.tasks.get_mut(&task_id) {
                task.status = TaskStatus::Running;
                task.attempt = attempt;
                task.started_at = Some(started_at);
            }
        }

        self.registry.mark_dispatch(&provider_id);

        let timer_tx = self.internal_tx.clone();
        let timeout_timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timer_tx
                .send(InternalEvent::TimeoutFired { correlation_id })
                .await;
        });

        self.correlations.insert(
            correlation_id,
            InFlight {
                task_id: task_id.clone(),
                workflow_id: Some(workflow_id),
                provider_id: provider_id.clone(),
                attempt,
                dispatched_at: std::time::Instant::now(),
                timeout_timer,
            },
        );
        self.running.insert(task_id.clone(), correlation_id);

        info!(
            task_id = %task_id,
            provider_id = %provider_id,
            attempt,
            correlation_id = %correlation_id,
            "task dispatched"
        );
        self.emit(WorkflowEvent::TaskStarted {
            workflow_id: Some(workflow_id),
            task_id,
            attempt,
        });
        Ok(())
    }

    /// Load completed dependency results and run parameter substitution.
    async fn resolve_task_params(
        &self,
        workflow_id: Uuid,
        task: &Task,
    ) -> Result<Value, TaskError> {
        let closure: Vec<(String, String)> = {
            let rt = self
                .runtimes
                .get(&workflow_id)
                .ok_or_else(|| TaskError::new(ErrorCode::InternalError, "workflow state missing"))?;
            rt.tracker
                .graph()
                .transitive_dependencies(&task.id)
                .into_iter()
                .filter_map(|qualified| {
                    rt.tasks
                        .get(&qualified)
                        .map(|t| (t.local_id.clone(), qualified))
                })
                .collect()
        };

        let mut in_scope: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, Value> = HashMap::new();
        for (local_id, qualified) in &closure {
            in_scope.insert(local_id.clone());
            if let Some(result) = self
                .store
                .get_result(qualified)
                .await
                .map_err(|e| TaskError::new(ErrorCode::PersistenceTransient, e.to_string()))?
            {
                if result.status == TaskStatus::Completed {
                    results.insert(local_id.clone(), result.result.unwrap_or(Value::Null));
                }
            }
        }

        let ctx = SubstitutionContext {
            referrer: &task.local_id,
            in_scope: &in_scope,
            results: &results,
        };
        substitution::resolve_params(&task.params, &ctx)
            .map_err(substitution::SubstitutionError::into_task_error)
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::ProviderConnected {
                provider_id,
                capabilities,
                max_concurrent,
            } => {
                match self
                    .registry
                    .register_provider(&provider_id, capabilities, max_concurrent)
                {
                    Ok(()) => {
                        info!(provider_id = %provider_id, "provider registered");
                    }
                    Err(e) => {
                        warn!(provider_id = %provider_id, error = %e, "provider registration rejected");
                        self.bus.disconnect(&provider_id).await;
                    }
                }
            }
            TransportEvent::ProviderDisconnected { provider_id } => {
                self.handle_provider_disconnect(&provider_id).await?;
            }
            TransportEvent::Response(response) => {
                self.handle_response(response).await?;
            }
            TransportEvent::Heartbeat {
                provider_id,
                active,
                ..
            } => {
                self.registry.record_heartbeat(&provider_id, Some(active));
            }
        }
        Ok(())
    }

    async fn handle_provider_disconnect(&mut self, provider_id: &str) -> Result<()> {
        if self.registry.deregister_provider(provider_id).is_none() {
            return Ok(());
        }
        info!(provider_id = %provider_id, "provider deregistered");

        // Fail every correlation bound to the vanished session.
        let orphaned: Vec<Uuid> = self
            .correlations
            .iter()
            .filter(|(_, inflight)| inflight.provider_id == provider_id)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in orphaned {
            let Some(inflight) = self.correlations.remove(&correlation_id) else {
                continue;
            };
            inflight.timeout_timer.abort();
            self.running.remove(&inflight.task_id);
            let error = TaskError::new(
                ErrorCode::ProviderDisconnected,
                format!("provider {provider_id} disconnected mid-request"),
            );
            self.handle_attempt_failure(
                &inflight.task_id,
                error,
                self.config.disconnect_consumes_attempt,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_response(&mut self, response: ResponseEnvelope) -> Result<()> {
        let Some(inflight) = self.correlations.remove(&response.correlation_id) else {
            // Late, duplicate, or cancelled correlation: log and discard.
            debug!(
                correlation_id = %response.correlation_id,
                "response for unknown correlation discarded"
            );
            return Ok(());
        };
        inflight.timeout_timer.abort();
        self.running.remove(&inflight.task_id);

        let latency_ms = inflight.dispatched_at.elapsed().as_millis() as u64;
        let success = response.status == ResponseStatus::Ok;
        self.registry
            .mark_outcome(&inflight.provider_id, success, latency_ms);

        if success {
            self.complete_task(&inflight, response.result.unwrap_or(Value::Null), latency_ms)
                .await?;
        } else {
            let error = response.error.unwrap_or_else(|| {
                TaskError::new(
                    ErrorCode::TaskExecutionFailed,
                    "provider reported failure without detail",
                )
            });
            self.handle_attempt_failure(&inflight.task_id, error, true)
                .await?;
        }
        Ok(())
    }

    async fn handle_internal(&mut self, event: InternalEvent) -> Result<()> {
        match event {
            InternalEvent::TimeoutFired { correlation_id } => {
                let Some(inflight) = self.correlations.remove(&correlation_id) else {
                    // The response won the race; nothing to do.
                    return Ok(());
                };
                self.running.remove(&inflight.task_id);
                warn!(
                    task_id = %inflight.task_id,
                    provider_id = %inflight.provider_id,
                    attempt = inflight.attempt,
                    "task attempt timed out"
                );
                // Tell the provider to stop, best-effort, and penalise it.
                self.bus.cancel_request(&inflight.provider_id, correlation_id);
                let latency_ms = inflight.dispatched_at.elapsed().as_millis() as u64;
                self.registry
                    .mark_outcome(&inflight.provider_id, false, latency_ms);

                let error = TaskError::new(
                    ErrorCode::TaskTimeout,
                    format!("attempt {} exceeded its deadline", inflight.attempt),
                );
                self.handle_attempt_failure(&inflight.task_id, error, true)
                    .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion / failure / retry
    // -----------------------------------------------------------------------

    async fn complete_task(
        &mut self,
        inflight: &InFlight,
        result: Value,
        latency_ms: u64,
    ) -> Result<()> {
        let task_id = &inflight.task_id;
        let Some(workflow_id) = inflight.workflow_id else {
            return Ok(());
        };
        let completed_at = Utc::now();

        let record = TaskResult {
            task_id: task_id.clone(),
            workflow_id: Some(workflow_id),
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            duration_ms: Some(latency_ms),
            provider_id: Some(inflight.provider_id.clone()),
            created_at: completed_at,
        };
        self.store_result(&record).await?;
        self.store_task_status(
            task_id,
            TaskStatus::Completed,
            TaskStatusUpdate {
                completed_at: Some(completed_at),
                ..TaskStatusUpdate::default()
            },
        )
        .await?;

        let newly_ready = {
            let Some(rt) = self.runtimes.get_mut(&workflow_id) else {
                return Ok(());
            };
            if let Some(task) = rt.tasks.get_mut(task_id) {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(completed_at);
            }
            rt.workflow.completed += 1;
            rt.tracker.mark_completed(task_id)
        };

        {
            let rt = self.runtimes.get(&workflow_id).expect("runtime exists");
            self.store_aggregate(&rt.workflow).await?;
        }

        info!(task_id = %task_id, latency_ms, "task completed");
        self.emit(WorkflowEvent::TaskCompleted {
            workflow_id: Some(workflow_id),
            task_id: task_id.clone(),
        });

        for ready_id in newly_ready {
            self.make_ready(&ready_id).await?;
        }
        self.finalize_if_terminal(workflow_id).await?;
        Ok(())
    }

    /// Apply retry policy to a failed attempt: schedule a retry or fail the
    /// task permanently.
    async fn handle_attempt_failure(
        &mut self,
        task_id: &str,
        error: TaskError,
        consumes_attempt: bool,
    ) -> Result<()> {
        let Some((workflow_id, _)) = split_task_id(task_id) else {
            return Ok(());
        };
        let (attempt, retry_policy) = {
            let Some(rt) = self.runtimes.get_mut(&workflow_id) else {
                return Ok(());
            };
            let Some(task) = rt.tasks.get_mut(task_id) else {
                return Ok(());
            };
            if !consumes_attempt && task.attempt > 0 {
                task.attempt -= 1;
            }
            (task.attempt, task.retry.clone())
        };

        if retry_policy.should_retry(&error, attempt) {
            let delay = retry_policy.jittered_delay_before_attempt(attempt + 1);
            let fire_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            info!(
                task_id = %task_id,
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, retry scheduled"
            );
            self.store_retry(task_id, fire_at, attempt).await?;
            self.set_task_status_mem(task_id, TaskStatus::Retrying);
            self.store_task_status(
                task_id,
                TaskStatus::Retrying,
                TaskStatusUpdate {
                    attempt: Some(attempt),
                    ..TaskStatusUpdate::default()
                },
            )
            .await?;
            self.scheduler.schedule(task_id, fire_at, attempt).await;
            self.emit(WorkflowEvent::TaskRetrying {
                workflow_id: Some(workflow_id),
                task_id: task_id.to_owned(),
                attempt,
            });
        } else {
            self.fail_task(task_id, error).await?;
        }
        Ok(())
    }

    /// Permanently fail a task: persist the error, cancel its dependent
    /// closure, and apply the workflow failure strategy.
    async fn fail_task(&mut self, task_id: &str, error: TaskError) -> Result<()> {
        let Some((workflow_id, _)) = split_task_id(task_id) else {
            return Ok(());
        };
        let completed_at = Utc::now();

        let (dependents, strategy, reached_running) = {
            let Some(rt) = self.runtimes.get_mut(&workflow_id) else {
                return Ok(());
            };
            let Some(task) = rt.tasks.get_mut(task_id) else {
                return Ok(());
            };
            if task.status.is_terminal() {
                return Ok(());
            }
            let reached_running = task.started_at.is_some();
            task.status = TaskStatus::Failed;
            task.completed_at = Some(completed_at);
            task.error = Some(error.clone());
            rt.workflow.failed += 1;
            (
                rt.tracker.graph().transitive_dependents(task_id),
                rt.workflow.failure_strategy,
                reached_running,
            )
        };

        if reached_running {
            let record = TaskResult {
                task_id: task_id.to_owned(),
                workflow_id: Some(workflow_id),
                status: TaskStatus::Failed,
                result: None,
                error: Some(error.clone()),
                duration_ms: None,
                provider_id: None,
                created_at: completed_at,
            };
            self.store_result(&record).await?;
        }
        self.store_task_status(
            task_id,
            TaskStatus::Failed,
            TaskStatusUpdate {
                completed_at: Some(completed_at),
                error: Some(error.clone()),
                ..TaskStatusUpdate::default()
            },
        )
        .await?;

        warn!(task_id = %task_id, error = %error, "task failed permanently");
        self.emit(WorkflowEvent::TaskFailed {
            workflow_id: Some(workflow_id),
            task_id: task_id.to_owned(),
            error: error.clone(),
        });

        // Dependents of a failed task are never dispatched.
        for dependent in dependents {
            self.cancel_single_task(
                &dependent,
                TaskError::new(
                    ErrorCode::Cancelled,
                    format!("upstream_failed: {task_id}"),
                ),
            )
            .await?;
        }

        if strategy == FailureStrategy::FailFast {
            let remaining: Vec<String> = self
                .runtimes
                .get(&workflow_id)
                .map(|rt| {
                    rt.tasks
                        .values()
                        .filter(|t| !t.status.is_terminal())
                        .map(|t| t.id.clone())
                        .collect()
                })
                .unwrap_or_default();
            for other in remaining {
                self.cancel_single_task(
                    &other,
                    TaskError::new(
                        ErrorCode::Cancelled,
                        format!("workflow failed: {task_id}"),
                    ),
                )
                .await?;
            }
        }

        {
            if let Some(rt) = self.runtimes.get(&workflow_id) {
                self.store_aggregate(&rt.workflow).await?;
            }
        }
        self.finalize_if_terminal(workflow_id).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    async fn cancel_task(&mut self, task_id: String) -> Result<(), EngineError> {
        let Some((workflow_id, _)) = split_task_id(&task_id) else {
            return Err(EngineError::TaskNotFound(task_id));
        };
        let dependents = {
            let rt = self
                .runtimes
                .get(&workflow_id)
                .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
            let task = rt
                .tasks
                .get(&task_id)
                .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
            if task.status.is_terminal() {
                return Ok(());
            }
            rt.tracker.graph().transitive_dependents(&task_id)
        };

        self.cancel_single_task(&task_id, TaskError::new(ErrorCode::Cancelled, "cancelled by submitter"))
            .await?;

        // A task that will never complete takes its dependent closure with it.
        for dependent in dependents {
            self.cancel_single_task(
                &dependent,
                TaskError::new(ErrorCode::Cancelled, format!("upstream_failed: {task_id}")),
            )
            .await?;
        }
        self.finalize_if_terminal(workflow_id).await?;
        Ok(())
    }

    async fn cancel_workflow(&mut self, workflow_id: Uuid) -> Result<(), EngineError> {
        let non_terminal = {
            let rt = self
                .runtimes
                .get_mut(&workflow_id)
                .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
            rt.cancelled = true;
            rt.tasks
                .values()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id.clone())
                .collect::<Vec<_>>()
        };

        info!(workflow_id = %workflow_id, tasks = non_terminal.len(), "cancelling workflow");
        for task_id in non_terminal {
            self.cancel_single_task(
                &task_id,
                TaskError::new(ErrorCode::Cancelled, "workflow cancelled"),
            )
            .await?;
        }
        self.finalize_if_terminal(workflow_id).await?;
        Ok(())
    }

    /// Cancel one task wherever it currently is: the queue, the retry heap,
    /// or in flight on a provider. Does not cascade.
    async fn cancel_single_task(&mut self, task_id: &str, error: TaskError) -> Result<(), StoreError> {
        let Some((workflow_id, _)) = split_task_id(task_id) else {
            return Ok(());
        };
        let status = {
            let Some(rt) = self.runtimes.get(&workflow_id) else {
                return Ok(());
            };
            let Some(task) = rt.tasks.get(task_id) else {
                return Ok(());
            };
            if task.status.is_terminal() {
                return Ok(());
            }
            task.status
        };

        match status {
            TaskStatus::Ready => {
                self.queue.remove(task_id);
            }
            TaskStatus::Retrying => {
                self.scheduler.cancel(task_id).await;
                self.store_delete_retry(task_id).await?;
            }
            TaskStatus::Running => {
                if let Some(correlation_id) = self.running.remove(task_id) {
                    if let Some(inflight) = self.correlations.remove(&correlation_id) {
                        inflight.timeout_timer.abort();
                        // Best-effort: the provider may already be done; a
                        // late response is discarded by correlation.
                        self.bus
                            .cancel_request(&inflight.provider_id, correlation_id);
                        self.registry.release(&inflight.provider_id);
                    }
                }
            }
            _ => {}
        }

        let completed_at = Utc::now();
        if status == TaskStatus::Running {
            // Invariant: a task that reached running leaves a result record.
            let record = TaskResult {
                task_id: task_id.to_owned(),
                workflow_id: Some(workflow_id),
                status: TaskStatus::Cancelled,
                result: None,
                error: Some(error.clone()),
                duration_ms: None,
                provider_id: None,
                created_at: completed_at,
            };
            self.store_result(&record).await?;
        }
        self.store_task_status(
            task_id,
            TaskStatus::Cancelled,
            TaskStatusUpdate {
                completed_at: Some(completed_at),
                error: Some(error.clone()),
                ..TaskStatusUpdate::default()
            },
        )
        .await?;

        if let Some(rt) = self.runtimes.get_mut(&workflow_id) {
            if let Some(task) = rt.tasks.get_mut(task_id) {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(completed_at);
                task.error = Some(error);
            }
        }
        debug!(task_id = %task_id, "task cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Retry firing
    // -----------------------------------------------------------------------

    async fn handle_retry_due(&mut self, fired: RetryFired) -> Result<()> {
        self.store_delete_retry(&fired.task_id).await?;

        let Some((workflow_id, _)) = split_task_id(&fired.task_id) else {
            return Ok(());
        };
        let eligible = {
            match self.runtimes.get(&workflow_id) {
                Some(rt) if !rt.cancelled => rt
                    .tasks
                    .get(&fired.task_id)
                    .is_some_and(|t| t.status == TaskStatus::Retrying),
                _ => false,
            }
        };
        if !eligible {
            debug!(task_id = %fired.task_id, "stale retry firing ignored");
            return Ok(());
        }

        // Dependencies were satisfied before the first dispatch, so this
        // normally goes straight back to the queue.
        let deps_met = {
            let rt = self.runtimes.get(&workflow_id).expect("checked above");
            rt.tasks
                .get(&fired.task_id)
                .map(|t| {
                    t.dependencies
                        .iter()
                        .all(|d| rt.tracker.is_completed(d))
                })
                .unwrap_or(false)
        };
        if deps_met {
            self.make_ready(&fired.task_id).await?;
        } else {
            self.set_task_status_mem(&fired.task_id, TaskStatus::Queued);
            self.store_task_status(&fired.task_id, TaskStatus::Queued, TaskStatusUpdate::default())
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Workflow finalization
    // -----------------------------------------------------------------------

    async fn finalize_if_terminal(&mut self, workflow_id: Uuid) -> Result<(), StoreError> {
        let final_status = {
            let Some(rt) = self.runtimes.get(&workflow_id) else {
                return Ok(());
            };
            if !rt.all_terminal() {
                return Ok(());
            }
            if rt.cancelled {
                WorkflowStatus::Cancelled
            } else if rt.workflow.failed > 0
                && rt.workflow.failure_strategy == FailureStrategy::FailFast
            {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Completed
            }
        };

        let mut rt = self.runtimes.remove(&workflow_id).expect("checked above");
        rt.workflow.status = final_status;
        rt.workflow.completed_at = Some(Utc::now());
        self.store_aggregate(&rt.workflow).await?;

        info!(workflow_id = %workflow_id, status = %final_status, "workflow reached terminal state");
        self.emit(match final_status {
            WorkflowStatus::Failed => WorkflowEvent::WorkflowFailed { workflow_id },
            WorkflowStatus::Cancelled => WorkflowEvent::WorkflowCancelled { workflow_id },
            _ => WorkflowEvent::WorkflowCompleted { workflow_id },
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Heartbeat / aging sweep
    // -----------------------------------------------------------------------

    async fn sweep(&mut self) -> Result<()> {
        // Two missed heartbeats deregister the session.
        let stale = self
            .registry
            .stale_sessions(self.config.heartbeat_interval * 2);
        for provider_id in stale {
            warn!(provider_id = %provider_id, "provider missed heartbeats, deregistering");
            self.bus.disconnect(&provider_id).await;
        }

        for (task_id, priority) in self.queue.promote_aged(std::time::Instant::now()) {
            debug!(task_id = %task_id, priority = %priority, "aged task promoted");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reload non-terminal workflows, rebuild in-memory state, and re-seed
    /// the queue and retry heap.
    async fn recover(&mut self) -> Result<()> {
        let pending = self
            .store
            .enumerate_pending_on_startup()
            .await
            .context("failed to enumerate pending state")?;
        if pending.workflows.is_empty() {
            return Ok(());
        }
        info!(
            workflows = pending.workflows.len(),
            tasks = pending.tasks.len(),
            retries = pending.retries.len(),
            "recovering persisted state"
        );

        let retry_ids: HashSet<&str> = pending
            .retries
            .iter()
            .map(|r| r.task_id.as_str())
            .collect();

        let mut tasks_by_workflow: HashMap<Uuid, Vec<Task>> = HashMap::new();
        for task in pending.tasks {
            if let Some(workflow_id) = task.workflow_id {
                tasks_by_workflow.entry(workflow_id).or_default().push(task);
            }
        }

        for workflow in pending.workflows {
            let workflow_id = workflow.id;
            let tasks = tasks_by_workflow.remove(&workflow_id).unwrap_or_default();
            let runtime = match WorkflowRuntime::build(workflow, tasks) {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(workflow_id = %workflow_id, error = %e, "skipping unrecoverable workflow");
                    continue;
                }
            };
            self.runtimes.insert(workflow_id, runtime);

            let member_ids: Vec<String> = self.runtimes[&workflow_id]
                .tasks
                .keys()
                .cloned()
                .collect();
            for task_id in member_ids {
                let (status, attempt, max_attempts) = {
                    let task = &self.runtimes[&workflow_id].tasks[&task_id];
                    (task.status, task.attempt, task.retry.max_attempts)
                };
                match status {
                    TaskStatus::Ready => {
                        // Was queued before the crash; queue membership is
                        // rebuilt from status.
                        let priority = self.runtimes[&workflow_id].tasks[&task_id].priority;
                        if let Err(e) = self.queue.push(&task_id, Some(workflow_id), priority) {
                            warn!(task_id = %task_id, error = %e, "failed to requeue recovered task");
                        }
                    }
                    TaskStatus::Queued => {
                        if self.runtimes[&workflow_id].tracker.is_ready(&task_id) {
                            self.make_ready(&task_id).await?;
                        }
                    }
                    TaskStatus::Retrying => {
                        if !retry_ids.contains(task_id.as_str()) {
                            // Its retry fired (or was lost) before the crash.
                            self.make_ready(&task_id).await?;
                        }
                    }
                    TaskStatus::Running => match self.config.recovery {
                        RecoveryPolicy::Requeue => {
                            if attempt < max_attempts {
                                info!(task_id = %task_id, "re-queueing task interrupted while running");
                                self.set_task_status_mem(&task_id, TaskStatus::Retrying);
                                self.make_ready(&task_id).await?;
                            } else {
                                self.fail_task(
                                    &task_id,
                                    TaskError::new(
                                        ErrorCode::TaskExecutionFailed,
                                        "interrupted by restart with no attempts remaining",
                                    ),
                                )
                                .await?;
                            }
                        }
                        RecoveryPolicy::FailForInvestigation => {
                            self.fail_task(
                                &task_id,
                                TaskError::new(
                                    ErrorCode::TaskExecutionFailed,
                                    "task was running at shutdown; failed for investigation",
                                ),
                            )
                            .await?;
                        }
                    },
                    _ => {}
                }
            }
            self.finalize_if_terminal(workflow_id).await?;
        }

        // Pending retries fire no earlier than their original deadline.
        for retry in pending.retries {
            self.scheduler
                .schedule(&retry.task_id, retry.fire_at, retry.attempt)
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent_tasks >= 1);
        assert!(config.disconnect_consumes_attempt);
        assert_eq!(config.recovery, RecoveryPolicy::Requeue);
        assert!(config.persist_retry_attempts >= 1);
    }
}
