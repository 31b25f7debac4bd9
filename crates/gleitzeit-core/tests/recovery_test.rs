//! Restart recovery tests: engine state is re-derived from the store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gleitzeit_core::engine::{Engine, EngineConfig, EngineHandle, WorkflowEvent};
use gleitzeit_core::ingest::{self, parse_document_json, WorkflowDocument};
use gleitzeit_core::model::{TaskStatus, WorkflowStatus};
use gleitzeit_core::provider::{run_provider, ProviderHandler, ProviderRunnerConfig};
use gleitzeit_core::registry::{ProtocolSpec, ProviderCapability};
use gleitzeit_core::store::{FileStore, MemoryStore, Store};
use gleitzeit_core::transport::{EventBus, ProviderInbound, RequestEnvelope, ResponseEnvelope};

const WAIT: Duration = Duration::from_secs(10);

struct Running {
    handle: EngineHandle,
    bus: EventBus,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = tokio::time::timeout(WAIT, self.join).await;
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        no_provider_retry_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

async fn start(store: Arc<dyn Store>) -> Running {
    let (mut engine, handle, bus) = Engine::new(store, test_config());
    engine
        .register_protocol(ProtocolSpec::with_methods("llm/v1", &["chat"]))
        .expect("protocol registers");
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        if let Err(e) = engine.run(run_cancel).await {
            panic!("engine loop failed: {e:#}");
        }
    });
    Running {
        handle,
        bus,
        cancel,
        join,
    }
}

/// Always-succeeding provider driven by the provider-session runner.
struct OkHandler;

#[async_trait::async_trait]
impl ProviderHandler for OkHandler {
    async fn handle(&self, request: &RequestEnvelope) -> Option<ResponseEnvelope> {
        Some(ResponseEnvelope::ok(
            request.correlation_id,
            json!({"response": "ok"}),
        ))
    }
}

async fn spawn_ok_provider(bus: &EventBus, provider_id: &str) {
    let conn = bus
        .connect(
            provider_id,
            vec![ProviderCapability {
                protocol: "llm/v1".to_owned(),
                methods: vec!["chat".to_owned()],
            }],
            8,
        )
        .await
        .expect("provider connects");
    tokio::spawn(run_provider(
        conn,
        Arc::new(OkHandler),
        ProviderRunnerConfig::default(),
    ));
}

/// Provider that accepts requests and never answers.
async fn spawn_silent_provider(bus: &EventBus, provider_id: &str) {
    let mut conn = bus
        .connect(
            provider_id,
            vec![ProviderCapability {
                protocol: "llm/v1".to_owned(),
                methods: vec!["chat".to_owned()],
            }],
            8,
        )
        .await
        .expect("provider connects");
    tokio::spawn(async move {
        while let Some(inbound) = conn.recv().await {
            let _ = &inbound;
        }
    });
}

async fn wait_terminal(
    events: &mut broadcast::Receiver<WorkflowEvent>,
    workflow_id: Uuid,
) -> WorkflowEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event stream open") {
                event @ (WorkflowEvent::WorkflowCompleted { workflow_id: id }
                | WorkflowEvent::WorkflowFailed { workflow_id: id }
                | WorkflowEvent::WorkflowCancelled { workflow_id: id })
                    if id == workflow_id =>
                {
                    return event;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("workflow should reach a terminal state in time")
}

fn single_task_doc(name: &str) -> WorkflowDocument {
    parse_document_json(
        &json!({
            "name": name,
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {"prompt": "hi"}},
            ]
        })
        .to_string(),
    )
    .expect("document parses")
}

#[tokio::test]
async fn terminal_workflow_state_survives_restart() {
    let store = MemoryStore::new();

    let first = start(Arc::new(store.clone())).await;
    spawn_ok_provider(&first.bus, "p1").await;
    let mut events = first.handle.subscribe();
    let workflow_id = first
        .handle
        .submit_workflow(single_task_doc("restart-terminal"))
        .await
        .unwrap();
    wait_terminal(&mut events, workflow_id).await;
    first.stop().await;

    let second = start(Arc::new(store.clone())).await;
    let report = second.handle.workflow_status(workflow_id).await.unwrap();
    assert_eq!(report.workflow.status, WorkflowStatus::Completed);
    assert_eq!(report.tasks.len(), 1);
    assert_eq!(report.tasks[0].status, TaskStatus::Completed);

    let result = second
        .handle
        .task_result(format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .expect("result preserved");
    assert_eq!(result.result.unwrap()["response"], "ok");
    second.stop().await;
}

#[tokio::test]
async fn offline_submission_is_picked_up_on_startup() {
    // Persist a materialized workflow in `queued` state without an engine,
    // the way the CLI's offline submit does.
    let store = MemoryStore::new();
    let materialized = ingest::materialize(&single_task_doc("offline")).unwrap();
    store.put_workflow(&materialized.workflow).await.unwrap();
    for task in &materialized.tasks {
        store.put_task(task).await.unwrap();
    }
    let workflow_id = materialized.workflow.id;

    let engine = start(Arc::new(store.clone())).await;
    spawn_ok_provider(&engine.bus, "p1").await;
    let mut events = engine.handle.subscribe();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));
    engine.stop().await;
}

#[tokio::test]
async fn interrupted_running_task_is_requeued_with_attempt_increment() {
    let store = MemoryStore::new();

    let first = start(Arc::new(store.clone())).await;
    spawn_silent_provider(&first.bus, "blackhole").await;
    let mut events = first.handle.subscribe();
    let workflow_id = first
        .handle
        .submit_workflow(single_task_doc("interrupted"))
        .await
        .unwrap();

    // Wait until the attempt is actually in flight, then kill the engine.
    tokio::time::timeout(WAIT, async {
        loop {
            if let WorkflowEvent::TaskStarted { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("task should start");
    first.stop().await;

    let task_id = format!("{workflow_id}:t1");
    let persisted = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(persisted.status, TaskStatus::Running);
    assert_eq!(persisted.attempt, 1);

    // Restart: default policy re-queues the orphaned attempt.
    let second = start(Arc::new(store.clone())).await;
    spawn_ok_provider(&second.bus, "good").await;
    let mut events = second.handle.subscribe();
    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    let task = store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt, 2);
    second.stop().await;
}

#[tokio::test]
async fn pending_retry_survives_restart_and_fires_no_earlier() {
    let store = MemoryStore::new();

    // Provider that fails the first attempt with a retryable error.
    let first = start(Arc::new(store.clone())).await;
    let mut conn = first
        .bus
        .connect(
            "failing",
            vec![ProviderCapability {
                protocol: "llm/v1".to_owned(),
                methods: vec!["chat".to_owned()],
            }],
            8,
        )
        .await
        .unwrap();
    tokio::spawn(async move {
        while let Some(inbound) = conn.recv().await {
            if let ProviderInbound::Request(req) = inbound {
                let _ = conn
                    .respond(ResponseEnvelope::error(
                        req.correlation_id,
                        gleitzeit_core::error::TaskError::new(
                            gleitzeit_core::error::ErrorCode::ProviderTimeout,
                            "first attempt fails",
                        ),
                    ))
                    .await;
            }
        }
    });

    let mut events = first.handle.subscribe();
    let doc: WorkflowDocument = parse_document_json(
        &json!({
            "name": "retry-restart",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {},
                 "retry": {"max_attempts": 3, "strategy": "fixed",
                           "base_delay_secs": 0.5, "jitter": false}},
            ]
        })
        .to_string(),
    )
    .unwrap();
    let workflow_id = first.handle.submit_workflow(doc).await.unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            if let WorkflowEvent::TaskRetrying { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("retry should be scheduled");
    first.stop().await;

    // The retry record is durable and carries the original deadline.
    let pending = store.enumerate_pending_on_startup().await.unwrap();
    assert_eq!(pending.retries.len(), 1);
    let fire_at = pending.retries[0].fire_at;

    let second = start(Arc::new(store.clone())).await;
    spawn_ok_provider(&second.bus, "good").await;
    let mut events = second.handle.subscribe();
    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    let task = store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.attempt, 2);
    // The second attempt started no earlier than the scheduled deadline.
    assert!(task.started_at.unwrap() >= fire_at);
    second.stop().await;
}

#[tokio::test]
async fn file_store_backs_a_full_run_and_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let workflow_id = {
        let store = FileStore::open(dir.path()).await.expect("open store");
        let engine = start(Arc::new(store)).await;
        spawn_ok_provider(&engine.bus, "p1").await;
        let mut events = engine.handle.subscribe();
        let workflow_id = engine
            .handle
            .submit_workflow(single_task_doc("file-backed"))
            .await
            .unwrap();
        wait_terminal(&mut events, workflow_id).await;
        engine.stop().await;
        workflow_id
    };

    // A fresh process over the same directory sees the terminal state.
    let store = FileStore::open(dir.path()).await.expect("reopen store");
    let engine = start(Arc::new(store)).await;
    let report = engine.handle.workflow_status(workflow_id).await.unwrap();
    assert_eq!(report.workflow.status, WorkflowStatus::Completed);
    let result = engine
        .handle
        .task_result(format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .expect("result readable after reopen");
    assert_eq!(result.result.unwrap()["response"], "ok");
    engine.stop().await;
}
