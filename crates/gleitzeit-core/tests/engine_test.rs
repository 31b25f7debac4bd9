//! End-to-end engine tests against an in-process scripted provider.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gleitzeit_core::engine::{Engine, EngineConfig, EngineError, EngineHandle, WorkflowEvent};
use gleitzeit_core::error::ErrorCode;
use gleitzeit_core::ingest::{parse_document_json, WorkflowDocument};
use gleitzeit_core::model::{TaskStatus, WorkflowStatus};
use gleitzeit_core::queue::QueueConfig;
use gleitzeit_core::registry::{ProtocolSpec, ProviderCapability};
use gleitzeit_core::store::{MemoryStore, Store};
use gleitzeit_core::transport::{
    EventBus, ProviderInbound, RequestEnvelope, ResponseEnvelope,
};
use gleitzeit_core::ingest::ValidationError;

const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct TestEngine {
    handle: EngineHandle,
    bus: EventBus,
    cancel: CancellationToken,
    store: MemoryStore,
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_tasks: 8,
        no_provider_retry_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

async fn start_engine(config: EngineConfig) -> TestEngine {
    let store = MemoryStore::new();
    let (mut engine, handle, bus) = Engine::new(Arc::new(store.clone()), config);
    engine
        .register_protocol(ProtocolSpec::with_methods("llm/v1", &["chat", "produce"]))
        .expect("protocol registers");
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(run_cancel).await {
            panic!("engine loop failed: {e:#}");
        }
    });
    TestEngine {
        handle,
        bus,
        cancel,
        store,
    }
}

/// Spawn a provider whose behavior closure decides each response.
/// Returning `None` leaves the request unanswered.
async fn spawn_provider<F>(bus: &EventBus, provider_id: &str, delay: Duration, mut behavior: F)
where
    F: FnMut(&RequestEnvelope) -> Option<ResponseEnvelope> + Send + 'static,
{
    let mut conn = bus
        .connect(
            provider_id,
            vec![ProviderCapability {
                protocol: "llm/v1".to_owned(),
                methods: vec!["chat".to_owned(), "produce".to_owned()],
            }],
            8,
        )
        .await
        .expect("provider connects");
    tokio::spawn(async move {
        while let Some(inbound) = conn.recv().await {
            if let ProviderInbound::Request(req) = inbound {
                if let Some(response) = behavior(&req) {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if conn.respond(response).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Wait for a terminal workflow event for `workflow_id`.
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

fn doc(json: Value) -> WorkflowDocument {
    parse_document_json(&json.to_string()).expect("document parses")
}

// ---------------------------------------------------------------------------
// S1: linear two-task workflow with substitution splicing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_two_task_workflow_substitutes_and_completes() {
    let engine = start_engine(test_config()).await;
    spawn_provider(&engine.bus, "p1", Duration::ZERO, |req| {
        let prompt = req.params["prompt"].as_str().unwrap_or_default();
        let response = if prompt == "hi" {
            "HELLO".to_owned()
        } else {
            prompt.to_owned()
        };
        Some(ResponseEnvelope::ok(
            req.correlation_id,
            json!({"response": response}),
        ))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "linear",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {"prompt": "hi"}},
                {"id": "t2", "protocol": "llm/v1", "method": "chat",
                 "dependencies": ["t1"],
                 "params": {"prompt": "echo: ${t1.response}"}},
            ]
        })))
        .await
        .expect("submission accepted");

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    let report = engine.handle.workflow_status(workflow_id).await.unwrap();
    assert_eq!(report.workflow.status, WorkflowStatus::Completed);
    assert_eq!(report.workflow.completed, 2);
    assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Completed));

    let t2_id = format!("{workflow_id}:t2");
    let result = engine
        .handle
        .task_result(&t2_id)
        .await
        .unwrap()
        .expect("t2 has a result");
    assert_eq!(result.result.unwrap()["response"], "echo: HELLO");

    // Ordering: t1 finished before t2 started.
    let t1 = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    let t2 = engine.store.get_task(&t2_id).await.unwrap().unwrap();
    assert!(t1.completed_at.unwrap() <= t2.started_at.unwrap());
}

// ---------------------------------------------------------------------------
// S2: raw-value preservation for a sole-token parameter
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sole_token_parameter_keeps_sequence_type_on_the_wire() {
    let engine = start_engine(test_config()).await;
    let seen: Arc<Mutex<Vec<RequestEnvelope>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    spawn_provider(&engine.bus, "p1", Duration::ZERO, move |req| {
        seen_clone.lock().unwrap().push(req.clone());
        let body = match req.method.as_str() {
            "produce" => json!({"items": [1, 2, 3]}),
            _ => json!({"response": "done"}),
        };
        Some(ResponseEnvelope::ok(req.correlation_id, body))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "raw-values",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "produce", "params": {}},
                {"id": "t2", "protocol": "llm/v1", "method": "chat",
                 "dependencies": ["t1"],
                 "params": {"nums": "${t1.items}"}},
            ]
        })))
        .await
        .unwrap();

    wait_terminal(&mut events, workflow_id).await;

    let requests = seen.lock().unwrap();
    let t2_request = requests
        .iter()
        .find(|r| r.task_id.ends_with(":t2"))
        .expect("t2 dispatched");
    // The dispatched value is a sequence, not its string rendering.
    assert_eq!(t2_request.params["nums"], json!([1, 2, 3]));
}

// ---------------------------------------------------------------------------
// S3: cycle rejection before anything is persisted
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cyclic_workflow_is_rejected_with_the_cycle_path() {
    let engine = start_engine(test_config()).await;

    let err = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "cycle",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "dependencies": ["t2"], "params": {}},
                {"id": "t2", "protocol": "llm/v1", "method": "chat",
                 "dependencies": ["t1"], "params": {}},
            ]
        })))
        .await
        .unwrap_err();

    match err {
        EngineError::Validation(ValidationError::CycleDetected(path)) => {
            assert_eq!(path, vec!["t1", "t2", "t1"]);
        }
        other => panic!("expected cycle rejection, got: {other}"),
    }

    // Nothing was persisted.
    assert!(engine
        .store
        .list_tasks_by_status(TaskStatus::Queued, None)
        .await
        .unwrap()
        .is_empty());
}

// ---------------------------------------------------------------------------
// S4: retry with exponential backoff until success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_retry_with_backoff_until_success() {
    let engine = start_engine(test_config()).await;
    let attempts = Arc::new(Mutex::new(0u32));
    let attempts_clone = Arc::clone(&attempts);
    spawn_provider(&engine.bus, "p1", Duration::ZERO, move |req| {
        let mut n = attempts_clone.lock().unwrap();
        *n += 1;
        if *n <= 2 {
            Some(ResponseEnvelope::error(
                req.correlation_id,
                gleitzeit_core::error::TaskError::new(ErrorCode::ProviderTimeout, "simulated"),
            ))
        } else {
            Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
        }
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "retry",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {"prompt": "x"},
                 "retry": {"max_attempts": 3, "strategy": "exponential",
                           "base_delay_secs": 0.05, "jitter": false}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    assert_eq!(*attempts.lock().unwrap(), 3);
    let task = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.attempt, 3);
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn single_attempt_policy_fails_after_one_retryable_error() {
    let engine = start_engine(test_config()).await;
    spawn_provider(&engine.bus, "p1", Duration::ZERO, |req| {
        Some(ResponseEnvelope::error(
            req.correlation_id,
            gleitzeit_core::error::TaskError::new(ErrorCode::ProviderTimeout, "always"),
        ))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "no-retry",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {}, "retry": {"max_attempts": 1}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowFailed { .. }));

    let task = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt, 1);
    assert_eq!(task.error.unwrap().code, ErrorCode::ProviderTimeout);
}

// ---------------------------------------------------------------------------
// S5: provider disconnect mid-flight, recovery on reconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_mid_flight_consumes_attempt_and_recovers() {
    let engine = start_engine(test_config()).await;

    // First provider swallows the request and drops the session.
    let mut conn = engine
        .bus
        .connect(
            "flaky",
            vec![ProviderCapability {
                protocol: "llm/v1".to_owned(),
                methods: vec!["chat".to_owned()],
            }],
            8,
        )
        .await
        .unwrap();
    tokio::spawn(async move {
        if let Some(ProviderInbound::Request(_)) = conn.recv().await {
            conn.disconnect().await;
        }
    });

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "disconnect",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {"prompt": "x"},
                 "retry": {"max_attempts": 3, "base_delay_secs": 0.05, "jitter": false}},
            ]
        })))
        .await
        .unwrap();

    // Wait until the retry is scheduled, then bring up a healthy provider.
    tokio::time::timeout(WAIT, async {
        loop {
            if let WorkflowEvent::TaskRetrying { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("task should be rescheduled after the disconnect");

    spawn_provider(&engine.bus, "healthy", Duration::ZERO, |req| {
        Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
    })
    .await;

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    let task = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    // The disconnected attempt consumed budget (default policy).
    assert_eq!(task.attempt, 2);
}

// ---------------------------------------------------------------------------
// S6: strict priority dispatch order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_order_is_urgent_normal_low() {
    let config = EngineConfig {
        max_concurrent_tasks: 1,
        ..test_config()
    };
    let engine = start_engine(config).await;

    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let order_clone = Arc::clone(&order);
    spawn_provider(&engine.bus, "p1", Duration::from_millis(10), move |req| {
        order_clone
            .lock()
            .unwrap()
            .push(req.task_id.rsplit(':').next().unwrap_or_default().to_owned());
        Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "priorities",
            "tasks": [
                {"id": "a", "protocol": "llm/v1", "method": "chat",
                 "priority": "low", "params": {}},
                {"id": "b", "protocol": "llm/v1", "method": "chat",
                 "priority": "urgent", "params": {}},
                {"id": "c", "protocol": "llm/v1", "method": "chat",
                 "priority": "normal", "params": {}},
            ]
        })))
        .await
        .unwrap();

    wait_terminal(&mut events, workflow_id).await;
    assert_eq!(*order.lock().unwrap(), vec!["b", "c", "a"]);
}

// ---------------------------------------------------------------------------
// Duplicate responses, timeouts, failure propagation, cancellation,
// backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_response_for_terminal_correlation_is_discarded() {
    let engine = start_engine(test_config()).await;

    let mut conn = engine
        .bus
        .connect(
            "dup",
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
                let first = ResponseEnvelope::ok(req.correlation_id, json!({"response": "first"}));
                let dup = ResponseEnvelope::ok(req.correlation_id, json!({"response": "second"}));
                let _ = conn.respond(first).await;
                // At-least-once delivery: the resend must be a no-op.
                let _ = conn.respond(dup).await;
            }
        }
    });

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "dup",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat", "params": {}},
            ]
        })))
        .await
        .unwrap();

    wait_terminal(&mut events, workflow_id).await;
    // Give the duplicate time to arrive and be dropped.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = engine
        .handle
        .task_result(format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.result.unwrap()["response"], "first");
}

#[tokio::test]
async fn unanswered_request_times_out_as_task_timeout() {
    let engine = start_engine(test_config()).await;
    // A provider that accepts requests and never answers.
    spawn_provider(&engine.bus, "silent", Duration::ZERO, |_req| None).await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "timeout",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat",
                 "params": {}, "timeout": 1, "retry": {"max_attempts": 1}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowFailed { .. }));

    let task = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.error.unwrap().code, ErrorCode::TaskTimeout);
}

#[tokio::test]
async fn failed_task_cancels_dependents_with_upstream_reason() {
    let engine = start_engine(test_config()).await;
    spawn_provider(&engine.bus, "p1", Duration::ZERO, |req| {
        if req.task_id.ends_with(":bad") {
            Some(ResponseEnvelope::error(
                req.correlation_id,
                gleitzeit_core::error::TaskError::new(
                    ErrorCode::TaskExecutionFailed,
                    "deterministic failure",
                ),
            ))
        } else {
            Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
        }
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "propagation",
            "tasks": [
                {"id": "bad", "protocol": "llm/v1", "method": "chat", "params": {}},
                {"id": "child", "protocol": "llm/v1", "method": "chat",
                 "dependencies": ["bad"], "params": {}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowFailed { .. }));

    let child = engine
        .store
        .get_task(&format!("{workflow_id}:child"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.status, TaskStatus::Cancelled);
    let reason = child.error.unwrap();
    assert_eq!(reason.code, ErrorCode::Cancelled);
    assert!(reason.message.contains("upstream_failed"));
    // Never dispatched.
    assert_eq!(child.attempt, 0);
}

#[tokio::test]
async fn continue_on_error_keeps_independent_siblings_running() {
    let engine = start_engine(test_config()).await;
    spawn_provider(&engine.bus, "p1", Duration::ZERO, |req| {
        if req.task_id.ends_with(":bad") {
            Some(ResponseEnvelope::error(
                req.correlation_id,
                gleitzeit_core::error::TaskError::new(
                    ErrorCode::TaskExecutionFailed,
                    "deterministic failure",
                ),
            ))
        } else {
            Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
        }
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "continue",
            "on_failure": "continue_on_error",
            "tasks": [
                {"id": "bad", "protocol": "llm/v1", "method": "chat",
                 "params": {}, "retry": {"max_attempts": 1}},
                {"id": "independent", "protocol": "llm/v1", "method": "chat", "params": {}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    // One failure does not poison the workflow under continue-on-error.
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    let report = engine.handle.workflow_status(workflow_id).await.unwrap();
    assert_eq!(report.workflow.failed, 1);
    assert_eq!(report.workflow.completed, 1);
    let sibling = report
        .tasks
        .iter()
        .find(|t| t.local_id == "independent")
        .unwrap();
    assert_eq!(sibling.status, TaskStatus::Completed);
}

#[tokio::test]
async fn workflow_cancellation_cancels_everything_nonterminal() {
    let engine = start_engine(test_config()).await;
    // Slow provider so the first task is still in flight when we cancel.
    spawn_provider(&engine.bus, "slow", Duration::from_secs(5), |req| {
        Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "late"})))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "cancel-me",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat", "params": {}},
                {"id": "t2", "protocol": "llm/v1", "method": "chat",
                 "dependencies": ["t1"], "params": {}},
            ]
        })))
        .await
        .unwrap();

    // Wait for the first dispatch before cancelling.
    tokio::time::timeout(WAIT, async {
        loop {
            if let WorkflowEvent::TaskStarted { .. } = events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .expect("first task should start");

    engine.handle.cancel_workflow(workflow_id).await.unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCancelled { .. }));

    let report = engine.handle.workflow_status(workflow_id).await.unwrap();
    assert_eq!(report.workflow.status, WorkflowStatus::Cancelled);
    assert!(report
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Cancelled));
}

#[tokio::test]
async fn full_queue_rejects_submission_without_partial_state() {
    let config = EngineConfig {
        queue: QueueConfig {
            capacity: 1,
            aging_threshold: None,
        },
        ..test_config()
    };
    let engine = start_engine(config).await;

    let err = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "too-wide",
            "tasks": [
                {"id": "a", "protocol": "llm/v1", "method": "chat", "params": {}},
                {"id": "b", "protocol": "llm/v1", "method": "chat", "params": {}},
            ]
        })))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Backpressure));

    // No workflow or task rows were left behind.
    assert!(engine
        .store
        .list_tasks_by_status(TaskStatus::Queued, None)
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .store
        .list_tasks_by_status(TaskStatus::Ready, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn no_provider_then_late_registration_completes_the_task() {
    let engine = start_engine(test_config()).await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "late-provider",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "chat", "params": {}},
            ]
        })))
        .await
        .unwrap();

    // Let the task cycle through no-provider rescheduling at least once.
    tokio::time::sleep(Duration::from_millis(120)).await;
    spawn_provider(&engine.bus, "late", Duration::ZERO, |req| {
        Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
    })
    .await;

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowCompleted { .. }));

    // Waiting for a provider never consumes retry budget.
    let task = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn unknown_method_fails_permanently_at_dispatch() {
    let engine = start_engine(test_config()).await;
    spawn_provider(&engine.bus, "p1", Duration::ZERO, |req| {
        Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "bad-method",
            "tasks": [
                {"id": "t1", "protocol": "llm/v1", "method": "no_such_method", "params": {}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowFailed { .. }));

    let task = engine
        .store
        .get_task(&format!("{workflow_id}:t1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.error.unwrap().code, ErrorCode::MethodNotSupported);
}

#[tokio::test]
async fn unresolved_substitution_reference_fails_the_task() {
    let engine = start_engine(test_config()).await;
    spawn_provider(&engine.bus, "p1", Duration::ZERO, |req| {
        Some(ResponseEnvelope::ok(req.correlation_id, json!({"response": "ok"})))
    })
    .await;

    let mut events = engine.handle.subscribe();
    let workflow_id = engine
        .handle
        .submit_workflow(doc(json!({
            "name": "bad-ref",
            "tasks": [
                {"id": "a", "protocol": "llm/v1", "method": "chat", "params": {}},
                // b does not depend on a, so ${a.response} is out of scope.
                {"id": "b", "protocol": "llm/v1", "method": "chat",
                 "params": {"prompt": "${a.response}"}},
            ]
        })))
        .await
        .unwrap();

    let terminal = wait_terminal(&mut events, workflow_id).await;
    assert!(matches!(terminal, WorkflowEvent::WorkflowFailed { .. }));

    let task = engine
        .store
        .get_task(&format!("{workflow_id}:b"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.error.unwrap().code, ErrorCode::UnresolvedReference);
}
