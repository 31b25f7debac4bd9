//! `gleitzeit serve`: run the execution engine with its HTTP submitter
//! surface.
//!
//! The engine recovers persisted state before accepting new work, so
//! workflows queued offline via `gleitzeit submit` start executing here.
//! Provider transports are embedders' concern; they attach to the engine's
//! in-process event bus.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use gleitzeit_core::engine::{Engine, EngineConfig, EngineError, EngineHandle};
use gleitzeit_core::ingest::WorkflowDocument;
use gleitzeit_core::model::qualified_task_id;
use gleitzeit_core::queue::QueueConfig;

use crate::backend;
use crate::config::GleitzeitConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::WorkflowNotFound(_) | EngineError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Backpressure => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    handle: EngineHandle,
}

pub fn build_router(handle: EngineHandle) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/workflows", post(submit_workflow))
        .route("/api/workflows/{id}", get(workflow_status))
        .route("/api/workflows/{id}/cancel", post(cancel_workflow))
        .route(
            "/api/workflows/{id}/tasks/{task}/result",
            get(task_result),
        )
        .route(
            "/api/workflows/{id}/tasks/{task}/cancel",
            post(cancel_task),
        )
        .route("/api/events", get(event_stream))
        .layer(CorsLayer::permissive())
        .with_state(AppState { handle })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: GleitzeitConfig, bind: &str, port: u16) -> Result<()> {
    let store = backend::open_store(&config).await?;

    let engine_config = EngineConfig {
        max_concurrent_tasks: config.engine.max_concurrent_tasks,
        default_timeout_secs: config.engine.default_timeout_secs,
        queue: QueueConfig {
            capacity: config.engine.queue_capacity,
            aging_threshold: None,
        },
        ..EngineConfig::default()
    };
    let (mut engine, handle, _bus) = Engine::new(store, engine_config);
    for protocol in &config.protocols {
        engine
            .register_protocol(protocol.to_spec())
            .with_context(|| format!("failed to register protocol {}", protocol.id))?;
    }

    let cancel = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(cancel.clone()));

    let app = build_router(handle);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("gleitzeit serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    engine_task
        .await
        .context("engine task panicked")?
        .context("engine loop failed")?;
    tracing::info!("gleitzeit serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> Html<&'static str> {
    Html(
        "<!DOCTYPE html>\
<html><head><title>gleitzeit</title></head><body>\
<h1>gleitzeit</h1>\
<p>POST /api/workflows | GET /api/workflows/{id} | GET /api/events</p>\
</body></html>",
    )
}

async fn submit_workflow(
    State(state): State<AppState>,
    Json(document): Json<WorkflowDocument>,
) -> Result<axum::response::Response, AppError> {
    let workflow_id = state.handle.submit_workflow(document).await?;
    Ok(Json(serde_json::json!({ "workflow_id": workflow_id })).into_response())
}

async fn workflow_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let report = state.handle.workflow_status(id).await?;
    Ok(Json(report).into_response())
}

async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    state.handle.cancel_workflow(id).await?;
    Ok(Json(serde_json::json!({ "cancelled": id })).into_response())
}

async fn task_result(
    State(state): State<AppState>,
    Path((id, task)): Path<(Uuid, String)>,
) -> Result<axum::response::Response, AppError> {
    let qualified = qualified_task_id(&id, &task);
    let result = state.handle.task_result(&qualified).await?;
    match result {
        Some(result) => Ok(Json(result).into_response()),
        None => Err(AppError {
            status: StatusCode::NOT_FOUND,
            message: format!("no result for task {task} in workflow {id}"),
        }),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path((id, task)): Path<(Uuid, String)>,
) -> Result<axum::response::Response, AppError> {
    let qualified = qualified_task_id(&id, &task);
    state.handle.cancel_task(qualified).await?;
    Ok(Json(serde_json::json!({ "cancelled": task })).into_response())
}

/// Server-sent event stream of workflow lifecycle events.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut events = state.handle.subscribe();
    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                // A slow consumer skips missed events rather than dying.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
