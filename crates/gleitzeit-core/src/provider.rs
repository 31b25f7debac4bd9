//! Provider-side session driver.
//!
//! Wraps a transport connection in the behavior the protocol requires of
//! every provider: answer each request exactly once (or let it time out),
//! honour best-effort cancellation, and heartbeat at the configured cadence.
//! Concrete providers only implement [`ProviderHandler`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::transport::{
    ProviderConnection, ProviderInbound, RequestEnvelope, ResponseEnvelope,
};

/// Request handler implemented by a concrete provider.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Handle one request. Returning `None` leaves the request unanswered,
    /// letting the engine's timeout fire.
    async fn handle(&self, request: &RequestEnvelope) -> Option<ResponseEnvelope>;

    /// Best-effort cancellation notice for an in-flight correlation.
    async fn cancelled(&self, correlation_id: Uuid) {
        let _ = correlation_id;
    }
}

/// Heartbeat cadence for [`run_provider`]. `None` disables heartbeats
/// (useful in tests with generous engine heartbeat windows).
#[derive(Debug, Clone, Default)]
pub struct ProviderRunnerConfig {
    pub heartbeat_every: Option<Duration>,
}

/// Drive a provider session to completion: requests fan out to per-request
/// tasks, cancellations are forwarded, duplicate deliveries of the same
/// correlation are answered only once. Returns when the session closes.
pub async fn run_provider<H>(
    mut conn: ProviderConnection,
    handler: Arc<H>,
    config: ProviderRunnerConfig,
) where
    H: ProviderHandler + 'static,
{
    let responder = conn.responder();
    let active = Arc::new(Mutex::new(0usize));
    let seen: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));

    let heartbeat_task = config.heartbeat_every.map(|every| {
        let responder = responder.clone();
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let current = *active.lock().expect("active counter lock");
                if responder.heartbeat(current, None).await.is_err() {
                    break;
                }
            }
        })
    });

    while let Some(inbound) = conn.recv().await {
        match inbound {
            ProviderInbound::Request(request) => {
                // At-least-once delivery: a redelivered correlation gets no
                // second answer.
                let fresh = seen
                    .lock()
                    .expect("seen set lock")
                    .insert(request.correlation_id);
                if !fresh {
                    debug!(
                        correlation_id = %request.correlation_id,
                        "duplicate request delivery ignored"
                    );
                    continue;
                }

                *active.lock().expect("active counter lock") += 1;
                let handler = Arc::clone(&handler);
                let responder = responder.clone();
                let active = Arc::clone(&active);
                tokio::spawn(async move {
                    let response = handler.handle(&request).await;
                    if let Some(response) = response {
                        let _ = responder.respond(response).await;
                    }
                    let mut current = active.lock().expect("active counter lock");
                    *current = current.saturating_sub(1);
                });
            }
            ProviderInbound::Cancel { correlation_id } => {
                handler.cancelled(correlation_id).await;
            }
        }
    }

    if let Some(task) = heartbeat_task {
        task.abort();
    }
}
