//! Transport layer: typed envelopes and the in-process event bus connecting
//! the engine to provider sessions.
//!
//! The bus owns the per-session channels (spec ownership rule: sessions
//! belong to the transport; the registry only keeps an id + capability
//! view). Delivery is at-least-once; the engine discards duplicate
//! responses by correlation id, so providers may safely resend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TaskError;
use crate::registry::ProviderCapability;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// An outbound request to a provider. Carries everything needed to answer
/// without shared state; correlation binds the eventual response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: Uuid,
    pub task_id: String,
    pub attempt: u32,
    pub protocol: String,
    pub method: String,
    pub params: Value,
    /// Absolute deadline, milliseconds since the Unix epoch.
    pub deadline_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// A provider's answer to exactly one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub correlation_id: Uuid,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl ResponseEnvelope {
    pub fn ok(correlation_id: Uuid, result: Value) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(correlation_id: Uuid, error: TaskError) -> Self {
        Self {
            correlation_id,
            status: ResponseStatus::Error,
            result: None,
            error: Some(error),
        }
    }
}

/// Every message that can cross the channel, for wire serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    RegisterProvider {
        provider_id: String,
        capabilities: Vec<ProviderCapability>,
        max_concurrent: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    DeregisterProvider {
        provider_id: String,
    },
    Heartbeat {
        provider_id: String,
        active: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_latency_ms: Option<u64>,
    },
    CancelRequest {
        correlation_id: Uuid,
    },
}

// ---------------------------------------------------------------------------
// Bus events
// ---------------------------------------------------------------------------

/// Events the bus delivers into the engine loop.
#[derive(Debug)]
pub enum TransportEvent {
    ProviderConnected {
        provider_id: String,
        capabilities: Vec<ProviderCapability>,
        max_concurrent: usize,
    },
    ProviderDisconnected {
        provider_id: String,
    },
    Response(ResponseEnvelope),
    Heartbeat {
        provider_id: String,
        active: usize,
        last_latency_ms: Option<u64>,
    },
}

/// Messages delivered to a provider session.
#[derive(Debug)]
pub enum ProviderInbound {
    Request(RequestEnvelope),
    /// Best-effort cancellation of an in-flight request.
    Cancel { correlation_id: Uuid },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("provider {0:?} is not connected")]
    Disconnected(String),

    #[error("provider {0:?} cannot accept more requests right now")]
    Busy(String),

    #[error("provider {0:?} already has a session")]
    DuplicateSession(String),

    #[error("engine is no longer receiving transport events")]
    EngineGone,
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Per-session inbound buffer. Requests beyond this surface as `Busy`, which
/// the engine maps to retryable overload.
const SESSION_BUFFER: usize = 64;

#[derive(Debug)]
struct BusInner {
    sessions: HashMap<String, mpsc::Sender<ProviderInbound>>,
}

/// Bidirectional in-process channel between the engine and providers.
///
/// Cloneable handle; all clones share the session table.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    engine_tx: mpsc::Sender<TransportEvent>,
}

impl EventBus {
    /// Create a bus plus the engine-side event receiver.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (engine_tx, engine_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                inner: Arc::new(Mutex::new(BusInner {
                    sessions: HashMap::new(),
                })),
                engine_tx,
            },
            engine_rx,
        )
    }

    /// Establish a provider session and announce it to the engine.
    pub async fn connect(
        &self,
        provider_id: impl Into<String>,
        capabilities: Vec<ProviderCapability>,
        max_concurrent: usize,
    ) -> Result<ProviderConnection, TransportError> {
        let provider_id = provider_id.into();
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            if inner.sessions.contains_key(&provider_id) {
                return Err(TransportError::DuplicateSession(provider_id));
            }
            inner.sessions.insert(provider_id.clone(), tx);
        }

        self.engine_tx
            .send(TransportEvent::ProviderConnected {
                provider_id: provider_id.clone(),
                capabilities,
                max_concurrent,
            })
            .await
            .map_err(|_| TransportError::EngineGone)?;

        Ok(ProviderConnection {
            provider_id,
            inbound: rx,
            bus: self.clone(),
        })
    }

    /// Engine side: push a request onto a session's inbound channel.
    ///
    /// Never blocks the engine loop: a full session buffer is `Busy`.
    pub fn send_request(
        &self,
        provider_id: &str,
        request: RequestEnvelope,
    ) -> Result<(), TransportError> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        let Some(tx) = inner.sessions.get(provider_id) else {
            return Err(TransportError::Disconnected(provider_id.to_owned()));
        };
        match tx.try_send(ProviderInbound::Request(request)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(TransportError::Busy(provider_id.to_owned()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(TransportError::Disconnected(provider_id.to_owned()))
            }
        }
    }

    /// Engine side: best-effort cancellation of an in-flight request.
    pub fn cancel_request(&self, provider_id: &str, correlation_id: Uuid) {
        let inner = self.inner.lock().expect("bus lock poisoned");
        if let Some(tx) = inner.sessions.get(provider_id) {
            let _ = tx.try_send(ProviderInbound::Cancel { correlation_id });
        }
    }

    /// Tear down a session and notify the engine. Idempotent.
    pub async fn disconnect(&self, provider_id: &str) {
        let removed = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            inner.sessions.remove(provider_id).is_some()
        };
        if removed {
            let _ = self
                .engine_tx
                .send(TransportEvent::ProviderDisconnected {
                    provider_id: provider_id.to_owned(),
                })
                .await;
        }
    }

    pub fn is_connected(&self, provider_id: &str) -> bool {
        self.inner
            .lock()
            .expect("bus lock poisoned")
            .sessions
            .contains_key(provider_id)
    }

    async fn send_event(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.engine_tx
            .send(event)
            .await
            .map_err(|_| TransportError::EngineGone)
    }
}

/// The provider's end of a session.
#[derive(Debug)]
pub struct ProviderConnection {
    provider_id: String,
    inbound: mpsc::Receiver<ProviderInbound>,
    bus: EventBus,
}

/// Cloneable sender half of a provider session, for answering requests from
/// spawned per-request tasks while the connection keeps receiving.
#[derive(Clone)]
pub struct ProviderResponder {
    provider_id: String,
    bus: EventBus,
}

impl ProviderResponder {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub async fn respond(&self, response: ResponseEnvelope) -> Result<(), TransportError> {
        self.bus.send_event(TransportEvent::Response(response)).await
    }

    pub async fn heartbeat(
        &self,
        active: usize,
        last_latency_ms: Option<u64>,
    ) -> Result<(), TransportError> {
        self.bus
            .send_event(TransportEvent::Heartbeat {
                provider_id: self.provider_id.clone(),
                active,
                last_latency_ms,
            })
            .await
    }
}

impl ProviderConnection {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Split off a cloneable responder for this session.
    pub fn responder(&self) -> ProviderResponder {
        ProviderResponder {
            provider_id: self.provider_id.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Receive the next request or cancellation. `None` once disconnected.
    pub async fn recv(&mut self) -> Option<ProviderInbound> {
        self.inbound.recv().await
    }

    /// Answer a request.
    pub async fn respond(&self, response: ResponseEnvelope) -> Result<(), TransportError> {
        self.bus.send_event(TransportEvent::Response(response)).await
    }

    /// Report liveness and load.
    pub async fn heartbeat(
        &self,
        active: usize,
        last_latency_ms: Option<u64>,
    ) -> Result<(), TransportError> {
        self.bus
            .send_event(TransportEvent::Heartbeat {
                provider_id: self.provider_id.clone(),
                active,
                last_latency_ms,
            })
            .await
    }

    /// Explicitly deregister, consuming the connection.
    pub async fn disconnect(self) {
        self.bus.disconnect(&self.provider_id).await;
    }
}
