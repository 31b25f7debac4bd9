//! Provider registry: the in-memory index of protocols, methods, and
//! connected provider sessions, plus the selection policy that picks a
//! session for a `(protocol, method)` dispatch.
//!
//! The registry lives inside the engine's single-threaded loop; sessions
//! themselves are owned by the transport, the registry only holds their
//! id and capability view.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorCode;
use crate::model::HealthState;

// ---------------------------------------------------------------------------
// Protocols
// ---------------------------------------------------------------------------

/// One method within a protocol's catalogue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the method's parameters, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_schema: Option<Value>,
}

/// A named, versioned method catalogue, e.g. `llm/v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// `name/version` identifier.
    pub id: String,
    #[serde(default)]
    pub methods: HashMap<String, MethodSpec>,
    /// When set, providers may advertise methods not listed in `methods`.
    #[serde(default)]
    pub open_world: bool,
}

impl ProtocolSpec {
    /// A spec with the given method names and no schemas.
    pub fn with_methods(id: impl Into<String>, methods: &[&str]) -> Self {
        Self {
            id: id.into(),
            methods: methods
                .iter()
                .map(|m| (m.to_string(), MethodSpec::default()))
                .collect(),
            open_world: false,
        }
    }
}

/// A provider's advertised `(protocol, methods)` capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCapability {
    pub protocol: String,
    pub methods: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    /// No protocol with this id is registered. Permanent.
    #[error("protocol {0:?} is not registered")]
    ProtocolNotFound(String),

    /// The protocol exists but does not declare this method. Permanent.
    #[error("method {method:?} is not part of protocol {protocol:?}")]
    MethodNotSupported { protocol: String, method: String },

    /// The method is known but no healthy session currently supplies it.
    /// Transient: provider (re)connection is expected.
    #[error("no provider available for {protocol}/{method}")]
    NoProviderAvailable { protocol: String, method: String },

    #[error("protocol {0:?} is already registered with a different definition")]
    IncompatibleProtocol(String),

    #[error("provider {0:?} is not registered")]
    UnknownProvider(String),

    #[error("provider {provider:?} is already registered")]
    DuplicateProvider { provider: String },
}

impl RegistryError {
    /// The wire code this failure surfaces as on a task.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ProtocolNotFound(_) => ErrorCode::ProtocolNotFound,
            Self::MethodNotSupported { .. } => ErrorCode::MethodNotSupported,
            Self::NoProviderAvailable { .. } => ErrorCode::NoProviderAvailableTransient,
            Self::IncompatibleProtocol(_) | Self::DuplicateProvider { .. } => {
                ErrorCode::ConfigurationError
            }
            Self::UnknownProvider(_) => ErrorCode::InternalError,
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Registry-side view of one connected provider session.
#[derive(Debug, Clone)]
pub struct ProviderSession {
    pub provider_id: String,
    pub capabilities: Vec<ProviderCapability>,
    /// Provider-declared concurrent request limit.
    pub max_concurrent: usize,
    pub health: HealthState,
    /// Requests currently in flight on this session.
    pub active: usize,
    pub last_heartbeat: DateTime<Utc>,
    consecutive_failures: u32,
    cooldown_until: Option<DateTime<Utc>>,
    latencies_ms: VecDeque<u64>,
}

impl ProviderSession {
    /// Rolling average latency over the recent window, if any outcome was
    /// recorded yet.
    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies_ms.iter().sum();
        Some(sum as f64 / self.latencies_ms.len() as f64)
    }

    fn selectable(&self, now: DateTime<Utc>) -> bool {
        if self.active >= self.max_concurrent {
            return false;
        }
        match self.health {
            HealthState::Unhealthy => {
                // Circuit breaker: closed again once the cooldown elapses.
                self.cooldown_until.is_some_and(|until| now >= until)
            }
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

/// Candidate view handed to a [`SelectionPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionCandidate {
    pub provider_id: String,
    pub active: usize,
    pub avg_latency_ms: Option<f64>,
}

/// Strategy that picks one session out of the filtered candidates.
///
/// Implementations must be deterministic given identical inputs and must
/// only return an index into the candidate slice.
pub trait SelectionPolicy: Send + Sync {
    fn select(&mut self, bucket: &str, candidates: &[SelectionCandidate]) -> Option<usize>;
}

/// Default policy: least active requests, ties broken by lowest recent
/// average latency (unknown latency sorts last), then round-robin per
/// method bucket.
#[derive(Debug, Default)]
pub struct LeastActivePolicy {
    cursors: HashMap<String, usize>,
}

impl SelectionPolicy for LeastActivePolicy {
    fn select(&mut self, bucket: &str, candidates: &[SelectionCandidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let min_active = candidates.iter().map(|c| c.active).min()?;
        let latency_key = |c: &SelectionCandidate| c.avg_latency_ms.unwrap_or(f64::MAX);
        let min_latency = candidates
            .iter()
            .filter(|c| c.active == min_active)
            .map(|c| latency_key(c))
            .fold(f64::MAX, f64::min);

        let mut tied: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.active == min_active && latency_key(c) == min_latency)
            .map(|(i, _)| i)
            .collect();
        tied.sort_by(|&a, &b| candidates[a].provider_id.cmp(&candidates[b].provider_id));

        let cursor = self.cursors.entry(bucket.to_owned()).or_insert(0);
        let chosen = tied[*cursor % tied.len()];
        *cursor = cursor.wrapping_add(1);
        Some(chosen)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Health and windowing knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive failures before a session is marked unhealthy.
    pub unhealthy_after: u32,
    /// How long an unhealthy session is excluded from selection.
    pub cooldown: std::time::Duration,
    /// Number of recent latency samples kept per session.
    pub latency_window: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            unhealthy_after: 3,
            cooldown: std::time::Duration::from_secs(30),
            latency_window: 16,
        }
    }
}

pub struct ProviderRegistry {
    config: RegistryConfig,
    protocols: HashMap<String, ProtocolSpec>,
    /// `(protocol, method)` -> provider ids supplying it.
    buckets: HashMap<(String, String), Vec<String>>,
    sessions: HashMap<String, ProviderSession>,
    policy: Box<dyn SelectionPolicy>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("protocols", &self.protocols.keys().collect::<Vec<_>>())
            .field("sessions", &self.sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ProviderRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            protocols: HashMap::new(),
            buckets: HashMap::new(),
            sessions: HashMap::new(),
            policy: Box::new(LeastActivePolicy::default()),
        }
    }

    /// Replace the selection policy.
    pub fn with_policy(mut self, policy: impl SelectionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    // -- protocols ----------------------------------------------------------

    /// Register a protocol. Idempotent for an identical definition; an
    /// incompatible redefinition is rejected.
    pub fn register_protocol(&mut self, spec: ProtocolSpec) -> Result<(), RegistryError> {
        match self.protocols.get(&spec.id) {
            Some(existing) if *existing == spec => Ok(()),
            Some(_) => Err(RegistryError::IncompatibleProtocol(spec.id)),
            None => {
                self.protocols.insert(spec.id.clone(), spec);
                Ok(())
            }
        }
    }

    pub fn protocol(&self, id: &str) -> Option<&ProtocolSpec> {
        self.protocols.get(id)
    }

    /// Whether `(protocol, method)` names a known operation: the protocol is
    /// registered and either declares the method or is open-world.
    pub fn method_known(&self, protocol: &str, method: &str) -> Result<(), RegistryError> {
        let spec = self
            .protocols
            .get(protocol)
            .ok_or_else(|| RegistryError::ProtocolNotFound(protocol.to_owned()))?;
        if spec.methods.contains_key(method) || spec.open_world {
            Ok(())
        } else {
            Err(RegistryError::MethodNotSupported {
                protocol: protocol.to_owned(),
                method: method.to_owned(),
            })
        }
    }

    // -- providers ----------------------------------------------------------

    /// Register a provider session and add it to each advertised method
    /// bucket. Every advertised method must belong to a registered protocol
    /// (or the protocol must permit open-world methods).
    pub fn register_provider(
        &mut self,
        provider_id: impl Into<String>,
        capabilities: Vec<ProviderCapability>,
        max_concurrent: usize,
    ) -> Result<(), RegistryError> {
        let provider_id = provider_id.into();
        if self.sessions.contains_key(&provider_id) {
            return Err(RegistryError::DuplicateProvider {
                provider: provider_id,
            });
        }
        for cap in &capabilities {
            for method in &cap.methods {
                self.method_known(&cap.protocol, method)?;
            }
        }

        for cap in &capabilities {
            for method in &cap.methods {
                self.buckets
                    .entry((cap.protocol.clone(), method.clone()))
                    .or_default()
                    .push(provider_id.clone());
            }
        }
        self.sessions.insert(
            provider_id.clone(),
            ProviderSession {
                provider_id,
                capabilities,
                max_concurrent: max_concurrent.max(1),
                health: HealthState::Unknown,
                active: 0,
                last_heartbeat: Utc::now(),
                consecutive_failures: 0,
                cooldown_until: None,
                latencies_ms: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Remove a provider from every bucket. Returns the removed session so
    /// the engine can fail its in-flight correlations.
    pub fn deregister_provider(&mut self, provider_id: &str) -> Option<ProviderSession> {
        let session = self.sessions.remove(provider_id)?;
        for bucket in self.buckets.values_mut() {
            bucket.retain(|id| id != provider_id);
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        Some(session)
    }

    pub fn session(&self, provider_id: &str) -> Option<&ProviderSession> {
        self.sessions.get(provider_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.sessions.keys().map(String::as_str).collect();
        ids.sort();
        ids
    }

    // -- selection ----------------------------------------------------------

    /// Select a session for `(protocol, method)`, excluding `exclude`.
    pub fn select(
        &mut self,
        protocol: &str,
        method: &str,
        exclude: &[&str],
    ) -> Result<String, RegistryError> {
        self.method_known(protocol, method)?;

        let now = Utc::now();
        let bucket_key = (protocol.to_owned(), method.to_owned());
        let empty = Vec::new();
        let bucket = self.buckets.get(&bucket_key).unwrap_or(&empty);

        let candidates: Vec<SelectionCandidate> = bucket
            .iter()
            .filter(|id| !exclude.contains(&id.as_str()))
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| s.selectable(now))
            .map(|s| SelectionCandidate {
                provider_id: s.provider_id.clone(),
                active: s.active,
                avg_latency_ms: s.avg_latency_ms(),
            })
            .collect();

        if candidates.is_empty() {
            return Err(RegistryError::NoProviderAvailable {
                protocol: protocol.to_owned(),
                method: method.to_owned(),
            });
        }

        let bucket_name = format!("{protocol}/{method}");
        let chosen = self
            .policy
            .select(&bucket_name, &candidates)
            .ok_or_else(|| RegistryError::NoProviderAvailable {
                protocol: protocol.to_owned(),
                method: method.to_owned(),
            })?;
        Ok(candidates[chosen].provider_id.clone())
    }

    // -- health -------------------------------------------------------------

    /// Record a dispatched request against a session.
    pub fn mark_dispatch(&mut self, provider_id: &str) {
        if let Some(session) = self.sessions.get_mut(provider_id) {
            session.active += 1;
        }
    }

    /// Release an in-flight slot without recording an outcome. Used when a
    /// request is cancelled rather than answered.
    pub fn release(&mut self, provider_id: &str) {
        if let Some(session) = self.sessions.get_mut(provider_id) {
            session.active = session.active.saturating_sub(1);
        }
    }

    /// Record a request outcome: updates active count, rolling latency, and
    /// the consecutive-failure circuit breaker.
    pub fn mark_outcome(&mut self, provider_id: &str, success: bool, latency_ms: u64) {
        let Some(session) = self.sessions.get_mut(provider_id) else {
            return;
        };
        session.active = session.active.saturating_sub(1);
        session.latencies_ms.push_back(latency_ms);
        while session.latencies_ms.len() > self.config.latency_window {
            session.latencies_ms.pop_front();
        }

        if success {
            session.consecutive_failures = 0;
            session.health = HealthState::Healthy;
            session.cooldown_until = None;
        } else {
            session.consecutive_failures += 1;
            if session.consecutive_failures >= self.config.unhealthy_after {
                session.health = HealthState::Unhealthy;
                session.cooldown_until = Some(
                    Utc::now()
                        + ChronoDuration::from_std(self.config.cooldown)
                            .unwrap_or(ChronoDuration::seconds(30)),
                );
            } else {
                session.health = HealthState::Degraded;
            }
        }
    }

    /// Record a heartbeat from a session.
    pub fn record_heartbeat(&mut self, provider_id: &str, active_reported: Option<usize>) {
        if let Some(session) = self.sessions.get_mut(provider_id) {
            session.last_heartbeat = Utc::now();
            if session.health == HealthState::Unknown {
                session.health = HealthState::Healthy;
            }
            if let Some(active) = active_reported {
                // The provider's own view wins on drift.
                session.active = active;
            }
        }
    }

    /// Sessions whose last heartbeat is older than `max_age`.
    pub fn stale_sessions(&self, max_age: std::time::Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(max_age).unwrap_or(ChronoDuration::seconds(60));
        let mut stale: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.last_heartbeat < cutoff)
            .map(|s| s.provider_id.clone())
            .collect();
        stale.sort();
        stale
    }
}
