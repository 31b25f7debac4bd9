//! Error taxonomy shared by the engine, providers, and submitters.
//!
//! Codes are stable wire identifiers, not Rust type names. Every code has a
//! category which decides whether the engine retries it by default; a
//! provider may override retryability per response via
//! [`TaskError::retryable`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Broad classification of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected input; never retried.
    Validation,
    /// Expected to succeed on a later attempt; retryable by default.
    Transient,
    /// Deterministic task-level failure; not retried.
    Permanent,
    /// Engine or configuration fault; surfaced, not retried.
    System,
}

/// Stable error codes for task and workflow failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Validation
    InvalidParams,
    MethodNotSupported,
    ProtocolNotFound,
    WorkflowValidationFailed,
    WorkflowCircularDependency,
    UnresolvedReference,
    FieldNotFound,
    // Transient
    ProviderTimeout,
    ProviderOverloaded,
    ProviderDisconnected,
    ConnectionTimeout,
    ConnectionLost,
    PersistenceTransient,
    TaskTimeout,
    NoProviderAvailableTransient,
    // Permanent
    TaskExecutionFailed,
    Cancelled,
    TaskResultInvalid,
    // System
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::InvalidParams
            | Self::MethodNotSupported
            | Self::ProtocolNotFound
            | Self::WorkflowValidationFailed
            | Self::WorkflowCircularDependency
            | Self::UnresolvedReference
            | Self::FieldNotFound => ErrorCategory::Validation,
            Self::ProviderTimeout
            | Self::ProviderOverloaded
            | Self::ProviderDisconnected
            | Self::ConnectionTimeout
            | Self::ConnectionLost
            | Self::PersistenceTransient
            | Self::TaskTimeout
            | Self::NoProviderAvailableTransient => ErrorCategory::Transient,
            Self::TaskExecutionFailed | Self::Cancelled | Self::TaskResultInvalid => {
                ErrorCategory::Permanent
            }
            Self::ConfigurationError | Self::InternalError => ErrorCategory::System,
        }
    }

    /// Whether the engine retries this code when the provider did not
    /// classify explicitly. Only transient categories retry by default.
    pub fn default_retryable(self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidParams => "invalid_params",
            Self::MethodNotSupported => "method_not_supported",
            Self::ProtocolNotFound => "protocol_not_found",
            Self::WorkflowValidationFailed => "workflow_validation_failed",
            Self::WorkflowCircularDependency => "workflow_circular_dependency",
            Self::UnresolvedReference => "unresolved_reference",
            Self::FieldNotFound => "field_not_found",
            Self::ProviderTimeout => "provider_timeout",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::ProviderDisconnected => "provider_disconnected",
            Self::ConnectionTimeout => "connection_timeout",
            Self::ConnectionLost => "connection_lost",
            Self::PersistenceTransient => "persistence_transient",
            Self::TaskTimeout => "task_timeout",
            Self::NoProviderAvailableTransient => "no_provider_available_transient",
            Self::TaskExecutionFailed => "task_execution_failed",
            Self::Cancelled => "cancelled",
            Self::TaskResultInvalid => "task_result_invalid",
            Self::ConfigurationError => "configuration_error",
            Self::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

impl FromStr for ErrorCode {
    type Err = ErrorCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_params" => Ok(Self::InvalidParams),
            "method_not_supported" => Ok(Self::MethodNotSupported),
            "protocol_not_found" => Ok(Self::ProtocolNotFound),
            "workflow_validation_failed" => Ok(Self::WorkflowValidationFailed),
            "workflow_circular_dependency" => Ok(Self::WorkflowCircularDependency),
            "unresolved_reference" => Ok(Self::UnresolvedReference),
            "field_not_found" => Ok(Self::FieldNotFound),
            "provider_timeout" => Ok(Self::ProviderTimeout),
            "provider_overloaded" => Ok(Self::ProviderOverloaded),
            "provider_disconnected" => Ok(Self::ProviderDisconnected),
            "connection_timeout" => Ok(Self::ConnectionTimeout),
            "connection_lost" => Ok(Self::ConnectionLost),
            "persistence_transient" => Ok(Self::PersistenceTransient),
            "task_timeout" => Ok(Self::TaskTimeout),
            "no_provider_available_transient" => Ok(Self::NoProviderAvailableTransient),
            "task_execution_failed" => Ok(Self::TaskExecutionFailed),
            "cancelled" => Ok(Self::Cancelled),
            "task_result_invalid" => Ok(Self::TaskResultInvalid),
            "configuration_error" => Ok(Self::ConfigurationError),
            "internal_error" => Ok(Self::InternalError),
            other => Err(ErrorCodeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ErrorCode`] string.
#[derive(Debug, Clone)]
pub struct ErrorCodeParseError(pub String);

impl fmt::Display for ErrorCodeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {:?}", self.0)
    }
}

impl std::error::Error for ErrorCodeParseError {}

// ---------------------------------------------------------------------------

/// The wire error object recorded against a task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    /// Explicit provider classification. When absent, the code's category
    /// decides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: None,
        }
    }

    /// Effective retryability: explicit classification wins, otherwise the
    /// code's default.
    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or_else(|| self.code.default_retryable())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TaskError {}
