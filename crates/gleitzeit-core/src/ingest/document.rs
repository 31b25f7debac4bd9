//! Workflow document types.
//!
//! These map directly to the on-disk workflow file (TOML or JSON) and are
//! deserialized via `serde`. String-typed fields like `priority` are kept
//! verbatim here and validated during ingestion, so rejection messages can
//! name the task they came from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level structure of a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDocument {
    /// Human-readable workflow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Document kind; `batch` enables template expansion.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Failure strategy: `fail_fast` (default) or `continue_on_error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDocument>,
    /// Only meaningful for `type = "batch"` documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TaskDocument>,
}

/// A single task entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDocument {
    /// Unique id within the workflow; referenced by `dependencies` and by
    /// `${id.path}` substitution tokens.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Protocol id, e.g. `llm/v1`.
    pub protocol: String,
    /// Method within the protocol, e.g. `chat`.
    pub method: String,
    /// Ids of sibling tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// `urgent`, `high`, `normal` (default), or `low`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<crate::retry::RetryPolicy>,
    /// Parameter tree; string leaves may carry substitution tokens.
    /// Kept last so TOML serialization emits scalars before tables.
    #[serde(default = "default_params")]
    pub params: Value,
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

/// File-discovery settings for `type = "batch"` documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSpec {
    /// Directory to scan (non-recursive).
    pub directory: String,
    /// `*`-wildcard filename pattern, e.g. `*.txt`.
    pub pattern: String,
}

/// Parse a TOML workflow document.
pub fn parse_document_toml(content: &str) -> Result<WorkflowDocument, toml::de::Error> {
    toml::from_str(content)
}

/// Parse a JSON workflow document.
pub fn parse_document_json(content: &str) -> Result<WorkflowDocument, serde_json::Error> {
    serde_json::from_str(content)
}
