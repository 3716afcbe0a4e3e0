//! Agent invocation types: backend identity, requests, and the classified
//! error taxonomy produced at the invocation boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A concrete (provider, model) pair an agent call is executed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Backend {
    pub provider: String,
    pub model: String,
}

impl Backend {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// A single agent invocation as seen by the invoker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub run_id: Uuid,
    pub step_id: String,
    pub agent_ref: String,
    pub backend: Backend,
    /// Resolved input payload (opaque to the engine).
    pub input: Value,
}

/// Why a backend refused a call for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalKind {
    Authentication,
    Permission,
    InvalidRequest,
    Timeout,
    Other,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FatalKind::Authentication => "authentication",
            FatalKind::Permission => "permission",
            FatalKind::InvalidRequest => "invalid request",
            FatalKind::Timeout => "timeout",
            FatalKind::Other => "backend",
        };
        f.write_str(s)
    }
}

/// Classified agent invocation failure.
///
/// Classification happens once, where the raw transport error is first seen.
/// The engine only ever branches on these variants.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentError {
    #[error("throttled (retry after {retry_after_ms:?}ms): {message}")]
    Throttled {
        retry_after_ms: Option<u64>,
        message: String,
    },

    #[error("{kind} error: {message}")]
    FatalBackend { kind: FatalKind, message: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolFailure { tool: String, message: String },
}

impl AgentError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, AgentError::Throttled { .. })
    }

    /// Backend-provided retry-after hint, when throttled.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AgentError::Throttled { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

/// Outcome of one backend attempt within an agent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Throttled,
    Failed,
}

/// Record of one backend attempt, kept in the step's message entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendAttempt {
    pub backend: Backend,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
