//! Configuration types for Weft.
//!
//! `WeftConfig` is the top-level `weft.toml` controlling engine defaults, the
//! backend fallback table and the agent endpoint. Every field has a default,
//! so an empty file is a valid configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::Backend;

/// Per-step timeout when neither the step nor `weft.toml` sets one.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Whole-run timeout when neither the workflow nor `weft.toml` sets one.
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Finished runs kept in the engine's in-process status table.
pub const DEFAULT_RETAINED_RUNS: usize = 64;

/// Top-level configuration loaded from `~/.weft/weft.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fallback: FallbackTable,
    #[serde(default)]
    pub agent: AgentEndpointConfig,
}

/// Engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend used by agent calls that do not name one.
    #[serde(default = "default_backend")]
    pub default_backend: Backend,
    /// Per-step timeout when a step does not set its own.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Whole-run timeout when a workflow does not set its own.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
    /// Delete checkpoints of completed runs.
    #[serde(default = "default_true")]
    pub cleanup_completed: bool,
    /// Capacity of the observability broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Finished runs whose final state stays queryable in memory. Older
    /// ones are answered from the checkpoint store.
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_backend() -> Backend {
    Backend::new("openai", "gpt-4o-mini")
}

fn default_step_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_workflow_timeout_secs() -> u64 {
    DEFAULT_WORKFLOW_TIMEOUT_SECS
}

fn default_retained_runs() -> usize {
    DEFAULT_RETAINED_RUNS
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            step_timeout_secs: default_step_timeout_secs(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            cleanup_completed: default_true(),
            event_capacity: default_event_capacity(),
            retained_runs: default_retained_runs(),
        }
    }
}

/// Prioritized substitutes for throttled backends.
///
/// ```toml
/// [fallback]
/// default_cooldown_secs = 60
///
/// [fallback.models]
/// groq = ["m1", "m2"]
///
/// [[fallback.alternates]]
/// provider = "openai"
/// model = "gpt-4o-mini"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackTable {
    /// Provider -> ordered model list tried before switching providers.
    #[serde(default)]
    pub models: BTreeMap<String, Vec<String>>,
    /// Alternate providers in priority order, each with its default model.
    #[serde(default)]
    pub alternates: Vec<Backend>,
    /// Cooldown applied when a throttled response carries no retry-after.
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    /// Upper bound on any single cooldown.
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
    /// Maximum backend attempts per agent call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_max_cooldown_secs() -> u64 {
    86_400
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self {
            models: BTreeMap::new(),
            alternates: Vec::new(),
            default_cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// HTTP agent endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    /// Endpoint receiving agent invocations. `None` selects the echo invoker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Environment variable holding a bearer token for the endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Transport-level timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key_env: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: WeftConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.step_timeout_secs, DEFAULT_STEP_TIMEOUT_SECS);
        assert_eq!(config.engine.workflow_timeout_secs, DEFAULT_WORKFLOW_TIMEOUT_SECS);
        assert_eq!(config.engine.retained_runs, DEFAULT_RETAINED_RUNS);
        assert_eq!(DEFAULT_STEP_TIMEOUT_SECS, 300);
        assert_eq!(DEFAULT_WORKFLOW_TIMEOUT_SECS, 1800);
        assert!(config.engine.cleanup_completed);
        assert_eq!(config.fallback.default_cooldown_secs, 60);
        assert_eq!(config.fallback.max_attempts, 5);
        assert!(config.agent.url.is_none());
    }

    #[test]
    fn fallback_table_parses() {
        let toml_str = r#"
[engine]
default_backend = { provider = "groq", model = "m1" }

[fallback]
default_cooldown_secs = 30

[fallback.models]
groq = ["m1", "m2"]

[[fallback.alternates]]
provider = "openai"
model = "gpt-4o-mini"
"#;
        let config: WeftConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.default_backend, Backend::new("groq", "m1"));
        assert_eq!(config.fallback.default_cooldown_secs, 30);
        assert_eq!(config.fallback.models["groq"], vec!["m1", "m2"]);
        assert_eq!(config.fallback.alternates[0].provider, "openai");
        assert_eq!(config.fallback.max_attempts, 5);
    }
}
