//! Workflow domain types for Weft.
//!
//! Defines the validated intermediate representation for workflows
//! (`WorkflowDefinition`, `StepSpec`, `StepKind`) together with the run and
//! step status enums and the per-step message log entries recorded during
//! execution.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::{Backend, BackendAttempt};

// ---------------------------------------------------------------------------
// Workflow Definition (validated IR)
// ---------------------------------------------------------------------------

/// A validated workflow definition.
///
/// Produced by the definition validator and never mutated afterwards. The
/// dependency graph described by `dependencies` is acyclic and every step id
/// referenced by `dependencies` or `conditions` exists in `steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned at validation time when the source omits one.
    pub id: Uuid,
    /// Workflow name (alphanumeric, `-` and `_`).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whole-run timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Steps in declaration order. Declaration order breaks scheduling ties.
    pub steps: Vec<StepSpec>,
    /// Step id -> prerequisite step ids.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Step id -> boolean expression gating the step.
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    /// Initial variable values seeded into every run.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Declared prerequisites of a step (empty when none).
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single Start step, if present.
    pub fn start_step(&self) -> Option<&StepSpec> {
        self.steps
            .iter()
            .find(|s| matches!(s.kind, StepKind::Start))
    }
}

// ---------------------------------------------------------------------------
// Step definitions
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique step id within the workflow.
    pub id: String,
    /// Display name (defaults to the id).
    #[serde(default)]
    pub name: String,
    /// Kind-specific configuration.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl StepSpec {
    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Steps whose activation this step controls (condition branches, loop
    /// body, parallel branches).
    pub fn controlled_steps(&self) -> Vec<&str> {
        match &self.kind {
            StepKind::Condition {
                true_branch,
                false_branch,
                ..
            } => vec![true_branch.as_str(), false_branch.as_str()],
            StepKind::Loop { body, .. } => body.iter().map(String::as_str).collect(),
            StepKind::Parallel { branches } => branches.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// Closed set of step kinds with their kind-specific fields.
///
/// YAML example:
/// ```yaml
/// - id: summarize
///   kind: agent_call
///   agent_ref: summarizer
///   input_mapping:
///     text: "{{ steps.fetch.output }}"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Entry marker. Exactly one per workflow.
    Start,
    /// Invoke an external agent through the fallback controller.
    AgentCall {
        /// Opaque reference resolved by the agent invoker.
        agent_ref: String,
        /// Template over the execution context, any JSON shape.
        #[serde(default)]
        input_mapping: Value,
        /// Primary backend. Falls back to the engine default when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend: Option<Backend>,
        /// Variable that receives the call output.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
        /// Per-call timeout in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        /// Treat a timeout like throttling (cool down and fall back).
        #[serde(default)]
        retry_on_timeout: bool,
    },
    /// Boolean branch: activates one branch and skips the other.
    Condition {
        expression: String,
        true_branch: String,
        false_branch: String,
    },
    /// Bounded loop over a set of body steps.
    Loop {
        body: Vec<String>,
        max_iterations: u32,
        exit_condition: String,
    },
    /// Fan-out barrier over concurrently running branches.
    Parallel { branches: Vec<String> },
    /// Recovery policy for one guarded step.
    ErrorHandler {
        guards: String,
        action: RecoveryAction,
        #[serde(default = "default_handler_attempts")]
        max_attempts: u32,
    },
    /// Terminal marker. Records the run output.
    End,
}

fn default_handler_attempts() -> u32 {
    3
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Start => StepType::Start,
            StepKind::AgentCall { .. } => StepType::AgentCall,
            StepKind::Condition { .. } => StepType::Condition,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Parallel { .. } => StepType::Parallel,
            StepKind::ErrorHandler { .. } => StepType::ErrorHandler,
            StepKind::End => StepType::End,
        }
    }
}

/// Field-less discriminant of [`StepKind`], used in logs, events and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    AgentCall,
    Condition,
    Loop,
    Parallel,
    ErrorHandler,
    End,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepType::Start => "start",
            StepType::AgentCall => "agent_call",
            StepType::Condition => "condition",
            StepType::Loop => "loop",
            StepType::Parallel => "parallel",
            StepType::ErrorHandler => "error_handler",
            StepType::End => "end",
        };
        f.write_str(s)
    }
}

/// What an error handler does when its guarded step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-enqueue the guarded step (bounded by the handler's `max_attempts`).
    Retry,
    /// Mark the guarded step skipped and continue.
    Skip,
    /// Fail the whole run.
    FailWorkflow,
}

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed and Failed runs never change again.
    pub fn is_final(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Message log
// ---------------------------------------------------------------------------

/// One entry of a run's append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMessage {
    pub step_id: String,
    pub kind: StepType,
    pub status: StepStatus,
    /// Short result or error summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Backend attempts made by an agent call, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<BackendAttempt>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_call_step_deserializes_with_defaults() {
        let step: StepSpec = serde_json::from_value(json!({
            "id": "a1",
            "kind": "agent_call",
            "agent_ref": "solver",
        }))
        .unwrap();

        assert_eq!(step.step_type(), StepType::AgentCall);
        match step.kind {
            StepKind::AgentCall {
                agent_ref,
                backend,
                retry_on_timeout,
                ..
            } => {
                assert_eq!(agent_ref, "solver");
                assert!(backend.is_none());
                assert!(!retry_on_timeout);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn error_handler_defaults_to_three_attempts() {
        let kind: StepKind = serde_json::from_value(json!({
            "kind": "error_handler",
            "guards": "a1",
            "action": "retry",
        }))
        .unwrap();
        assert_eq!(
            kind,
            StepKind::ErrorHandler {
                guards: "a1".to_string(),
                action: RecoveryAction::Retry,
                max_attempts: 3,
            }
        );
    }

    #[test]
    fn controlled_steps_per_kind() {
        let cond = StepSpec {
            id: "c1".to_string(),
            name: "c1".to_string(),
            kind: StepKind::Condition {
                expression: "flag".to_string(),
                true_branch: "a".to_string(),
                false_branch: "b".to_string(),
            },
        };
        assert_eq!(cond.controlled_steps(), vec!["a", "b"]);

        let start = StepSpec {
            id: "start".to_string(),
            name: "start".to_string(),
            kind: StepKind::Start,
        };
        assert!(start.controlled_steps().is_empty());
    }

    #[test]
    fn run_status_finality() {
        assert!(RunStatus::Completed.is_final());
        assert!(RunStatus::Failed.is_final());
        assert!(!RunStatus::Cancelled.is_final());
        assert!(!RunStatus::Running.is_final());
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
    }
}
