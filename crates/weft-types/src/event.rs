//! Observability events emitted by the engine.
//!
//! Events are published on a broadcast bus; consumers never influence
//! scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{RunStatus, StepStatus, StepType};

/// A single step state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    pub run_id: Uuid,
    pub step_id: String,
    pub kind: StepType,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        resumed: bool,
    },
    StepTransition(StepTransition),
    RunFinished {
        run_id: Uuid,
        workflow_name: String,
        status: RunStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. } => *run_id,
            WorkflowEvent::StepTransition(t) => t.run_id,
            WorkflowEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}
