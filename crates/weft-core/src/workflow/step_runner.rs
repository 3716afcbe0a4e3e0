//! Step executors for the seven step kinds.
//!
//! `StepRunner` takes a read-only view of the execution context and returns a
//! `StepOutput` describing what the scheduler should apply. It never mutates
//! run state itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use weft_types::agent::{Backend, BackendAttempt};
use weft_types::workflow::{RecoveryAction, StepKind, StepSpec};

use super::context::{ContextError, ExecutionContext};
use super::expression::{ExpressionError, evaluate_condition};
use crate::agent::fallback::{AgentCall, FallbackController, FallbackError};
use crate::agent::invoker::AgentInvoker;

// ---------------------------------------------------------------------------
// StepOutput
// ---------------------------------------------------------------------------

/// What a step produced, as seen by the scheduler.
#[derive(Debug, Clone)]
pub enum StepOutput {
    /// Plain result (Start, End).
    Value(Value),
    /// AgentCall result with the backend that served it.
    Agent {
        output: Value,
        backend: Backend,
        attempts: Vec<BackendAttempt>,
    },
    /// Condition outcome.
    Branch {
        condition_met: bool,
        selected: String,
        skipped: String,
    },
    /// Parallel fan-out; the step completes at the barrier.
    FanOut { branches: Vec<String> },
    /// Loop enters iteration `iteration` (1-based).
    LoopEnter { iteration: u32 },
    /// Loop exit condition held.
    LoopExit { iterations: u32 },
}

impl StepOutput {
    /// JSON form stored in `step_results`.
    pub fn to_value(&self) -> Value {
        match self {
            StepOutput::Value(v) => v.clone(),
            StepOutput::Agent { output, .. } => output.clone(),
            StepOutput::Branch {
                condition_met,
                selected,
                skipped,
            } => json!({
                "condition_met": condition_met,
                "selected": selected,
                "skipped": skipped,
            }),
            StepOutput::FanOut { branches } => json!({ "branches": branches }),
            StepOutput::LoopEnter { iteration } => json!({ "iteration": iteration }),
            StepOutput::LoopExit { iterations } => json!({ "iterations": iterations }),
        }
    }

    /// Short human-readable summary for messages and events.
    pub fn summary(&self) -> String {
        match self {
            StepOutput::Value(_) => "ok".to_string(),
            StepOutput::Agent { backend, .. } => format!("served by {backend}"),
            StepOutput::Branch {
                condition_met,
                selected,
                ..
            } => format!("condition {condition_met}, selected '{selected}'"),
            StepOutput::FanOut { branches } => format!("fanned out {} branch(es)", branches.len()),
            StepOutput::LoopEnter { iteration } => format!("iteration {iteration}"),
            StepOutput::LoopExit { iterations } => {
                format!("exit condition met after {iterations} iteration(s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Agent(#[from] FallbackError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("loop '{step_id}' reached its bound of {max_iterations} iteration(s) without meeting its exit condition")]
    LoopBoundExceeded { step_id: String, max_iterations: u32 },

    #[error("parallel step '{step_id}' had failing branch(es): {}", .failed.join(", "))]
    BranchesFailed { step_id: String, failed: Vec<String> },

    #[error("step timed out after {0}s")]
    Timeout(u64),

    #[error("step cancelled")]
    Cancelled,

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("{0}")]
    Invalid(String),
}

impl StepError {
    /// Backend attempts made before the failure (agent calls only).
    pub fn attempts(&self) -> &[BackendAttempt] {
        match self {
            StepError::Agent(err) => err.attempts(),
            _ => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            StepError::Cancelled | StepError::Agent(FallbackError::Cancelled { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Recovery decisions
// ---------------------------------------------------------------------------

/// What an error handler decides for a failed guarded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Re-run the guarded step; carries the 1-based retry number.
    Retry(u32),
    Skip,
    Fail,
    /// Retry budget used up.
    Exhausted,
}

/// Decide how a handler reacts given the retries it has already granted.
pub fn decide_recovery(action: RecoveryAction, max_attempts: u32, used: u32) -> Recovery {
    match action {
        RecoveryAction::Retry if used < max_attempts => Recovery::Retry(used + 1),
        RecoveryAction::Retry => Recovery::Exhausted,
        RecoveryAction::Skip => Recovery::Skip,
        RecoveryAction::FailWorkflow => Recovery::Fail,
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual steps by dispatching on their kind.
pub struct StepRunner<A: AgentInvoker> {
    invoker: Arc<A>,
    fallback: Arc<FallbackController>,
    default_backend: Backend,
    default_timeout: Duration,
}

impl<A: AgentInvoker> StepRunner<A> {
    pub fn new(
        invoker: Arc<A>,
        fallback: Arc<FallbackController>,
        default_backend: Backend,
        default_timeout: Duration,
    ) -> Self {
        Self {
            invoker,
            fallback,
            default_backend,
            default_timeout,
        }
    }

    pub fn fallback(&self) -> &Arc<FallbackController> {
        &self.fallback
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run a step against a snapshot of the context.
    pub async fn run(
        &self,
        step: &StepSpec,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        match &step.kind {
            StepKind::Start => Ok(StepOutput::Value(json!({ "status": "started" }))),
            StepKind::AgentCall {
                agent_ref,
                input_mapping,
                backend,
                timeout_secs,
                retry_on_timeout,
                ..
            } => {
                let input = if input_mapping.is_null() {
                    ctx.input_data.clone()
                } else {
                    ctx.resolve_value(input_mapping)
                };
                let call = AgentCall {
                    run_id: ctx.run_id,
                    step_id: step.id.clone(),
                    agent_ref: agent_ref.clone(),
                    input,
                    primary: backend.clone().unwrap_or_else(|| self.default_backend.clone()),
                    timeout: timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(self.default_timeout),
                    retry_on_timeout: *retry_on_timeout,
                };
                let result = self.fallback.call(self.invoker.as_ref(), call, cancel).await?;
                Ok(StepOutput::Agent {
                    output: result.output,
                    backend: result.backend,
                    attempts: result.attempts,
                })
            }
            StepKind::Condition {
                expression,
                true_branch,
                false_branch,
            } => {
                let condition_met = evaluate_condition(expression, ctx)?;
                let (selected, skipped) = if condition_met {
                    (true_branch, false_branch)
                } else {
                    (false_branch, true_branch)
                };
                Ok(StepOutput::Branch {
                    condition_met,
                    selected: selected.clone(),
                    skipped: skipped.clone(),
                })
            }
            StepKind::Loop {
                max_iterations,
                exit_condition,
                ..
            } => run_loop(&step.id, *max_iterations, exit_condition, ctx),
            StepKind::Parallel { branches } => Ok(StepOutput::FanOut {
                branches: branches.clone(),
            }),
            StepKind::ErrorHandler { .. } => Err(StepError::Invalid(format!(
                "error handler '{}' runs only when its guarded step fails",
                step.id
            ))),
            StepKind::End => Ok(StepOutput::Value(json!({
                "variables": ctx.variables,
                "step_results": ctx.step_results,
            }))),
        }
    }
}

/// Exit check before each iteration, then the bound check.
fn run_loop(
    step_id: &str,
    max_iterations: u32,
    exit_condition: &str,
    ctx: &ExecutionContext,
) -> Result<StepOutput, StepError> {
    let entered = ctx.loop_iterations.get(step_id).copied().unwrap_or(0);
    // The exit condition sees iteration 0 before the first pass.
    let first_pass;
    let view = if ctx.loop_iterations.contains_key(step_id) {
        ctx
    } else {
        let mut scoped = ctx.clone();
        scoped.loop_iterations.insert(step_id.to_string(), 0);
        first_pass = scoped;
        &first_pass
    };
    if evaluate_condition(exit_condition, view)? {
        return Ok(StepOutput::LoopExit {
            iterations: entered,
        });
    }
    if entered >= max_iterations {
        return Err(StepError::LoopBoundExceeded {
            step_id: step_id.to_string(),
            max_iterations,
        });
    }
    Ok(StepOutput::LoopEnter {
        iteration: entered + 1,
    })
}
