//! Event-driven dependency scheduler.
//!
//! One `RunCoordinator` drives one run. Each pass settles the frontier to a
//! fixpoint (skips, barriers, loop re-entry, handler bookkeeping), dispatches
//! every ready step onto a `JoinSet` in declaration order, then waits for the
//! next completion, cancellation or the run deadline. Step tasks only get a
//! clone of the context; their outputs are applied here, one at a time, and
//! every apply is checkpointed.
//!
//! Readiness rules:
//! - a step waits until all its prerequisites are completed or skipped;
//! - a failed prerequisite skips the step ("upstream failed");
//! - a step whose declared dependencies were all skipped is skipped;
//! - a false `conditions` entry skips the step, an evaluation error fails it;
//! - controlled steps wait for activation and are skipped once their
//!   controller resolves without activating them;
//! - the End step waits until every other step has settled;
//! - error handlers never run on their own: they act when the guarded step
//!   fails and are skipped once it resolves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::agent::BackendAttempt;
use weft_types::event::{StepTransition, WorkflowEvent};
use weft_types::workflow::{
    RunStatus, StepKind, StepMessage, StepSpec, StepStatus, WorkflowDefinition,
};

use super::checkpoint::{CheckpointManager, CheckpointStore};
use super::context::ExecutionContext;
use super::dag::WorkflowPlan;
use super::executor::ExecutorError;
use super::expression::evaluate_condition;
use super::step_runner::{Recovery, StepError, StepOutput, StepRunner, decide_recovery};
use crate::agent::invoker::AgentInvoker;
use crate::event::bus::EventBus;

type StepTask = (String, Result<StepOutput, StepError>);

enum Readiness {
    Wait,
    Ready,
    Skip(String),
    Fail(StepError),
}

enum Tick {
    Cancelled,
    TimedOut,
    Joined(Option<Result<StepTask, tokio::task::JoinError>>),
}

/// Collaborators a coordinator needs, shared with the engine.
pub(crate) struct RunServices<A: AgentInvoker, S: CheckpointStore> {
    pub runner: Arc<StepRunner<A>>,
    pub checkpoint: Arc<CheckpointManager<S>>,
    pub events: EventBus,
    pub runs: Arc<DashMap<Uuid, ExecutionContext>>,
}

impl<A: AgentInvoker, S: CheckpointStore> Clone for RunServices<A, S> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            checkpoint: Arc::clone(&self.checkpoint),
            events: self.events.clone(),
            runs: Arc::clone(&self.runs),
        }
    }
}

/// Drives a single run from its current context to a terminal state.
pub(crate) struct RunCoordinator<A: AgentInvoker, S: CheckpointStore> {
    definition: Arc<WorkflowDefinition>,
    plan: WorkflowPlan,
    services: RunServices<A, S>,
    cancel: CancellationToken,
    workflow_timeout: Duration,
    ctx: ExecutionContext,
    /// Step id -> dispatch time.
    in_flight: HashMap<String, DateTime<Utc>>,
    /// Set on the first unrecovered failure.
    halted: Option<String>,
}

impl<A, S> RunCoordinator<A, S>
where
    A: AgentInvoker + 'static,
    S: CheckpointStore + 'static,
{
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        services: RunServices<A, S>,
        ctx: ExecutionContext,
        cancel: CancellationToken,
        workflow_timeout: Duration,
    ) -> Self {
        let plan = WorkflowPlan::new(&definition);
        Self {
            definition,
            plan,
            services,
            cancel,
            workflow_timeout,
            ctx,
            in_flight: HashMap::new(),
            halted: None,
        }
    }

    /// Run to a terminal state and return the final context.
    pub(crate) async fn run(mut self) -> Result<ExecutionContext, ExecutorError> {
        let mut tasks: JoinSet<StepTask> = JoinSet::new();
        let steps_cancel = self.cancel.child_token();
        let cancel = self.cancel.clone();
        let deadline = deadline_after(self.workflow_timeout);

        self.commit().await?;

        loop {
            if self.halted.is_none() && !cancel.is_cancelled() {
                let ready = self.settle().await?;
                if self.halted.is_none() {
                    for step_id in ready {
                        self.dispatch(&mut tasks, &step_id, &steps_cancel);
                    }
                }
            }

            if tasks.is_empty() {
                if cancel.is_cancelled() && self.halted.is_none() {
                    return self.finish(RunStatus::Cancelled).await;
                }
                break;
            }

            let tick = tokio::select! {
                biased;
                _ = cancel.cancelled() => Tick::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Tick::TimedOut,
                joined = tasks.join_next() => Tick::Joined(joined),
            };

            match tick {
                Tick::Cancelled => {
                    tracing::info!(run_id = %self.ctx.run_id, "run cancelled, draining in-flight steps");
                    steps_cancel.cancel();
                    self.drain_cancelled(&mut tasks).await?;
                    if self.halted.is_some() {
                        break;
                    }
                    return self.finish(RunStatus::Cancelled).await;
                }
                Tick::TimedOut => {
                    let message = format!(
                        "workflow timed out after {}s",
                        self.workflow_timeout.as_secs()
                    );
                    tracing::error!(run_id = %self.ctx.run_id, "{message}");
                    if self.halted.is_none() {
                        self.halted = Some(message);
                    }
                    steps_cancel.cancel();
                    while let Some(joined) = tasks.join_next().await {
                        let (step_id, result) = joined.map_err(|e| ExecutorError::Join(e.to_string()))?;
                        let started_at = self.in_flight.remove(&step_id);
                        self.record_discarded(&step_id, &result, started_at);
                    }
                    break;
                }
                Tick::Joined(None) => {}
                Tick::Joined(Some(joined)) => {
                    let (step_id, result) = joined.map_err(|e| ExecutorError::Join(e.to_string()))?;
                    self.apply(step_id, result).await?;
                }
            }
        }

        match self.halted.take() {
            Some(error) => {
                self.ctx.error = Some(error);
                self.finish(RunStatus::Failed).await
            }
            None => {
                let stalled: Vec<&str> = self
                    .plan
                    .order()
                    .iter()
                    .filter(|id| !self.ctx.is_settled(id))
                    .map(String::as_str)
                    .collect();
                if stalled.is_empty() {
                    self.finish(RunStatus::Completed).await
                } else {
                    self.ctx.error = Some(format!(
                        "run stalled: step(s) never became ready: {}",
                        stalled.join(", ")
                    ));
                    self.finish(RunStatus::Failed).await
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Frontier
    // -----------------------------------------------------------------------

    /// Apply skips and barrier completions until nothing changes, then return
    /// the ready steps in declaration order.
    async fn settle(&mut self) -> Result<Vec<String>, ExecutorError> {
        loop {
            let mut changed = false;
            let mut ready = Vec::new();

            for step_id in self.plan.order().to_vec() {
                if self.halted.is_some() {
                    return Ok(Vec::new());
                }
                if self.in_flight.contains_key(&step_id) {
                    continue;
                }
                let Some(spec) = self.plan.spec(&step_id).cloned() else {
                    continue;
                };

                if self.ctx.waiting_steps.contains(&step_id) {
                    match &spec.kind {
                        StepKind::Parallel { branches }
                            if branches.iter().all(|b| self.ctx.is_settled(b)) =>
                        {
                            self.close_parallel(&step_id, branches).await?;
                            changed = true;
                        }
                        StepKind::Loop { .. }
                            if self
                                .plan
                                .subtree(&step_id)
                                .iter()
                                .all(|s| self.ctx.is_resolved(s)) =>
                        {
                            ready.push(step_id);
                        }
                        _ => {}
                    }
                    continue;
                }

                if self.ctx.is_settled(&step_id) {
                    continue;
                }

                match self.readiness(&spec) {
                    Readiness::Wait => {}
                    Readiness::Ready => ready.push(step_id),
                    Readiness::Skip(reason) => {
                        self.skip_step(&step_id, reason).await?;
                        changed = true;
                    }
                    Readiness::Fail(err) => {
                        self.fail_step(&step_id, err, None).await?;
                        changed = true;
                    }
                }
            }

            if !changed {
                return Ok(ready);
            }
        }
    }

    fn readiness(&self, spec: &StepSpec) -> Readiness {
        let id = spec.id.as_str();

        if let StepKind::ErrorHandler { guards, .. } = &spec.kind {
            return if self.ctx.is_resolved(guards) {
                Readiness::Skip(format!("'{guards}' did not fail"))
            } else {
                Readiness::Wait
            };
        }

        if let Some(controller) = self.plan.controller_of(id) {
            if !self.ctx.activated_steps.contains(id) {
                return if self.ctx.is_resolved(controller) {
                    Readiness::Skip(format!("not activated by '{controller}'"))
                } else {
                    Readiness::Wait
                };
            }
        }

        let prerequisites = self.plan.prerequisites(id);
        if let Some(failed) = prerequisites
            .iter()
            .find(|d| self.ctx.failed_steps.contains(*d))
        {
            return Readiness::Skip(format!("upstream failed: '{failed}'"));
        }
        if !prerequisites.iter().all(|d| self.ctx.is_resolved(d)) {
            return Readiness::Wait;
        }

        let declared = self.definition.dependencies_of(id);
        if !declared.is_empty() && declared.iter().all(|d| self.ctx.skipped_steps.contains(d)) {
            return Readiness::Skip("all dependencies skipped".to_string());
        }

        if matches!(spec.kind, StepKind::End) {
            let others_settled = self
                .plan
                .order()
                .iter()
                .filter(|other| other.as_str() != id && !self.plan.is_handler(other))
                .all(|other| self.ctx.is_settled(other) && !self.in_flight.contains_key(other));
            if !others_settled {
                return Readiness::Wait;
            }
        }

        if let Some(expression) = self.definition.conditions.get(id) {
            return match evaluate_condition(expression, &self.ctx) {
                Ok(true) => Readiness::Ready,
                Ok(false) => Readiness::Skip(format!("condition '{expression}' is false")),
                Err(err) => Readiness::Fail(err.into()),
            };
        }

        Readiness::Ready
    }

    fn dispatch(
        &mut self,
        tasks: &mut JoinSet<StepTask>,
        step_id: &str,
        steps_cancel: &CancellationToken,
    ) {
        let Some(spec) = self.plan.spec(step_id).cloned() else {
            return;
        };
        let started_at = Utc::now();
        self.in_flight.insert(step_id.to_string(), started_at);

        tracing::debug!(
            run_id = %self.ctx.run_id,
            step_id,
            kind = %spec.step_type(),
            "dispatching step"
        );
        self.publish(step_id, StepStatus::Running, Some(started_at), None, None);

        let runner = Arc::clone(&self.services.runner);
        let view = self.ctx.clone();
        let token = steps_cancel.child_token();
        let is_agent = matches!(spec.kind, StepKind::AgentCall { .. });
        let step_timeout = runner.default_timeout();

        tasks.spawn(async move {
            let result = if is_agent {
                // Agent calls bound each attempt themselves.
                runner.run(&spec, &view, &token).await
            } else {
                match tokio::time::timeout(step_timeout, runner.run(&spec, &view, &token)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout(step_timeout.as_secs())),
                }
            };
            (spec.id, result)
        });
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    async fn apply(
        &mut self,
        step_id: String,
        result: Result<StepOutput, StepError>,
    ) -> Result<(), ExecutorError> {
        let started_at = self.in_flight.remove(&step_id);
        if self.halted.is_some() {
            self.record_discarded(&step_id, &result, started_at);
            return Ok(());
        }
        match result {
            Ok(output) => self.complete_step(&step_id, output, started_at).await,
            Err(err) => self.fail_step(&step_id, err, started_at).await,
        }
    }

    async fn complete_step(
        &mut self,
        step_id: &str,
        output: StepOutput,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), ExecutorError> {
        let Some(spec) = self.plan.spec(step_id).cloned() else {
            return Ok(());
        };

        match output {
            StepOutput::FanOut { branches } => {
                self.ctx.activated_steps.extend(branches.iter().cloned());
                self.ctx.mark_waiting(step_id);
                let summary = StepOutput::FanOut { branches }.summary();
                self.publish(step_id, StepStatus::Running, started_at, Some(summary), None);
                self.commit().await
            }
            StepOutput::LoopEnter { iteration } => {
                let subtree = self.plan.subtree(step_id);
                for s in &subtree {
                    self.ctx.activated_steps.remove(s);
                    // Each iteration gets a fresh retry budget.
                    self.ctx.handler_attempts.remove(s);
                }
                self.ctx.reset_steps(&subtree);
                self.ctx
                    .loop_iterations
                    .insert(step_id.to_string(), iteration);
                if let StepKind::Loop { body, .. } = &spec.kind {
                    self.ctx.activated_steps.extend(body.iter().cloned());
                }
                self.ctx.mark_waiting(step_id);

                tracing::debug!(run_id = %self.ctx.run_id, step_id, iteration, "loop entering iteration");
                self.publish(
                    step_id,
                    StepStatus::Running,
                    started_at,
                    Some(format!("iteration {iteration}")),
                    None,
                );
                self.commit().await
            }
            output => {
                let value = output.to_value();
                if let Err(err) = self.ctx.set_step_result(step_id, value.clone()) {
                    return self.fail_step(step_id, err.into(), started_at).await;
                }

                let mut attempts = Vec::new();
                let mut not_taken = None;
                match &output {
                    StepOutput::Agent {
                        attempts: made, ..
                    } => {
                        attempts = made.clone();
                        if let StepKind::AgentCall {
                            output_variable: Some(variable),
                            ..
                        } = &spec.kind
                        {
                            self.ctx.variables.insert(variable.clone(), value.clone());
                        }
                    }
                    StepOutput::Branch {
                        selected, skipped, ..
                    } => {
                        self.ctx.activated_steps.insert(selected.clone());
                        not_taken = Some(skipped.clone());
                    }
                    _ => {}
                }
                if matches!(spec.kind, StepKind::End) {
                    self.ctx.output = Some(value);
                }

                self.ctx.mark_completed(step_id);
                self.record(
                    step_id,
                    StepStatus::Completed,
                    Some(output.summary()),
                    attempts,
                    started_at,
                );
                self.commit().await?;

                if let Some(skipped) = not_taken {
                    if !self.ctx.is_settled(&skipped) {
                        self.skip_step(&skipped, format!("branch not taken by '{step_id}'"))
                            .await?;
                    }
                }
                Ok(())
            }
        }
    }

    async fn close_parallel(
        &mut self,
        step_id: &str,
        branches: &[String],
    ) -> Result<(), ExecutorError> {
        let failed: Vec<String> = branches
            .iter()
            .filter(|b| self.ctx.failed_steps.contains(*b))
            .cloned()
            .collect();
        if !failed.is_empty() {
            let err = StepError::BranchesFailed {
                step_id: step_id.to_string(),
                failed,
            };
            return self.fail_step(step_id, err, None).await;
        }

        let results: serde_json::Map<String, Value> = branches
            .iter()
            .map(|b| {
                let result = self.ctx.step_result(b).cloned().unwrap_or(Value::Null);
                (b.clone(), result)
            })
            .collect();
        if let Err(err) = self.ctx.set_step_result(step_id, Value::Object(results)) {
            return self.fail_step(step_id, err.into(), None).await;
        }
        self.ctx.mark_completed(step_id);
        self.record(
            step_id,
            StepStatus::Completed,
            Some(format!("{} branch(es) settled", branches.len())),
            Vec::new(),
            None,
        );
        self.commit().await
    }

    async fn skip_step(&mut self, step_id: &str, reason: String) -> Result<(), ExecutorError> {
        tracing::debug!(run_id = %self.ctx.run_id, step_id, reason = reason.as_str(), "skipping step");
        self.ctx.mark_skipped(step_id);
        self.record(step_id, StepStatus::Skipped, Some(reason), Vec::new(), None);
        self.commit().await
    }

    async fn fail_step(
        &mut self,
        step_id: &str,
        err: StepError,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<(), ExecutorError> {
        let message = err.to_string();
        tracing::warn!(
            run_id = %self.ctx.run_id,
            step_id,
            error = message.as_str(),
            "step failed"
        );

        if let Err(e) = self
            .ctx
            .set_step_result(step_id, json!({ "error": message }))
        {
            tracing::warn!(step_id, error = %e, "could not store step error payload");
        }
        self.ctx.mark_failed(step_id);
        self.record(
            step_id,
            StepStatus::Failed,
            Some(message.clone()),
            err.attempts().to_vec(),
            started_at,
        );
        self.commit().await?;

        if let Some(handler) = self.plan.handler_for(step_id).map(str::to_string) {
            return self.recover(step_id, &handler, &message).await;
        }

        let in_parallel = self
            .plan
            .controller_of(step_id)
            .and_then(|c| self.plan.spec(c))
            .is_some_and(|c| matches!(c.kind, StepKind::Parallel { .. }));
        if in_parallel {
            tracing::debug!(step_id, "branch failure deferred to parallel barrier");
        } else {
            self.halt(format!("step '{step_id}' failed: {message}"));
        }
        Ok(())
    }

    async fn recover(
        &mut self,
        step_id: &str,
        handler: &str,
        message: &str,
    ) -> Result<(), ExecutorError> {
        let Some(StepKind::ErrorHandler {
            action,
            max_attempts,
            ..
        }) = self.plan.spec(handler).map(|s| s.kind.clone())
        else {
            self.halt(format!("step '{step_id}' failed: {message}"));
            return Ok(());
        };

        let used = self.ctx.handler_attempts.get(step_id).copied().unwrap_or(0);
        let decision = decide_recovery(action, max_attempts, used);
        tracing::info!(
            run_id = %self.ctx.run_id,
            step_id,
            handler,
            decision = ?decision,
            "error handler invoked"
        );

        let summary = match decision {
            Recovery::Retry(attempt) => {
                self.ctx
                    .handler_attempts
                    .insert(step_id.to_string(), attempt);
                let subtree = self.plan.subtree(step_id);
                for s in &subtree {
                    self.ctx.activated_steps.remove(s);
                }
                self.ctx.reset_steps(&subtree);
                self.ctx.reset_steps(&[step_id.to_string()]);
                self.ctx.loop_iterations.remove(step_id);
                format!("retrying '{step_id}' ({attempt}/{max_attempts})")
            }
            Recovery::Skip => {
                self.ctx.mark_skipped(step_id);
                self.record(
                    step_id,
                    StepStatus::Skipped,
                    Some(format!("skipped by error handler '{handler}'")),
                    Vec::new(),
                    None,
                );
                format!("skipped '{step_id}'")
            }
            Recovery::Fail => {
                self.halt(format!(
                    "step '{step_id}' failed and error handler '{handler}' failed the workflow: {message}"
                ));
                format!("failed the workflow on '{step_id}'")
            }
            Recovery::Exhausted => {
                self.halt(format!(
                    "step '{step_id}' failed after {used} retr{}: {message}",
                    if used == 1 { "y" } else { "ies" }
                ));
                format!("retry budget for '{step_id}' exhausted")
            }
        };

        self.ctx.mark_completed(handler);
        self.record(handler, StepStatus::Completed, Some(summary), Vec::new(), None);
        self.commit().await
    }

    fn halt(&mut self, error: String) {
        if self.halted.is_none() {
            tracing::error!(
                run_id = %self.ctx.run_id,
                error = error.as_str(),
                in_flight = self.in_flight.len(),
                "run failed, no further steps will be dispatched"
            );
            self.halted = Some(error);
        }
    }

    async fn drain_cancelled(&mut self, tasks: &mut JoinSet<StepTask>) -> Result<(), ExecutorError> {
        while let Some(joined) = tasks.join_next().await {
            let (step_id, result) = joined.map_err(|e| ExecutorError::Join(e.to_string()))?;
            match result {
                Err(err) if err.is_cancelled() => {
                    self.in_flight.remove(&step_id);
                    tracing::debug!(step_id = step_id.as_str(), "in-flight step cancelled");
                }
                result => self.apply(step_id, result).await?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Log an in-flight step that finished after the run failed.
    fn record_discarded(
        &mut self,
        step_id: &str,
        result: &Result<StepOutput, StepError>,
        started_at: Option<DateTime<Utc>>,
    ) {
        let (status, summary, attempts) = match result {
            Ok(output) => (
                StepStatus::Completed,
                format!("{}; result discarded because the run failed", output.summary()),
                Vec::new(),
            ),
            Err(err) => (
                StepStatus::Failed,
                format!("{err}; run already failed"),
                err.attempts().to_vec(),
            ),
        };
        tracing::debug!(step_id, "discarding result of in-flight step");
        self.record(step_id, status, Some(summary), attempts, started_at);
    }

    fn record(
        &mut self,
        step_id: &str,
        status: StepStatus,
        summary: Option<String>,
        attempts: Vec<BackendAttempt>,
        started_at: Option<DateTime<Utc>>,
    ) {
        let kind = match self.plan.spec(step_id) {
            Some(spec) => spec.step_type(),
            None => return,
        };
        let now = Utc::now();
        self.ctx.push_message(StepMessage {
            step_id: step_id.to_string(),
            kind,
            status,
            summary: summary.clone(),
            attempts,
            timestamp: now,
        });

        tracing::info!(
            run_id = %self.ctx.run_id,
            step_id,
            kind = %kind,
            status = %status,
            summary = summary.as_deref().unwrap_or(""),
            "step transition"
        );

        let (result_summary, error_summary) = match status {
            StepStatus::Failed => (None, summary),
            _ => (summary, None),
        };
        self.publish(step_id, status, started_at, result_summary, error_summary);
    }

    fn publish(
        &self,
        step_id: &str,
        status: StepStatus,
        started_at: Option<DateTime<Utc>>,
        result_summary: Option<String>,
        error_summary: Option<String>,
    ) {
        let Some(spec) = self.plan.spec(step_id) else {
            return;
        };
        let ended_at = match status {
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => Some(Utc::now()),
            StepStatus::Pending | StepStatus::Running => None,
        };
        self.services
            .events
            .publish(WorkflowEvent::StepTransition(StepTransition {
                run_id: self.ctx.run_id,
                step_id: step_id.to_string(),
                kind: spec.step_type(),
                status,
                started_at,
                ended_at,
                result_summary,
                error_summary,
            }));
    }

    /// Bump the version, checkpoint and refresh the in-process status table.
    async fn commit(&mut self) -> Result<(), ExecutorError> {
        self.ctx.touch();
        self.services
            .checkpoint
            .checkpoint(&self.definition, &self.ctx)
            .await?;
        self.services.runs.insert(self.ctx.run_id, self.ctx.clone());
        Ok(())
    }

    async fn finish(mut self, status: RunStatus) -> Result<ExecutionContext, ExecutorError> {
        self.ctx.status = status;
        self.commit().await?;
        tracing::info!(
            run_id = %self.ctx.run_id,
            workflow = self.ctx.workflow_name.as_str(),
            status = %status,
            version = self.ctx.version,
            "run finished"
        );
        Ok(self.ctx)
    }
}

/// Roughly thirty years; stands in for "no deadline".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}
