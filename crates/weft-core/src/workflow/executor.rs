//! Workflow engine: run submission, resumption, cancellation and status.
//!
//! `WorkflowEngine` owns the shared collaborators (step runner, fallback
//! controller, checkpoint manager, event bus) and spawns one
//! `RunCoordinator` per run. Run state lives in an in-process table while
//! the run is active and in the checkpoint store afterwards.
//!
//! # Execution flow
//!
//! 1. Validate the definition and create the execution context.
//! 2. Hand both to a coordinator, which checkpoints after every transition.
//! 3. On completion, drop the checkpoint when `cleanup_completed` is set;
//!    failed and cancelled runs keep theirs for diagnosis and resume.
//! 4. Retire the run: its final state stays in the status table until
//!    `retained_runs` newer runs have finished.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::config::{EngineConfig, WeftConfig};
use weft_types::event::WorkflowEvent;
use weft_types::workflow::{RunStatus, WorkflowDefinition};

use super::checkpoint::{CheckpointError, CheckpointManager, CheckpointRecord, CheckpointStore};
use super::context::{ContextError, ExecutionContext};
use super::definition::{ValidationError, validate_definition};
use super::scheduler::{RunCoordinator, RunServices};
use super::step_runner::StepRunner;
use crate::agent::cooldown::CooldownCache;
use crate::agent::fallback::FallbackController;
use crate::agent::invoker::AgentInvoker;
use crate::event::bus::EventBus;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkflowExecutor: Send + Sync {
    /// Run a definition to a terminal state.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Resume a crashed or cancelled run from its last checkpoint.
    fn resume(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Cancel an active run.
    fn cancel(&self, run_id: Uuid) -> impl Future<Output = Result<(), ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// ExecutionResult / ExecutorError
// ---------------------------------------------------------------------------

/// Outcome of a run that reached a terminal state.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Final context, including the full message log.
    pub context: ExecutionContext,
    pub error: Option<String>,
}

impl From<ExecutionContext> for ExecutionResult {
    fn from(context: ExecutionContext) -> Self {
        Self {
            run_id: context.run_id,
            status: context.status,
            error: context.error.clone(),
            context,
        }
    }
}

/// Errors that prevent a run from being executed or tracked.
///
/// A run that fails is not an error: it is returned as an
/// [`ExecutionResult`] with status `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Checkpoint(CheckpointError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: Uuid, status: RunStatus },

    #[error("run {0} is already active")]
    AlreadyRunning(Uuid),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("run task failed: {0}")]
    Join(String),
}

impl From<CheckpointError> for ExecutorError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::RunNotFound(run_id) => ExecutorError::RunNotFound(run_id),
            other => ExecutorError::Checkpoint(other),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs workflows against an agent invoker and a checkpoint store.
pub struct WorkflowEngine<A: AgentInvoker, S: CheckpointStore> {
    services: RunServices<A, S>,
    config: EngineConfig,
    /// Cancellation tokens of active runs.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    /// Join handles of runs started with [`WorkflowEngine::start`].
    handles: DashMap<Uuid, JoinHandle<Result<ExecutionContext, ExecutorError>>>,
    /// Finished runs still held in the status table, oldest first.
    retired: Mutex<VecDeque<Uuid>>,
}

impl<A, S> WorkflowEngine<A, S>
where
    A: AgentInvoker + 'static,
    S: CheckpointStore + 'static,
{
    pub fn new(invoker: Arc<A>, store: S, config: &WeftConfig, cooldowns: Arc<CooldownCache>) -> Self {
        let fallback = Arc::new(FallbackController::new(config.fallback.clone(), cooldowns));
        let runner = StepRunner::new(
            invoker,
            fallback,
            config.engine.default_backend.clone(),
            Duration::from_secs(config.engine.step_timeout_secs),
        );
        Self {
            services: RunServices {
                runner: Arc::new(runner),
                checkpoint: Arc::new(CheckpointManager::new(store)),
                events: EventBus::new(config.engine.event_capacity),
                runs: Arc::new(DashMap::new()),
            },
            config: config.engine.clone(),
            cancellation_tokens: DashMap::new(),
            handles: DashMap::new(),
            retired: Mutex::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    pub fn checkpoints(&self) -> &CheckpointManager<S> {
        &self.services.checkpoint
    }

    pub fn cooldowns(&self) -> &Arc<CooldownCache> {
        self.services.runner.fallback().cooldowns()
    }

    /// Validate a definition and spawn a run for it.
    pub fn start(
        self: &Arc<Self>,
        definition: WorkflowDefinition,
        input: Value,
    ) -> Result<Uuid, ExecutorError> {
        validate_definition(&definition)?;
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            definition.name.clone(),
            input,
            definition.variables.clone(),
        );
        let run_id = ctx.run_id;
        self.services.runs.insert(run_id, ctx.clone());
        let token = self.register(run_id)?;

        // The run may only retire once its handle is registered.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            engine.drive(Arc::new(definition), ctx, token, false).await
        });
        self.handles.insert(run_id, handle);
        let _ = registered_tx.send(());
        Ok(run_id)
    }

    /// Wait for a run started with [`WorkflowEngine::start`] to finish.
    ///
    /// Once the handle has been retired, the final state comes from
    /// [`WorkflowEngine::get_status`].
    pub async fn wait(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let Some((_, handle)) = self.handles.remove(&run_id) else {
            let ctx = self.get_status(run_id).await?;
            if ctx.status == RunStatus::Running {
                return Err(ExecutorError::RunNotFound(run_id));
            }
            return Ok(ctx.into());
        };
        let ctx = handle
            .await
            .map_err(|e| ExecutorError::Join(e.to_string()))??;
        Ok(ctx.into())
    }

    /// Current state of a run: the in-process table first, then the
    /// checkpoint store.
    pub async fn get_status(&self, run_id: Uuid) -> Result<ExecutionContext, ExecutorError> {
        if let Some(ctx) = self.services.runs.get(&run_id) {
            return Ok(ctx.clone());
        }
        let record = self.services.checkpoint.restore(run_id).await?;
        Ok(record.context)
    }

    /// Checkpoints of runs that can be resumed.
    pub async fn unfinished(&self) -> Result<Vec<CheckpointRecord>, ExecutorError> {
        Ok(self.services.checkpoint.unfinished().await?)
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.cancellation_tokens.contains_key(&run_id)
    }

    fn register(&self, run_id: Uuid) -> Result<CancellationToken, ExecutorError> {
        match self.cancellation_tokens.entry(run_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ExecutorError::AlreadyRunning(run_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    async fn drive(
        &self,
        definition: Arc<WorkflowDefinition>,
        ctx: ExecutionContext,
        token: CancellationToken,
        resumed: bool,
    ) -> Result<ExecutionContext, ExecutorError> {
        let run_id = ctx.run_id;
        let timeout = Duration::from_secs(
            definition
                .timeout_secs
                .unwrap_or(self.config.workflow_timeout_secs),
        );

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            resumed,
            completed = ctx.completed_steps.len(),
            "starting workflow run"
        );
        self.services.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: definition.name.clone(),
            resumed,
        });

        let started = Instant::now();
        let initial = ctx.clone();
        let coordinator = RunCoordinator::new(
            Arc::clone(&definition),
            self.services.clone(),
            ctx,
            token,
            timeout,
        );
        let outcome = coordinator.run().await;
        self.cancellation_tokens.remove(&run_id);

        let ctx = match outcome {
            Ok(ctx) => {
                if ctx.status == RunStatus::Completed && self.config.cleanup_completed {
                    if let Err(e) = self.services.checkpoint.discard(run_id).await {
                        tracing::warn!(run_id = %run_id, error = %e, "failed to discard checkpoint of completed run");
                    }
                }
                ctx
            }
            Err(err) => {
                // Last committed state, marked failed.
                let mut ctx = self
                    .services
                    .runs
                    .get(&run_id)
                    .map(|c| c.clone())
                    .unwrap_or(initial);
                ctx.status = RunStatus::Failed;
                ctx.error = Some(err.to_string());
                ctx.touch();
                tracing::error!(run_id = %run_id, error = %err, "workflow run aborted");
                self.services.runs.insert(run_id, ctx.clone());
                self.publish_finished(&definition, &ctx, started);
                self.retire(run_id);
                return Err(err);
            }
        };

        self.publish_finished(&definition, &ctx, started);
        self.retire(run_id);
        Ok(ctx)
    }

    fn publish_finished(&self, definition: &WorkflowDefinition, ctx: &ExecutionContext, started: Instant) {
        self.services.events.publish(WorkflowEvent::RunFinished {
            run_id: ctx.run_id,
            workflow_name: definition.name.clone(),
            status: ctx.status,
            duration_ms: started.elapsed().as_millis() as u64,
            error: ctx.error.clone(),
        });
    }

    /// Record a finished run and evict the oldest ones beyond
    /// `retained_runs` from the status table and the handle map.
    fn retire(&self, run_id: Uuid) {
        let mut retired = self.retired.lock().unwrap_or_else(|p| p.into_inner());
        retired.retain(|id| *id != run_id);
        retired.push_back(run_id);
        while retired.len() > self.config.retained_runs {
            let Some(old) = retired.pop_front() else {
                break;
            };
            // A resumed run is active again and keeps its entry.
            if self.is_active(old) {
                continue;
            }
            self.services.runs.remove(&old);
            self.handles.remove(&old);
            tracing::debug!(run_id = %old, "evicted finished run from status table");
        }
    }
}

impl<A, S> WorkflowExecutor for WorkflowEngine<A, S>
where
    A: AgentInvoker + 'static,
    S: CheckpointStore + 'static,
{
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        validate_definition(definition)?;
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            definition.name.clone(),
            input,
            definition.variables.clone(),
        );
        let token = self.register(ctx.run_id)?;
        let ctx = self
            .drive(Arc::new(definition.clone()), ctx, token, false)
            .await?;
        Ok(ctx.into())
    }

    async fn resume(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        if self.is_active(run_id) {
            return Err(ExecutorError::AlreadyRunning(run_id));
        }
        let record = self.services.checkpoint.restore(run_id).await?;
        if record.context.status.is_final() {
            return Err(ExecutorError::NotResumable {
                run_id,
                status: record.context.status,
            });
        }
        validate_definition(&record.definition)?;

        let mut ctx = record.context;
        tracing::info!(
            run_id = %run_id,
            previous_status = %ctx.status,
            version = ctx.version,
            "resuming workflow run from checkpoint"
        );
        ctx.status = RunStatus::Running;
        ctx.error = None;

        let token = self.register(run_id)?;
        let ctx = self
            .drive(Arc::new(record.definition), ctx, token, true)
            .await?;
        Ok(ctx.into())
    }

    async fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(&run_id)
            .map(|t| t.clone())
            .ok_or(ExecutorError::RunNotFound(run_id))?;
        token.cancel();
        tracing::info!(run_id = %run_id, "workflow run cancellation requested");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;
    use weft_types::agent::{AgentError, AgentRequest, Backend};
    use weft_types::config::FallbackTable;
    use weft_types::error::RepositoryError;
    use weft_types::workflow::StepStatus;

    use super::*;
    use crate::agent::cooldown::{Clock, ManualClock};
    use crate::workflow::checkpoint::{CheckpointRecord, InMemoryCheckpointStore};
    use crate::workflow::definition::parse_workflow_yaml;

    /// Echo-style invoker with scripted throttling and first-call stalls.
    #[derive(Default)]
    struct TestInvoker {
        throttled: HashMap<Backend, u64>,
        stall_first: Vec<String>,
        log: Mutex<Vec<(String, Backend)>>,
    }

    impl TestInvoker {
        fn steps(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }

        fn backends(&self) -> Vec<Backend> {
            self.log.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
        }
    }

    impl AgentInvoker for TestInvoker {
        fn invoke(
            &self,
            request: &AgentRequest,
        ) -> impl Future<Output = Result<Value, AgentError>> + Send {
            let first_call = {
                let mut log = self.log.lock().unwrap();
                let first = !log.iter().any(|(s, _)| *s == request.step_id);
                log.push((request.step_id.clone(), request.backend.clone()));
                first
            };
            let stall = first_call && self.stall_first.contains(&request.agent_ref);
            let throttled = self.throttled.get(&request.backend).copied();
            let output = json!({
                "answer": format!("{} via {}", request.agent_ref, request.backend),
                "input": request.input,
            });
            async move {
                if stall {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                match throttled {
                    Some(ms) => Err(AgentError::Throttled {
                        retry_after_ms: Some(ms),
                        message: "rate limit exceeded".to_string(),
                    }),
                    None => Ok(output),
                }
            }
        }
    }

    type Engine = WorkflowEngine<TestInvoker, Arc<InMemoryCheckpointStore>>;

    fn engine_with(
        invoker: Arc<TestInvoker>,
        config: WeftConfig,
        cooldowns: Arc<CooldownCache>,
    ) -> (Arc<Engine>, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = WorkflowEngine::new(invoker, Arc::clone(&store), &config, cooldowns);
        (Arc::new(engine), store)
    }

    fn engine(invoker: Arc<TestInvoker>) -> (Arc<Engine>, Arc<InMemoryCheckpointStore>) {
        let config = WeftConfig::default();
        let cooldowns = Arc::new(CooldownCache::from_table(&config.fallback));
        engine_with(invoker, config, cooldowns)
    }

    const LINEAR: &str = r#"
name: linear
steps:
  - id: start
    kind: start
  - id: a1
    kind: agent_call
    agent_ref: solver
    input_mapping:
      query: "{{ input.query }}"
    output_variable: answer
  - id: end
    kind: end
dependencies:
  a1: [start]
  end: [a1]
"#;

    const TWO_CALLS: &str = r#"
name: two-calls
steps:
  - id: start
    kind: start
  - id: a1
    kind: agent_call
    agent_ref: first
  - id: a2
    kind: agent_call
    agent_ref: second
  - id: end
    kind: end
dependencies:
  a2: [a1]
  end: [a2]
"#;

    #[tokio::test]
    async fn linear_run_completes_with_ordered_messages() {
        let invoker = Arc::new(TestInvoker::default());
        let (engine, store) = engine(Arc::clone(&invoker));
        let def = parse_workflow_yaml(LINEAR).unwrap();

        let result = engine.execute(&def, json!({ "query": "2+2" })).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let ctx = &result.context;
        assert_eq!(ctx.step_results["a1"]["input"], json!({ "query": "2+2" }));
        assert_eq!(ctx.variables["answer"], ctx.step_results["a1"]);
        let order: Vec<&str> = ctx.messages.iter().map(|m| m.step_id.as_str()).collect();
        assert_eq!(order, vec!["start", "a1", "end"]);
        assert!(ctx.messages.iter().all(|m| m.status == StepStatus::Completed));
        assert_eq!(
            ctx.output.as_ref().unwrap()["step_results"]["a1"],
            ctx.step_results["a1"]
        );
        // Completed runs drop their checkpoint by default.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn condition_runs_selected_branch_and_skips_other() {
        let def = parse_workflow_yaml(
            r#"
name: branching
variables:
  flag: true
steps:
  - id: start
    kind: start
  - id: c1
    kind: condition
    expression: "variables.flag"
    true_branch: A
    false_branch: B
  - id: A
    kind: agent_call
    agent_ref: yes
  - id: B
    kind: agent_call
    agent_ref: no
  - id: end
    kind: end
dependencies:
  end: [c1]
"#,
        )
        .unwrap();
        let invoker = Arc::new(TestInvoker::default());
        let (engine, _) = engine(Arc::clone(&invoker));

        let result = engine.execute(&def, json!({})).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.context.step_status("A"), StepStatus::Completed);
        assert_eq!(result.context.step_status("B"), StepStatus::Skipped);
        assert_eq!(invoker.steps(), vec!["A"]);
        let last = result.context.messages.last().unwrap();
        assert_eq!(last.step_id, "end");
    }

    #[tokio::test]
    async fn throttled_backend_falls_back_and_stays_cooling_for_later_steps() {
        let m1 = Backend::new("groq", "m1");
        let m2 = Backend::new("groq", "m2");
        let mut config = WeftConfig::default();
        config.engine.default_backend = m1.clone();
        config.fallback = FallbackTable {
            models: BTreeMap::from([(
                "groq".to_string(),
                vec!["m1".to_string(), "m2".to_string()],
            )]),
            ..FallbackTable::default()
        };
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cooldowns = Arc::new(CooldownCache::with_clock(&config.fallback, clock.clone()));
        let invoker = Arc::new(TestInvoker {
            throttled: HashMap::from([(m1.clone(), 60_000)]),
            ..TestInvoker::default()
        });
        let (engine, _) = engine_with(Arc::clone(&invoker), config, cooldowns);
        let def = parse_workflow_yaml(TWO_CALLS).unwrap();

        let result = engine.execute(&def, json!({})).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(
            engine.cooldowns().get(&m1),
            Some(clock.now() + chrono::Duration::seconds(60))
        );
        // a1: m1 throttled then m2; a2 goes straight to m2.
        assert_eq!(invoker.backends(), vec![m1.clone(), m2.clone(), m2.clone()]);
        assert!(
            result.context.step_results["a2"]["answer"]
                .as_str()
                .unwrap()
                .ends_with("groq/m2")
        );
        let a1 = result
            .context
            .messages
            .iter()
            .find(|m| m.step_id == "a1")
            .unwrap();
        assert_eq!(a1.attempts.len(), 2);
    }

    #[tokio::test]
    async fn loop_without_exit_fails_after_bound() {
        let def = parse_workflow_yaml(
            r#"
name: endless
steps:
  - id: start
    kind: start
  - id: l1
    kind: loop
    body: [b1]
    max_iterations: 3
    exit_condition: "false"
  - id: b1
    kind: agent_call
    agent_ref: worker
    input_mapping:
      iteration: "{{ loops.l1.iteration }}"
  - id: end
    kind: end
dependencies:
  end: [l1]
"#,
        )
        .unwrap();
        let invoker = Arc::new(TestInvoker::default());
        let (engine, _) = engine(Arc::clone(&invoker));

        let result = engine.execute(&def, json!({})).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(invoker.steps(), vec!["b1", "b1", "b1"]);
        assert_eq!(result.context.loop_iterations["l1"], 3);
        assert_eq!(result.context.step_status("l1"), StepStatus::Failed);
        assert!(result.error.unwrap().contains("bound of 3"));
    }

    #[tokio::test]
    async fn loop_exits_when_condition_holds() {
        let def = parse_workflow_yaml(
            r#"
name: counted
steps:
  - id: start
    kind: start
  - id: l1
    kind: loop
    body: [b1]
    max_iterations: 5
    exit_condition: "loops.l1.iteration >= 2"
  - id: b1
    kind: agent_call
    agent_ref: worker
  - id: end
    kind: end
dependencies:
  end: [l1]
"#,
        )
        .unwrap();
        let invoker = Arc::new(TestInvoker::default());
        let (engine, _) = engine(Arc::clone(&invoker));

        let result = engine.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(invoker.steps().len(), 2);
        assert_eq!(result.context.step_results["l1"], json!({ "iterations": 2 }));
    }

    #[tokio::test]
    async fn resume_after_crash_does_not_reinvoke_completed_steps() {
        let def = parse_workflow_yaml(TWO_CALLS).unwrap();
        let invoker = Arc::new(TestInvoker::default());
        let (engine, store) = engine(Arc::clone(&invoker));

        // State persisted right after a1 completed; the process then died.
        let mut ctx = ExecutionContext::new(Uuid::now_v7(), "two-calls", json!({}), BTreeMap::new());
        for (id, result) in [("start", json!({ "status": "started" })), ("a1", json!("done"))] {
            ctx.set_step_result(id, result).unwrap();
            ctx.mark_completed(id);
        }
        ctx.touch();
        CheckpointManager::new(Arc::clone(&store))
            .checkpoint(&def, &ctx)
            .await
            .unwrap();

        let result = engine.resume(ctx.run_id).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(invoker.steps(), vec!["a2"]);
        assert_eq!(result.context.step_results["a1"], json!("done"));
        assert!(result.context.version > ctx.version);
    }

    #[tokio::test]
    async fn cancel_then_resume_finishes_the_run() {
        let def = parse_workflow_yaml(TWO_CALLS).unwrap();
        let invoker = Arc::new(TestInvoker {
            stall_first: vec!["second".to_string()],
            ..TestInvoker::default()
        });
        let (engine, _) = engine(Arc::clone(&invoker));

        let run_id = engine.start(def, json!({})).unwrap();
        let mut waited = 0;
        while invoker.steps().len() < 2 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(invoker.steps(), vec!["a1", "a2"]);

        engine.cancel(run_id).await.unwrap();
        let cancelled = engine.wait(run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.context.step_status("a2"), StepStatus::Pending);
        assert_eq!(
            engine.get_status(run_id).await.unwrap().status,
            RunStatus::Cancelled
        );

        let resumed = engine.resume(run_id).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(invoker.steps(), vec!["a1", "a2", "a2"]);
    }

    #[tokio::test]
    async fn final_runs_cannot_be_resumed() {
        let invoker = Arc::new(TestInvoker::default());
        let config = WeftConfig {
            engine: EngineConfig {
                cleanup_completed: false,
                ..EngineConfig::default()
            },
            ..WeftConfig::default()
        };
        let cooldowns = Arc::new(CooldownCache::from_table(&config.fallback));
        let (engine, store) = engine_with(invoker, config, cooldowns);
        let def = parse_workflow_yaml(LINEAR).unwrap();

        let result = engine.execute(&def, json!({ "query": "q" })).await.unwrap();
        assert_eq!(store.len(), 1);

        let err = engine.resume(result.run_id).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutorError::NotResumable {
                status: RunStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            engine.resume(Uuid::nil()).await.unwrap_err(),
            ExecutorError::RunNotFound(_)
        ));
    }

    #[tokio::test]
    async fn events_are_published_for_run_and_steps() {
        let invoker = Arc::new(TestInvoker::default());
        let (engine, _) = engine(invoker);
        let mut events = engine.events().subscribe();
        let def = parse_workflow_yaml(LINEAR).unwrap();

        let result = engine.execute(&def, json!({ "query": "q" })).await.unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(matches!(
            received.first(),
            Some(WorkflowEvent::RunStarted { resumed: false, .. })
        ));
        assert!(matches!(
            received.last(),
            Some(WorkflowEvent::RunFinished {
                status: RunStatus::Completed,
                ..
            })
        ));
        let completed_steps = received
            .iter()
            .filter(|e| {
                matches!(e, WorkflowEvent::StepTransition(t)
                    if t.status == StepStatus::Completed && t.ended_at.is_some())
            })
            .count();
        assert_eq!(completed_steps, 3);
        assert!(received.iter().all(|e| e.run_id() == result.run_id));
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_before_running() {
        let mut def = parse_workflow_yaml(LINEAR).unwrap();
        def.dependencies
            .insert("start".to_string(), vec!["end".to_string()]);
        let invoker = Arc::new(TestInvoker::default());
        let (engine, _) = engine(Arc::clone(&invoker));

        let err = engine.execute(&def, json!({})).await.unwrap_err();
        match err {
            ExecutorError::Validation(v) => assert!(v.has_cycle()),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(invoker.steps().is_empty());
    }

    #[tokio::test]
    async fn workflow_timeout_fails_run() {
        let def = parse_workflow_yaml(
            r#"
name: slow
timeout_secs: 0
steps:
  - id: start
    kind: start
  - id: a1
    kind: agent_call
    agent_ref: second
"#,
        )
        .unwrap();
        let invoker = Arc::new(TestInvoker {
            stall_first: vec!["second".to_string()],
            ..TestInvoker::default()
        });
        let (engine, _) = engine(invoker);

        let result = engine.execute(&def, json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn huge_workflow_timeout_behaves_as_unbounded() {
        let def = parse_workflow_yaml(
            r#"
name: patient
timeout_secs: 18446744073709551615
steps:
  - id: start
    kind: start
  - id: end
    kind: end
"#,
        )
        .unwrap();
        let (engine, _) = engine(Arc::new(TestInvoker::default()));

        let result = tokio::spawn(async move { engine.execute(&def, json!({})).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
    }

    /// In-memory store whose saves fail once `healthy_saves` have succeeded.
    #[derive(Default)]
    struct FailingStore {
        inner: InMemoryCheckpointStore,
        healthy_saves: usize,
        saves: AtomicUsize,
    }

    impl CheckpointStore for FailingStore {
        async fn save(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
            if self.saves.fetch_add(1, Ordering::SeqCst) >= self.healthy_saves {
                return Err(RepositoryError::Connection("disk gone".to_string()));
            }
            self.inner.save(record).await
        }

        async fn load(&self, run_id: &Uuid) -> Result<Option<CheckpointRecord>, RepositoryError> {
            self.inner.load(run_id).await
        }

        async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
            self.inner.delete(run_id).await
        }

        async fn list_unfinished(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
            self.inner.list_unfinished().await
        }

        async fn list(&self) -> Result<Vec<CheckpointRecord>, RepositoryError> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn checkpoint_failure_marks_run_failed() {
        let config = WeftConfig::default();
        let cooldowns = Arc::new(CooldownCache::from_table(&config.fallback));
        let store = FailingStore {
            healthy_saves: 2,
            ..FailingStore::default()
        };
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(TestInvoker::default()),
            store,
            &config,
            cooldowns,
        ));
        let mut events = engine.events().subscribe();
        let def = parse_workflow_yaml(TWO_CALLS).unwrap();

        let run_id = engine.start(def, json!({})).unwrap();
        let err = engine.wait(run_id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Checkpoint(_)));
        assert!(err.to_string().contains("disk gone"));

        assert!(!engine.is_active(run_id));
        let status = engine.get_status(run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.error.unwrap().contains("disk gone"));

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(WorkflowEvent::RunFinished {
                status: RunStatus::Failed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn finished_runs_beyond_retention_are_evicted() {
        let config = WeftConfig {
            engine: EngineConfig {
                cleanup_completed: false,
                retained_runs: 1,
                ..EngineConfig::default()
            },
            ..WeftConfig::default()
        };
        let cooldowns = Arc::new(CooldownCache::from_table(&config.fallback));
        let (engine, store) = engine_with(Arc::new(TestInvoker::default()), config, cooldowns);
        let def = parse_workflow_yaml(LINEAR).unwrap();

        let first = engine.start(def.clone(), json!({ "query": "a" })).unwrap();
        let second = engine.start(def, json!({ "query": "b" })).unwrap();
        let mut waited = 0;
        while engine.services.runs.len() > 1 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }

        assert_eq!(engine.services.runs.len(), 1);
        assert_eq!(engine.handles.len(), 1);
        assert_eq!(store.len(), 2);
        // The evicted run answers from its checkpoint.
        for run_id in [first, second] {
            let result = engine.wait(run_id).await.unwrap();
            assert_eq!(result.status, RunStatus::Completed);
            assert_eq!(
                engine.get_status(run_id).await.unwrap().status,
                RunStatus::Completed
            );
        }
        assert!(engine.handles.is_empty());
    }
}
