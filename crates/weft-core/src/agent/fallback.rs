//! Rate-limit-aware backend fallback for agent calls.
//!
//! On a throttling error the backend is put on cooldown and the call is
//! retried on a substitute: first the next model of the same provider from
//! the fallback table, then the alternate providers in priority order. A
//! candidate that was already tried in this call or is still cooling down is
//! never selected. Selection is deterministic: no randomness, no learning.
//! Fatal backend errors and tool failures are returned immediately.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::agent::{
    AgentError, AgentRequest, AttemptOutcome, Backend, BackendAttempt, FatalKind,
};
use weft_types::config::FallbackTable;

use super::cooldown::CooldownCache;
use super::invoker::AgentInvoker;

/// One agent call to be executed through the controller.
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub run_id: Uuid,
    pub step_id: String,
    pub agent_ref: String,
    pub input: Value,
    /// Backend named by the step (or the engine default).
    pub primary: Backend,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Treat a timeout like throttling instead of a fatal error.
    pub retry_on_timeout: bool,
}

/// Successful agent call.
#[derive(Debug, Clone)]
pub struct FallbackResult {
    pub output: Value,
    /// Backend that produced the output.
    pub backend: Backend,
    /// Every attempt made, in order, including the successful one.
    pub attempts: Vec<BackendAttempt>,
}

/// Errors from the fallback controller.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    /// A non-throttling failure, never retried.
    #[error("agent call on {backend} failed: {error}")]
    Agent {
        backend: Backend,
        error: AgentError,
        attempts: Vec<BackendAttempt>,
    },

    /// Every candidate was tried, is cooling down, or the attempt budget ran out.
    #[error("no backend available after {} attempt(s); cooling down: {summary}", .attempts.len())]
    Exhausted {
        summary: String,
        attempts: Vec<BackendAttempt>,
    },

    #[error("agent call cancelled")]
    Cancelled { attempts: Vec<BackendAttempt> },
}

impl FallbackError {
    pub fn attempts(&self) -> &[BackendAttempt] {
        match self {
            FallbackError::Agent { attempts, .. }
            | FallbackError::Exhausted { attempts, .. }
            | FallbackError::Cancelled { attempts } => attempts,
        }
    }
}

/// Retry & fallback controller shared by every agent call of an engine.
pub struct FallbackController {
    table: FallbackTable,
    cooldowns: Arc<CooldownCache>,
}

impl FallbackController {
    pub fn new(table: FallbackTable, cooldowns: Arc<CooldownCache>) -> Self {
        Self { table, cooldowns }
    }

    pub fn cooldowns(&self) -> &Arc<CooldownCache> {
        &self.cooldowns
    }

    /// Next backend to try after `current`, skipping tried and cooling ones.
    ///
    /// Order: the remaining models of `current`'s provider, then the
    /// alternate providers with their default models.
    pub fn next_candidate(&self, current: &Backend, tried: &[Backend]) -> Option<Backend> {
        self.cooldowns.purge();

        let same_provider = self
            .table
            .models
            .get(&current.provider)
            .into_iter()
            .flatten()
            .map(|model| Backend::new(current.provider.clone(), model.clone()));

        same_provider
            .chain(self.table.alternates.iter().cloned())
            .find(|candidate| !tried.contains(candidate) && !self.cooldowns.is_cooling(candidate))
    }

    /// Execute an agent call, substituting backends on throttling.
    pub async fn call<I: AgentInvoker>(
        &self,
        invoker: &I,
        call: AgentCall,
        cancel: &CancellationToken,
    ) -> Result<FallbackResult, FallbackError> {
        let mut tried: Vec<Backend> = Vec::new();
        let mut attempts: Vec<BackendAttempt> = Vec::new();
        let mut current = call.primary.clone();

        if self.cooldowns.is_cooling(&current) {
            tried.push(current.clone());
            match self.next_candidate(&current, &tried) {
                Some(candidate) => {
                    tracing::warn!(
                        step_id = call.step_id.as_str(),
                        primary = %current,
                        candidate = %candidate,
                        "primary backend cooling down, starting on fallback"
                    );
                    current = candidate;
                }
                None => {
                    return Err(FallbackError::Exhausted {
                        summary: self.cooldowns.summary(),
                        attempts,
                    });
                }
            }
        }

        loop {
            if attempts.len() >= self.table.max_attempts as usize {
                tracing::error!(
                    step_id = call.step_id.as_str(),
                    attempts = attempts.len(),
                    "agent call attempt budget exhausted"
                );
                return Err(FallbackError::Exhausted {
                    summary: self.cooldowns.summary(),
                    attempts,
                });
            }

            if !tried.contains(&current) {
                tried.push(current.clone());
            }

            let request = AgentRequest {
                run_id: call.run_id,
                step_id: call.step_id.clone(),
                agent_ref: call.agent_ref.clone(),
                backend: current.clone(),
                input: call.input.clone(),
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(FallbackError::Cancelled { attempts });
                }
                r = tokio::time::timeout(call.timeout, invoker.invoke(&request)) => r,
            };

            match result {
                Ok(Ok(output)) => {
                    attempts.push(BackendAttempt {
                        backend: current.clone(),
                        outcome: AttemptOutcome::Succeeded,
                        error: None,
                    });
                    if current != call.primary {
                        tracing::info!(
                            step_id = call.step_id.as_str(),
                            primary = %call.primary,
                            backend = %current,
                            "agent call served by fallback backend"
                        );
                    }
                    return Ok(FallbackResult {
                        output,
                        backend: current,
                        attempts,
                    });
                }
                Ok(Err(err)) if err.is_throttled() => {
                    let retry_after = err.retry_after_ms().map(Duration::from_millis);
                    let until = self.cooldowns.put(&current, retry_after);
                    tracing::warn!(
                        step_id = call.step_id.as_str(),
                        backend = %current,
                        until = %until,
                        error = %err,
                        "backend throttled, trying next candidate"
                    );
                    attempts.push(BackendAttempt {
                        backend: current.clone(),
                        outcome: AttemptOutcome::Throttled,
                        error: Some(err.to_string()),
                    });
                }
                Ok(Err(err)) => {
                    tracing::error!(
                        step_id = call.step_id.as_str(),
                        backend = %current,
                        error = %err,
                        "agent call failed, not retrying"
                    );
                    attempts.push(BackendAttempt {
                        backend: current.clone(),
                        outcome: AttemptOutcome::Failed,
                        error: Some(err.to_string()),
                    });
                    return Err(FallbackError::Agent {
                        backend: current,
                        error: err,
                        attempts,
                    });
                }
                Err(_elapsed) => {
                    let message = format!("no response within {}ms", call.timeout.as_millis());
                    if call.retry_on_timeout {
                        self.cooldowns.put(&current, None);
                        tracing::warn!(
                            step_id = call.step_id.as_str(),
                            backend = %current,
                            "agent call timed out, treating as throttled"
                        );
                        attempts.push(BackendAttempt {
                            backend: current.clone(),
                            outcome: AttemptOutcome::Throttled,
                            error: Some(message),
                        });
                    } else {
                        attempts.push(BackendAttempt {
                            backend: current.clone(),
                            outcome: AttemptOutcome::Failed,
                            error: Some(message.clone()),
                        });
                        return Err(FallbackError::Agent {
                            backend: current,
                            error: AgentError::FatalBackend {
                                kind: FatalKind::Timeout,
                                message,
                            },
                            attempts,
                        });
                    }
                }
            }

            current = match self.next_candidate(&current, &tried) {
                Some(candidate) => candidate,
                None => {
                    return Err(FallbackError::Exhausted {
                        summary: self.cooldowns.summary(),
                        attempts,
                    });
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::future::Future;
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;

    use crate::agent::cooldown::{Clock, ManualClock};

    // --- Mock invoker ---

    /// Scripted per-backend behaviour; unknown backends succeed.
    #[derive(Default)]
    struct ScriptedInvoker {
        script: HashMap<Backend, AgentError>,
        slow: Vec<Backend>,
        calls: Mutex<Vec<Backend>>,
    }

    impl ScriptedInvoker {
        fn throttle(mut self, backend: Backend, retry_after_ms: Option<u64>) -> Self {
            self.script.insert(
                backend,
                AgentError::Throttled {
                    retry_after_ms,
                    message: "rate limit exceeded".to_string(),
                },
            );
            self
        }

        fn fail(mut self, backend: Backend, error: AgentError) -> Self {
            self.script.insert(backend, error);
            self
        }

        fn calls(&self) -> Vec<Backend> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AgentInvoker for ScriptedInvoker {
        fn invoke(
            &self,
            request: &AgentRequest,
        ) -> impl Future<Output = Result<Value, AgentError>> + Send {
            self.calls.lock().unwrap().push(request.backend.clone());
            let scripted = self.script.get(&request.backend).cloned();
            let slow = self.slow.contains(&request.backend);
            let backend = request.backend.to_string();
            async move {
                if slow {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                match scripted {
                    Some(err) => Err(err),
                    None => Ok(json!({ "served_by": backend })),
                }
            }
        }
    }

    fn table() -> FallbackTable {
        FallbackTable {
            models: BTreeMap::from([(
                "groq".to_string(),
                vec!["m1".to_string(), "m2".to_string()],
            )]),
            alternates: vec![Backend::new("openai", "gpt-4o-mini")],
            ..FallbackTable::default()
        }
    }

    fn controller(clock: Arc<ManualClock>) -> FallbackController {
        let table = table();
        let cache = CooldownCache::with_clock(&table, clock);
        FallbackController::new(table, Arc::new(cache))
    }

    fn call(primary: Backend) -> AgentCall {
        AgentCall {
            run_id: Uuid::now_v7(),
            step_id: "a1".to_string(),
            agent_ref: "solver".to_string(),
            input: json!({ "query": "2+2" }),
            primary,
            timeout: Duration::from_secs(5),
            retry_on_timeout: false,
        }
    }

    fn m1() -> Backend {
        Backend::new("groq", "m1")
    }

    fn m2() -> Backend {
        Backend::new("groq", "m2")
    }

    #[tokio::test]
    async fn primary_succeeds_without_fallback() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);
        let invoker = ScriptedInvoker::default();

        let result = controller
            .call(&invoker, call(m1()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.backend, m1());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(invoker.calls(), vec![m1()]);
    }

    #[tokio::test]
    async fn throttled_primary_falls_back_and_cooldown_is_honored() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock.clone());
        let invoker = ScriptedInvoker::default().throttle(m1(), Some(60_000));
        let token = CancellationToken::new();

        let result = controller.call(&invoker, call(m1()), &token).await.unwrap();
        assert_eq!(result.backend, m2());
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Throttled);
        assert_eq!(
            controller.cooldowns().get(&m1()),
            Some(clock.now() + chrono::Duration::seconds(60))
        );

        // A later call naming m1 goes straight to m2 while m1 cools down.
        clock.advance(Duration::from_secs(30));
        let result = controller.call(&invoker, call(m1()), &token).await.unwrap();
        assert_eq!(result.backend, m2());
        assert_eq!(invoker.calls(), vec![m1(), m2(), m2()]);

        // Once the cooldown has elapsed, m1 is eligible again.
        clock.advance(Duration::from_secs(30));
        let _ = controller.call(&invoker, call(m1()), &token).await;
        assert_eq!(invoker.calls()[3], m1());
    }

    #[tokio::test]
    async fn same_provider_exhausted_moves_to_alternate_provider() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);
        let invoker = ScriptedInvoker::default()
            .throttle(m1(), None)
            .throttle(m2(), Some(1_000));

        let result = controller
            .call(&invoker, call(m1()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.backend, Backend::new("openai", "gpt-4o-mini"));
        assert_eq!(result.attempts.len(), 3);
    }

    #[tokio::test]
    async fn all_candidates_throttled_reports_cooldown_summary() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);
        let invoker = ScriptedInvoker::default()
            .throttle(m1(), Some(60_000))
            .throttle(m2(), Some(30_000))
            .throttle(Backend::new("openai", "gpt-4o-mini"), Some(10_000));

        let err = controller
            .call(&invoker, call(m1()), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            FallbackError::Exhausted { summary, attempts } => {
                assert_eq!(attempts.len(), 3);
                assert!(summary.contains("groq/m1 (60s)"));
                assert!(summary.contains("openai/gpt-4o-mini (10s)"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);
        let invoker = ScriptedInvoker::default().fail(
            m1(),
            AgentError::FatalBackend {
                kind: FatalKind::Authentication,
                message: "invalid api key".to_string(),
            },
        );

        let err = controller
            .call(&invoker, call(m1()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FallbackError::Agent { .. }));
        assert_eq!(invoker.calls(), vec![m1()]);
        assert!(controller.cooldowns().is_empty());
    }

    #[tokio::test]
    async fn attempt_budget_bounds_the_call() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut table = table();
        table.max_attempts = 1;
        let cache = Arc::new(CooldownCache::with_clock(&table, clock));
        let controller = FallbackController::new(table, cache);
        let invoker = ScriptedInvoker::default().throttle(m1(), None);

        let err = controller
            .call(&invoker, call(m1()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FallbackError::Exhausted { .. }));
        assert_eq!(invoker.calls(), vec![m1()]);
    }

    #[tokio::test]
    async fn timeout_is_fatal_unless_retry_on_timeout() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);
        let invoker = ScriptedInvoker {
            slow: vec![m1()],
            ..ScriptedInvoker::default()
        };
        let mut quick = call(m1());
        quick.timeout = Duration::from_millis(50);

        let err = controller
            .call(&invoker, quick.clone(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            FallbackError::Agent { error, .. } => assert_eq!(
                error,
                AgentError::FatalBackend {
                    kind: FatalKind::Timeout,
                    message: "no response within 50ms".to_string(),
                }
            ),
            other => panic!("expected timeout, got {other:?}"),
        }

        let mut retrying = quick;
        retrying.retry_on_timeout = true;
        let result = controller
            .call(&invoker, retrying, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.backend, m2());
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);
        let invoker = ScriptedInvoker {
            slow: vec![m1()],
            ..ScriptedInvoker::default()
        };
        let token = CancellationToken::new();
        token.cancel();

        let err = controller.call(&invoker, call(m1()), &token).await.unwrap_err();
        assert!(matches!(err, FallbackError::Cancelled { .. }));
    }

    #[test]
    fn next_candidate_order() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let controller = controller(clock);

        assert_eq!(controller.next_candidate(&m1(), &[m1()]), Some(m2()));
        assert_eq!(
            controller.next_candidate(&m1(), &[m1(), m2()]),
            Some(Backend::new("openai", "gpt-4o-mini"))
        );
        assert_eq!(
            controller.next_candidate(
                &m1(),
                &[m1(), m2(), Backend::new("openai", "gpt-4o-mini")]
            ),
            None
        );
    }
}
