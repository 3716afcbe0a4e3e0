//! Local invoker that answers every call with its input payload.

use serde_json::Value;
use weft_core::agent::invoker::AgentInvoker;
use weft_types::agent::{AgentError, AgentRequest};

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoAgentInvoker;

impl AgentInvoker for EchoAgentInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        tracing::debug!(
            step_id = request.step_id.as_str(),
            agent_ref = request.agent_ref.as_str(),
            backend = %request.backend,
            "echo invocation"
        );
        Ok(request.input.clone())
    }
}
