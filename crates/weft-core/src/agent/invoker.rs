//! The agent invocation port.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use weft_types::agent::{AgentError, AgentRequest};

/// Executes one agent call against one backend.
///
/// Implementations classify every failure into [`AgentError`] before
/// returning; the engine never inspects raw transport errors.
///
/// Uses RPITIT for the async method, so it cannot be used as a trait object
/// directly. See [`super::box_invoker::BoxAgentInvoker`] for dynamic dispatch.
pub trait AgentInvoker: Send + Sync {
    fn invoke(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<Value, AgentError>> + Send;
}

impl<T: AgentInvoker> AgentInvoker for Arc<T> {
    fn invoke(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<Value, AgentError>> + Send {
        (**self).invoke(request)
    }
}
