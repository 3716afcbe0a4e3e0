//! BoxAgentInvoker -- object-safe dynamic dispatch wrapper for AgentInvoker.
//!
//! 1. `AgentInvokerDyn` is an object-safe trait with a boxed future
//! 2. It is blanket-implemented for every `T: AgentInvoker`
//! 3. `BoxAgentInvoker` wraps `Box<dyn AgentInvokerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use weft_types::agent::{AgentError, AgentRequest};

use super::invoker::AgentInvoker;

/// Object-safe version of [`AgentInvoker`] with a boxed future.
pub trait AgentInvokerDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AgentError>> + Send + 'a>>;
}

impl<T: AgentInvoker> AgentInvokerDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Value, AgentError>> + Send + 'a>> {
        Box::pin(self.invoke(request))
    }
}

/// Type-erased agent invoker, for choosing between adapters at runtime
/// (e.g. HTTP endpoint vs. local echo).
pub struct BoxAgentInvoker {
    inner: Box<dyn AgentInvokerDyn + Send + Sync>,
}

impl BoxAgentInvoker {
    pub fn new<T: AgentInvoker + 'static>(invoker: T) -> Self {
        Self {
            inner: Box::new(invoker),
        }
    }
}

impl AgentInvoker for BoxAgentInvoker {
    async fn invoke(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        self.inner.invoke_boxed(request).await
    }
}

impl std::fmt::Debug for BoxAgentInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxAgentInvoker").finish_non_exhaustive()
    }
}
