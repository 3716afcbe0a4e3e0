//! Agent invocation adapters.
//!
//! - [`http::HttpAgentInvoker`] posts requests to a configured endpoint and
//!   classifies failures into [`weft_types::agent::AgentError`].
//! - [`echo::EchoAgentInvoker`] returns its input, for dry runs.

pub mod echo;
pub mod http;
