//! Agent invocation port and the retry & fallback machinery around it.
//!
//! - `invoker` -- the `AgentInvoker` trait implemented by infra adapters
//! - `box_invoker` -- object-safe wrapper for runtime invoker selection
//! - `cooldown` -- cooldown cache for throttled backends, over an injectable clock
//! - `fallback` -- deterministic backend substitution on throttling

pub mod box_invoker;
pub mod cooldown;
pub mod fallback;
pub mod invoker;
