//! Engine logic and port traits for Weft.
//!
//! This crate defines the "ports" (agent invocation and checkpoint storage)
//! that the infrastructure layer implements, plus everything that runs a
//! workflow: validation, dependency analysis, the execution context, step
//! executors, the dependency scheduler and the retry & fallback controller.
//! It depends only on `weft-types` -- never on `weft-infra` or any
//! database/IO crate.

pub mod agent;
pub mod event;
pub mod workflow;
