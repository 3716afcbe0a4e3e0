//! Shared domain types for Weft.
//!
//! This crate contains the types passed between the engine, its adapters and
//! the CLI: workflow definitions and step kinds, run and step statuses, backend
//! identity and the agent error taxonomy, observability events and
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
