//! Workflow engine: definition validation, planning, scheduling, step
//! execution, context management and checkpointing.

pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod scheduler;
pub mod step_runner;
