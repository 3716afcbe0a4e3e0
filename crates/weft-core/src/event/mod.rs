//! Observability event distribution.

pub mod bus;
