//! Observability setup for Weft: structured logging through
//! `tracing-subscriber` with an optional OpenTelemetry bridge.

pub mod tracing_setup;
