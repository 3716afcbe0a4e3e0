//! Infrastructure layer for Weft.
//!
//! Contains implementations of the ports defined in `weft-core`: the SQLite
//! checkpoint store, the HTTP and echo agent invokers, and the `weft.toml`
//! configuration loader.

pub mod agent;
pub mod config;
pub mod sqlite;
