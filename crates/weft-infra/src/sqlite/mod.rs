//! SQLite storage layer.
//!
//! Checkpoint storage backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod checkpoint;
pub mod pool;
