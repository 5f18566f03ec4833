//! SQLite storage layer.
//!
//! The job repository backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod repository;
