//! Shared domain types for batchline.
//!
//! This crate contains the records the engine reads and writes (job instances,
//! executions, step executions, checkpoints, partition plans), the immutable
//! job-definition graph, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod definition;
pub mod error;
pub mod job;
pub mod partition;
pub mod status;
pub mod step;
