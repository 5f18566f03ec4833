//! Batch job execution engine for batchline.
//!
//! This crate holds the engine itself (transition resolver, chunk loop, step
//! engine, partition and split orchestration, job controller) and the "ports"
//! it drives: the job repository trait, transaction control, the worker pool
//! and the artifact loader. It depends only on `batchline-types` -- never on
//! `batchline-infra` or any database crate.

pub mod artifact;
pub mod engine;
pub mod operator;
pub mod repository;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testkit;
