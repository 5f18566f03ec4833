//! Infrastructure layer for batchline.
//!
//! Contains implementations of the ports defined in `batchline-core`: the
//! SQLite job repository, the `config.toml` loader and a directory-backed
//! job definition source.

pub mod config;
pub mod definition;
pub mod sqlite;
