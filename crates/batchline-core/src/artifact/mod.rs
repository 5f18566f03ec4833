//! User-supplied processing units ("artifacts") and how the engine loads them.
//!
//! Readers, processors, writers and batchlets are async (RPITIT) with an
//! object-safe `*Dyn` twin and a `Box*` wrapper, so the loader can hand out
//! type-erased instances. Listeners, deciders, checkpoint algorithms and the
//! partition callbacks are plain synchronous traits.

pub mod batchlet;
pub mod decider;
pub mod item;
pub mod listener;
pub mod partition;
pub mod registry;

use thiserror::Error;

pub use batchlet::{Batchlet, BoxBatchlet};
pub use decider::Decider;
pub use item::{
    BoxItemProcessor, BoxItemReader, BoxItemWriter, CheckpointAlgorithm, ItemProcessor,
    ItemReader, ItemWriter,
};
pub use listener::{
    ChunkListener, JobListener, Listeners, RetryListener, SkipListener, StepListener,
};
pub use partition::{
    PartitionAnalyzer, PartitionCollector, PartitionMapper, PartitionReducer, PartitionStatus,
};
pub use registry::{ArtifactContext, ArtifactLoader, ArtifactRegistry};

/// Failure raised by a user unit.
///
/// `kind` is a dotted, hierarchical error class (`"io.remote.Timeout"`) that
/// the chunk loop matches against the step's skippable/retryable lists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ItemError {
    pub kind: String,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Errors resolving an artifact by name.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("no {kind} registered under '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("failed to construct {kind} '{name}': {message}")]
    Construction {
        kind: &'static str,
        name: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_error_display() {
        let err = ItemError::new("io.remote.Timeout", "upstream did not answer");
        assert_eq!(err.to_string(), "io.remote.Timeout: upstream did not answer");
    }

    #[test]
    fn artifact_error_display() {
        let err = ArtifactError::NotFound {
            kind: "reader",
            name: "csv".to_string(),
        };
        assert_eq!(err.to_string(), "no reader registered under 'csv'");
    }
}
