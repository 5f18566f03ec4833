//! The execution engine.
//!
//! Layered leaf-first: the transition resolver and item policy are pure; the
//! chunk loop runs one read-process-write step instance; the step engine runs
//! one step (batchlet, chunk or partitioned); the flow walker sequences
//! elements and fans splits out; the job controller owns one job execution.
//!
//! `Engine` bundles the collaborators every layer needs. It is cheap to clone
//! and is cloned into every spawned partition and split flow.

pub mod chunk;
pub mod context;
pub mod definition;
pub mod flow;
pub mod job;
pub mod partition;
pub mod policy;
pub mod properties;
pub mod step;
pub mod transition;

use std::sync::Arc;

use batchline_types::config::EngineConfig;
use batchline_types::definition::ArtifactRef;
use batchline_types::error::RepositoryError;
use thiserror::Error;

use crate::artifact::{ArtifactContext, ArtifactLoader};
use crate::repository::JobRepository;
use crate::runtime::{TransactionManager, WorkerPool};

pub use chunk::{ChunkError, ChunkOutcome};
pub use context::{JobContext, StepContext};
pub use definition::{DefinitionError, validate_job};
pub use flow::{ScopeOutcome, Terminal, TerminalKind};
pub use partition::PartitionError;
pub use properties::PropertyResolver;
pub use step::{StepError, StepOutcome};

/// Failures that end a job execution outright (as opposed to a unit of work
/// failing, which is recorded as a `FAILED` status and routed by transitions).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Step(#[from] StepError),
}

pub struct Engine<R: JobRepository> {
    pub(crate) repo: Arc<R>,
    pub(crate) transactions: Arc<dyn TransactionManager>,
    pub(crate) pool: WorkerPool,
    pub(crate) artifacts: Arc<dyn ArtifactLoader>,
    pub(crate) config: Arc<EngineConfig>,
}

impl<R: JobRepository> Engine<R> {
    pub fn new(
        repo: Arc<R>,
        transactions: Arc<dyn TransactionManager>,
        pool: WorkerPool,
        artifacts: Arc<dyn ArtifactLoader>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            transactions,
            pool,
            artifacts,
            config: Arc::new(config),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Build the loader context for `artifact`, resolving its properties.
pub(crate) fn artifact_context(
    artifact: &ArtifactRef,
    job: &Arc<JobContext>,
    step_name: Option<&str>,
    partition: Option<u32>,
    resolver: &PropertyResolver,
) -> ArtifactContext {
    ArtifactContext {
        name: artifact.name.clone(),
        properties: resolver.resolve_all(&artifact.properties),
        job: Arc::clone(job),
        step_name: step_name.map(str::to_string),
        partition,
    }
}

// Derived `Clone` would demand `R: Clone`; only the `Arc` is cloned.
impl<R: JobRepository> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            transactions: Arc::clone(&self.transactions),
            pool: self.pool.clone(),
            artifacts: Arc::clone(&self.artifacts),
            config: Arc::clone(&self.config),
        }
    }
}
