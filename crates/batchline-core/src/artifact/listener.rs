//! Lifecycle listeners.
//!
//! All callbacks default to no-ops; implement only what you need. Listeners of
//! one kind fire in declaration order.

use std::sync::Arc;

use serde_json::Value;

use super::ItemError;
use crate::engine::context::{JobContext, StepContext};

pub trait JobListener: Send + Sync {
    fn before_job(&self, _ctx: &JobContext) {}
    fn after_job(&self, _ctx: &JobContext) {}
}

pub trait StepListener: Send + Sync {
    fn before_step(&self, _ctx: &StepContext) {}
    fn after_step(&self, _ctx: &StepContext) {}
}

pub trait ChunkListener: Send + Sync {
    fn before_chunk(&self, _ctx: &StepContext) {}
    fn after_chunk(&self, _ctx: &StepContext) {}
    /// The current chunk failed irrecoverably and was rolled back.
    fn on_chunk_error(&self, _ctx: &StepContext, _error: &ItemError) {}
}

pub trait SkipListener: Send + Sync {
    fn on_skip_read(&self, _error: &ItemError) {}
    fn on_skip_process(&self, _item: &Value, _error: &ItemError) {}
    fn on_skip_write(&self, _items: &[Value], _error: &ItemError) {}
}

pub trait RetryListener: Send + Sync {
    fn on_retry_read(&self, _error: &ItemError) {}
    fn on_retry_process(&self, _item: &Value, _error: &ItemError) {}
    fn on_retry_write(&self, _items: &[Value], _error: &ItemError) {}
}

/// The listeners attached to one step, grouped by kind.
#[derive(Clone, Default)]
pub struct Listeners {
    pub step: Vec<Arc<dyn StepListener>>,
    pub chunk: Vec<Arc<dyn ChunkListener>>,
    pub skip: Vec<Arc<dyn SkipListener>>,
    pub retry: Vec<Arc<dyn RetryListener>>,
}

impl Listeners {
    /// Append every listener of `other`, keeping declaration order.
    pub fn extend(&mut self, other: Listeners) {
        self.step.extend(other.step);
        self.chunk.extend(other.chunk);
        self.skip.extend(other.skip);
        self.retry.extend(other.retry);
    }

    pub fn is_empty(&self) -> bool {
        self.step.is_empty() && self.chunk.is_empty() && self.skip.is_empty() && self.retry.is_empty()
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("step", &self.step.len())
            .field("chunk", &self.chunk.len())
            .field("skip", &self.skip.len())
            .field("retry", &self.retry.len())
            .finish()
    }
}
