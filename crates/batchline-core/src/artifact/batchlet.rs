//! Batchlet: a step that runs one user unit of work to completion.

use std::future::Future;
use std::pin::Pin;

use super::ItemError;
use crate::engine::context::StepContext;

/// A single unit of work.
///
/// `process` returns the step's exit status (`None` keeps the default). A stop
/// request is cooperative: the engine calls `stop` and cancels
/// `StepContext::stop_token`, and `process` is expected to return soon after.
pub trait Batchlet: Send + Sync {
    fn process(
        &self,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<Option<String>, ItemError>> + Send;

    fn stop(&self) {}
}

pub trait BatchletDyn: Send + Sync {
    fn process_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, ItemError>> + Send + 'a>>;

    fn stop(&self);
}

impl<T: Batchlet> BatchletDyn for T {
    fn process_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, ItemError>> + Send + 'a>> {
        Box::pin(self.process(ctx))
    }

    fn stop(&self) {
        Batchlet::stop(self)
    }
}

/// Type-erased batchlet handed out by the artifact loader.
pub struct BoxBatchlet {
    inner: Box<dyn BatchletDyn>,
}

impl BoxBatchlet {
    pub fn new<T: Batchlet + 'static>(batchlet: T) -> Self {
        Self {
            inner: Box::new(batchlet),
        }
    }

    pub async fn process(&self, ctx: &StepContext) -> Result<Option<String>, ItemError> {
        self.inner.process_boxed(ctx).await
    }

    pub fn stop(&self) {
        self.inner.stop()
    }
}
