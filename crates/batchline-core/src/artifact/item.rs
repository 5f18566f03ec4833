//! Chunk artifacts: item reader, processor, writer and checkpoint algorithm.
//!
//! Follows the blanket-impl boxing pattern:
//! 1. Async trait with RPITIT methods (`ItemReader`)
//! 2. Object-safe `ItemReaderDyn` with boxed futures, blanket-implemented
//! 3. `BoxItemReader` wraps `Box<dyn ItemReaderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use super::ItemError;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ItemError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Source of items for a chunk step.
pub trait ItemReader: Send {
    /// Position the reader. `checkpoint` is the last committed
    /// `checkpoint_info` value, `None` on a fresh start.
    fn open(
        &mut self,
        checkpoint: Option<Value>,
    ) -> impl Future<Output = Result<(), ItemError>> + Send;

    /// Next item, or `None` at end of data.
    fn read_item(&mut self) -> impl Future<Output = Result<Option<Value>, ItemError>> + Send;

    /// Opaque position marker, captured at every commit.
    fn checkpoint_info(
        &mut self,
    ) -> impl Future<Output = Result<Option<Value>, ItemError>> + Send {
        async { Ok(None) }
    }

    fn close(&mut self) -> impl Future<Output = Result<(), ItemError>> + Send {
        async { Ok(()) }
    }
}

pub trait ItemReaderDyn: Send {
    fn open_boxed(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, ()>;
    fn read_item_boxed(&mut self) -> BoxFuture<'_, Option<Value>>;
    fn checkpoint_info_boxed(&mut self) -> BoxFuture<'_, Option<Value>>;
    fn close_boxed(&mut self) -> BoxFuture<'_, ()>;
}

impl<T: ItemReader> ItemReaderDyn for T {
    fn open_boxed(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, ()> {
        Box::pin(self.open(checkpoint))
    }

    fn read_item_boxed(&mut self) -> BoxFuture<'_, Option<Value>> {
        Box::pin(self.read_item())
    }

    fn checkpoint_info_boxed(&mut self) -> BoxFuture<'_, Option<Value>> {
        Box::pin(self.checkpoint_info())
    }

    fn close_boxed(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

/// Type-erased item reader handed out by the artifact loader.
pub struct BoxItemReader {
    inner: Box<dyn ItemReaderDyn>,
}

impl BoxItemReader {
    pub fn new<T: ItemReader + 'static>(reader: T) -> Self {
        Self {
            inner: Box::new(reader),
        }
    }

    pub async fn open(&mut self, checkpoint: Option<Value>) -> Result<(), ItemError> {
        self.inner.open_boxed(checkpoint).await
    }

    pub async fn read_item(&mut self) -> Result<Option<Value>, ItemError> {
        self.inner.read_item_boxed().await
    }

    pub async fn checkpoint_info(&mut self) -> Result<Option<Value>, ItemError> {
        self.inner.checkpoint_info_boxed().await
    }

    pub async fn close(&mut self) -> Result<(), ItemError> {
        self.inner.close_boxed().await
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Transforms one item. `Ok(None)` filters the item out.
pub trait ItemProcessor: Send {
    fn process_item(
        &mut self,
        item: Value,
    ) -> impl Future<Output = Result<Option<Value>, ItemError>> + Send;
}

pub trait ItemProcessorDyn: Send {
    fn process_item_boxed(&mut self, item: Value) -> BoxFuture<'_, Option<Value>>;
}

impl<T: ItemProcessor> ItemProcessorDyn for T {
    fn process_item_boxed(&mut self, item: Value) -> BoxFuture<'_, Option<Value>> {
        Box::pin(self.process_item(item))
    }
}

pub struct BoxItemProcessor {
    inner: Box<dyn ItemProcessorDyn>,
}

impl BoxItemProcessor {
    pub fn new<T: ItemProcessor + 'static>(processor: T) -> Self {
        Self {
            inner: Box::new(processor),
        }
    }

    pub async fn process_item(&mut self, item: Value) -> Result<Option<Value>, ItemError> {
        self.inner.process_item_boxed(item).await
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Sink for processed items.
///
/// A failed `write_items` call must leave no partial effects: the engine
/// rolls the surrounding transaction back and may re-offer the same items.
pub trait ItemWriter: Send {
    fn open(
        &mut self,
        checkpoint: Option<Value>,
    ) -> impl Future<Output = Result<(), ItemError>> + Send {
        let _ = checkpoint;
        async { Ok(()) }
    }

    fn write_items(
        &mut self,
        items: &[Value],
    ) -> impl Future<Output = Result<(), ItemError>> + Send;

    fn checkpoint_info(
        &mut self,
    ) -> impl Future<Output = Result<Option<Value>, ItemError>> + Send {
        async { Ok(None) }
    }

    fn close(&mut self) -> impl Future<Output = Result<(), ItemError>> + Send {
        async { Ok(()) }
    }
}

pub trait ItemWriterDyn: Send {
    fn open_boxed(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, ()>;
    fn write_items_boxed<'a>(&'a mut self, items: &'a [Value]) -> BoxFuture<'a, ()>;
    fn checkpoint_info_boxed(&mut self) -> BoxFuture<'_, Option<Value>>;
    fn close_boxed(&mut self) -> BoxFuture<'_, ()>;
}

impl<T: ItemWriter> ItemWriterDyn for T {
    fn open_boxed(&mut self, checkpoint: Option<Value>) -> BoxFuture<'_, ()> {
        Box::pin(self.open(checkpoint))
    }

    fn write_items_boxed<'a>(&'a mut self, items: &'a [Value]) -> BoxFuture<'a, ()> {
        Box::pin(self.write_items(items))
    }

    fn checkpoint_info_boxed(&mut self) -> BoxFuture<'_, Option<Value>> {
        Box::pin(self.checkpoint_info())
    }

    fn close_boxed(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

pub struct BoxItemWriter {
    inner: Box<dyn ItemWriterDyn>,
}

impl BoxItemWriter {
    pub fn new<T: ItemWriter + 'static>(writer: T) -> Self {
        Self {
            inner: Box::new(writer),
        }
    }

    pub async fn open(&mut self, checkpoint: Option<Value>) -> Result<(), ItemError> {
        self.inner.open_boxed(checkpoint).await
    }

    pub async fn write_items(&mut self, items: &[Value]) -> Result<(), ItemError> {
        self.inner.write_items_boxed(items).await
    }

    pub async fn checkpoint_info(&mut self) -> Result<Option<Value>, ItemError> {
        self.inner.checkpoint_info_boxed().await
    }

    pub async fn close(&mut self) -> Result<(), ItemError> {
        self.inner.close_boxed().await
    }
}

// ---------------------------------------------------------------------------
// Checkpoint algorithm
// ---------------------------------------------------------------------------

/// Custom commit-interval policy for a chunk step.
pub trait CheckpointAlgorithm: Send {
    /// Transaction timeout for the next chunk, in seconds.
    fn checkpoint_timeout(&self) -> Option<u64> {
        None
    }

    fn begin_checkpoint(&mut self) {}

    /// Called after every item read; `true` flushes the buffer.
    fn is_ready_to_checkpoint(&mut self) -> bool;

    fn end_checkpoint(&mut self) {}
}
