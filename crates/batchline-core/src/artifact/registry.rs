//! Artifact loading by symbolic name.
//!
//! The engine asks an [`ArtifactLoader`] for every user unit it needs.
//! [`ArtifactRegistry`] is the in-process implementation: a name-indexed set
//! of factories, each called with the resolved properties and the job
//! context of the execution that needs the instance.

use std::collections::HashMap;
use std::sync::Arc;

use batchline_types::definition::Properties;

use super::batchlet::{Batchlet, BoxBatchlet};
use super::decider::Decider;
use super::item::{
    BoxItemProcessor, BoxItemReader, BoxItemWriter, CheckpointAlgorithm, ItemProcessor,
    ItemReader, ItemWriter,
};
use super::listener::{
    ChunkListener, JobListener, Listeners, RetryListener, SkipListener, StepListener,
};
use super::partition::{PartitionAnalyzer, PartitionCollector, PartitionMapper, PartitionReducer};
use super::ArtifactError;
use crate::engine::context::JobContext;

/// What a factory sees when the engine asks for an artifact instance.
#[derive(Debug, Clone)]
pub struct ArtifactContext {
    pub name: String,
    /// Declared artifact properties, with `#{...}` references resolved.
    pub properties: Properties,
    pub job: Arc<JobContext>,
    pub step_name: Option<String>,
    pub partition: Option<u32>,
}

impl ArtifactContext {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parse a property, falling back to `default` when absent or malformed.
    pub fn property_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.property(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

/// Resolves user artifacts by name.
pub trait ArtifactLoader: Send + Sync {
    fn load_batchlet(&self, ctx: &ArtifactContext) -> Result<BoxBatchlet, ArtifactError>;
    fn load_reader(&self, ctx: &ArtifactContext) -> Result<BoxItemReader, ArtifactError>;
    fn load_processor(&self, ctx: &ArtifactContext) -> Result<BoxItemProcessor, ArtifactError>;
    fn load_writer(&self, ctx: &ArtifactContext) -> Result<BoxItemWriter, ArtifactError>;
    fn load_checkpoint_algorithm(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn CheckpointAlgorithm>, ArtifactError>;
    fn load_decider(&self, ctx: &ArtifactContext) -> Result<Arc<dyn Decider>, ArtifactError>;
    fn load_mapper(&self, ctx: &ArtifactContext)
    -> Result<Arc<dyn PartitionMapper>, ArtifactError>;
    fn load_collector(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn PartitionCollector>, ArtifactError>;
    fn load_analyzer(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn PartitionAnalyzer>, ArtifactError>;
    fn load_reducer(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn PartitionReducer>, ArtifactError>;
    fn load_job_listener(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Arc<dyn JobListener>, ArtifactError>;
    /// Every step-scoped listener kind registered under the name.
    fn load_step_listeners(&self, ctx: &ArtifactContext) -> Result<Listeners, ArtifactError>;
}

type Factory<T> = Box<dyn Fn(&ArtifactContext) -> T + Send + Sync>;

/// Name-indexed factories for every artifact kind.
#[derive(Default)]
pub struct ArtifactRegistry {
    batchlets: HashMap<String, Factory<BoxBatchlet>>,
    readers: HashMap<String, Factory<BoxItemReader>>,
    processors: HashMap<String, Factory<BoxItemProcessor>>,
    writers: HashMap<String, Factory<BoxItemWriter>>,
    algorithms: HashMap<String, Factory<Box<dyn CheckpointAlgorithm>>>,
    deciders: HashMap<String, Factory<Arc<dyn Decider>>>,
    mappers: HashMap<String, Factory<Arc<dyn PartitionMapper>>>,
    collectors: HashMap<String, Factory<Box<dyn PartitionCollector>>>,
    analyzers: HashMap<String, Factory<Box<dyn PartitionAnalyzer>>>,
    reducers: HashMap<String, Factory<Box<dyn PartitionReducer>>>,
    job_listeners: HashMap<String, Factory<Arc<dyn JobListener>>>,
    step_listeners: HashMap<String, Factory<Arc<dyn StepListener>>>,
    chunk_listeners: HashMap<String, Factory<Arc<dyn ChunkListener>>>,
    skip_listeners: HashMap<String, Factory<Arc<dyn SkipListener>>>,
    retry_listeners: HashMap<String, Factory<Arc<dyn RetryListener>>>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_batchlet<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Batchlet + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.batchlets
            .insert(name.into(), Box::new(move |ctx| BoxBatchlet::new(factory(ctx))));
        self
    }

    pub fn register_reader<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: ItemReader + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.readers
            .insert(name.into(), Box::new(move |ctx| BoxItemReader::new(factory(ctx))));
        self
    }

    pub fn register_processor<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: ItemProcessor + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.processors
            .insert(name.into(), Box::new(move |ctx| BoxItemProcessor::new(factory(ctx))));
        self
    }

    pub fn register_writer<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: ItemWriter + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.writers
            .insert(name.into(), Box::new(move |ctx| BoxItemWriter::new(factory(ctx))));
        self
    }

    pub fn register_checkpoint_algorithm<T, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> &mut Self
    where
        T: CheckpointAlgorithm + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.algorithms.insert(
            name.into(),
            Box::new(move |ctx| Box::new(factory(ctx)) as Box<dyn CheckpointAlgorithm>),
        );
        self
    }

    pub fn register_decider<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: Decider + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.deciders.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn Decider>),
        );
        self
    }

    pub fn register_mapper<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: PartitionMapper + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.mappers.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn PartitionMapper>),
        );
        self
    }

    pub fn register_collector<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: PartitionCollector + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.collectors.insert(
            name.into(),
            Box::new(move |ctx| Box::new(factory(ctx)) as Box<dyn PartitionCollector>),
        );
        self
    }

    pub fn register_analyzer<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: PartitionAnalyzer + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.analyzers.insert(
            name.into(),
            Box::new(move |ctx| Box::new(factory(ctx)) as Box<dyn PartitionAnalyzer>),
        );
        self
    }

    pub fn register_reducer<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: PartitionReducer + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.reducers.insert(
            name.into(),
            Box::new(move |ctx| Box::new(factory(ctx)) as Box<dyn PartitionReducer>),
        );
        self
    }

    pub fn register_job_listener<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: JobListener + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.job_listeners.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn JobListener>),
        );
        self
    }

    pub fn register_step_listener<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: StepListener + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.step_listeners.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn StepListener>),
        );
        self
    }

    pub fn register_chunk_listener<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: ChunkListener + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.chunk_listeners.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn ChunkListener>),
        );
        self
    }

    pub fn register_skip_listener<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: SkipListener + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.skip_listeners.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn SkipListener>),
        );
        self
    }

    pub fn register_retry_listener<T, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        T: RetryListener + 'static,
        F: Fn(&ArtifactContext) -> T + Send + Sync + 'static,
    {
        self.retry_listeners.insert(
            name.into(),
            Box::new(move |ctx| Arc::new(factory(ctx)) as Arc<dyn RetryListener>),
        );
        self
    }

    /// Every registered name across all artifact kinds, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .batchlets
            .keys()
            .chain(self.readers.keys())
            .chain(self.processors.keys())
            .chain(self.writers.keys())
            .chain(self.algorithms.keys())
            .chain(self.deciders.keys())
            .chain(self.mappers.keys())
            .chain(self.collectors.keys())
            .chain(self.analyzers.keys())
            .chain(self.reducers.keys())
            .chain(self.job_listeners.keys())
            .chain(self.step_listeners.keys())
            .chain(self.chunk_listeners.keys())
            .chain(self.skip_listeners.keys())
            .chain(self.retry_listeners.keys())
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

fn build<T>(
    factories: &HashMap<String, Factory<T>>,
    kind: &'static str,
    ctx: &ArtifactContext,
) -> Result<T, ArtifactError> {
    factories
        .get(&ctx.name)
        .map(|factory| factory(ctx))
        .ok_or_else(|| ArtifactError::NotFound {
            kind,
            name: ctx.name.clone(),
        })
}

impl ArtifactLoader for ArtifactRegistry {
    fn load_batchlet(&self, ctx: &ArtifactContext) -> Result<BoxBatchlet, ArtifactError> {
        build(&self.batchlets, "batchlet", ctx)
    }

    fn load_reader(&self, ctx: &ArtifactContext) -> Result<BoxItemReader, ArtifactError> {
        build(&self.readers, "reader", ctx)
    }

    fn load_processor(&self, ctx: &ArtifactContext) -> Result<BoxItemProcessor, ArtifactError> {
        build(&self.processors, "processor", ctx)
    }

    fn load_writer(&self, ctx: &ArtifactContext) -> Result<BoxItemWriter, ArtifactError> {
        build(&self.writers, "writer", ctx)
    }

    fn load_checkpoint_algorithm(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn CheckpointAlgorithm>, ArtifactError> {
        build(&self.algorithms, "checkpoint algorithm", ctx)
    }

    fn load_decider(&self, ctx: &ArtifactContext) -> Result<Arc<dyn Decider>, ArtifactError> {
        build(&self.deciders, "decider", ctx)
    }

    fn load_mapper(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Arc<dyn PartitionMapper>, ArtifactError> {
        build(&self.mappers, "partition mapper", ctx)
    }

    fn load_collector(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn PartitionCollector>, ArtifactError> {
        build(&self.collectors, "partition collector", ctx)
    }

    fn load_analyzer(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn PartitionAnalyzer>, ArtifactError> {
        build(&self.analyzers, "partition analyzer", ctx)
    }

    fn load_reducer(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Box<dyn PartitionReducer>, ArtifactError> {
        build(&self.reducers, "partition reducer", ctx)
    }

    fn load_job_listener(
        &self,
        ctx: &ArtifactContext,
    ) -> Result<Arc<dyn JobListener>, ArtifactError> {
        build(&self.job_listeners, "job listener", ctx)
    }

    fn load_step_listeners(&self, ctx: &ArtifactContext) -> Result<Listeners, ArtifactError> {
        let mut listeners = Listeners::default();
        if let Some(factory) = self.step_listeners.get(&ctx.name) {
            listeners.step.push(factory(ctx));
        }
        if let Some(factory) = self.chunk_listeners.get(&ctx.name) {
            listeners.chunk.push(factory(ctx));
        }
        if let Some(factory) = self.skip_listeners.get(&ctx.name) {
            listeners.skip.push(factory(ctx));
        }
        if let Some(factory) = self.retry_listeners.get(&ctx.name) {
            listeners.retry.push(factory(ctx));
        }
        if listeners.is_empty() {
            return Err(ArtifactError::NotFound {
                kind: "step listener",
                name: ctx.name.clone(),
            });
        }
        Ok(listeners)
    }
}
