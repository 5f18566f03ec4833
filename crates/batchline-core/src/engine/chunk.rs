//! The read-process-write loop of one chunk step instance.
//!
//! Each chunk is bracketed by exactly one transaction. Items are read and
//! processed into a buffer until the checkpoint policy says the chunk is
//! full (or input ends); the buffer is then written, reader and writer
//! positions are captured into a [`CheckpointRecord`], and the transaction
//! commits. A checkpoint record only ever describes committed work: on any
//! irrecoverable failure the open transaction is rolled back and the last
//! committed record stays in place for the next restart.

use std::time::Duration;

use batchline_types::checkpoint::{CheckpointKey, CheckpointRecord};
use batchline_types::definition::{ArtifactRef, CheckpointPolicy, ChunkDefinition};
use batchline_types::error::RepositoryError;
use batchline_types::status::BatchStatus;
use batchline_types::step::StepExecution;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use super::context::StepContext;
use super::policy::{ItemAction, ItemPolicy};
use super::properties::PropertyResolver;
use super::{Engine, artifact_context};
use crate::artifact::{
    ArtifactError, BoxItemProcessor, BoxItemReader, BoxItemWriter, CheckpointAlgorithm,
    ItemError, Listeners,
};
use crate::repository::JobRepository;
use crate::runtime::{Transaction, TransactionError};

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Item(#[from] ItemError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl ChunkError {
    /// The failure as listeners see it. Engine-side failures get a
    /// `batchline.*` kind.
    pub fn as_item_error(&self) -> ItemError {
        match self {
            Self::Item(e) => e.clone(),
            Self::Artifact(e) => ItemError::new("batchline.Artifact", e.to_string()),
            Self::Repository(e) => ItemError::new("batchline.Repository", e.to_string()),
            Self::Transaction(e) => ItemError::new("batchline.Transaction", e.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct ChunkOutcome {
    pub batch_status: BatchStatus,
    pub failure: Option<ChunkError>,
}

enum Read {
    Item(Value),
    Skipped,
}

enum Readiness {
    Items { item_count: u32, time_limit: Option<Duration> },
    Custom(Box<dyn CheckpointAlgorithm>),
}

struct ChunkRun<'a, R: JobRepository> {
    engine: &'a Engine<R>,
    ctx: &'a StepContext,
    listeners: &'a Listeners,
    execution: &'a mut StepExecution,
    key: CheckpointKey,
    reader: BoxItemReader,
    processor: Option<BoxItemProcessor>,
    writer: BoxItemWriter,
    readiness: Readiness,
    policy: ItemPolicy,
    tx: Box<dyn Transaction>,
    in_tx: bool,
    timeout_secs: u64,
    reader_open: bool,
    writer_open: bool,
    /// Last committed record; restored if the chunk fails after staging.
    record: Option<CheckpointRecord>,
    items_since_start: u64,
}

impl<R: JobRepository> Engine<R> {
    /// Run the chunk loop for one step instance.
    ///
    /// Metrics and persistent user data are written into `execution` (and to
    /// the repository at every commit). The returned status is `Completed`,
    /// `Stopped` or `Failed`.
    pub(crate) async fn run_chunk(
        &self,
        chunk: &ChunkDefinition,
        ctx: &StepContext,
        listeners: &Listeners,
        execution: &mut StepExecution,
        resolver: &PropertyResolver,
    ) -> ChunkOutcome {
        let mut run = match ChunkRun::load(self, chunk, ctx, listeners, execution, resolver) {
            Ok(run) => run,
            Err(error) => {
                tracing::warn!(
                    step = %ctx.step_name,
                    partition = ?ctx.partition,
                    error = %error,
                    "chunk artifacts could not be loaded"
                );
                let item_error = error.as_item_error();
                for listener in &listeners.chunk {
                    listener.on_chunk_error(ctx, &item_error);
                }
                ctx.set_exception(error.to_string());
                return ChunkOutcome {
                    batch_status: BatchStatus::Failed,
                    failure: Some(error),
                };
            }
        };

        let (mut batch_status, mut failure) = match run.execute().await {
            Ok(status) => (status, None),
            Err(error) => {
                run.abort(&error);
                (BatchStatus::Failed, Some(error))
            }
        };

        if let Err(error) = run.close().await {
            if failure.is_none() {
                ctx.set_exception(error.to_string());
                batch_status = BatchStatus::Failed;
                failure = Some(error);
            }
        }

        ctx.set_metrics(run.execution.metrics);
        tracing::info!(
            step = %ctx.step_name,
            partition = ?ctx.partition,
            status = %batch_status,
            read = run.execution.metrics.read_count,
            written = run.execution.metrics.write_count,
            commits = run.execution.metrics.commit_count,
            skips = run.policy.skip_count(),
            retries = run.policy.retry_count(),
            "chunk loop finished"
        );
        ChunkOutcome {
            batch_status,
            failure,
        }
    }
}

impl<'a, R: JobRepository> ChunkRun<'a, R> {
    fn load(
        engine: &'a Engine<R>,
        chunk: &ChunkDefinition,
        ctx: &'a StepContext,
        listeners: &'a Listeners,
        execution: &'a mut StepExecution,
        resolver: &PropertyResolver,
    ) -> Result<Self, ChunkError> {
        let artifact = |r: &ArtifactRef| {
            artifact_context(
                r,
                ctx.job(),
                Some(ctx.step_name.as_str()),
                ctx.partition,
                resolver,
            )
        };

        let reader = engine.artifacts.load_reader(&artifact(&chunk.reader))?;
        let processor = chunk
            .processor
            .as_ref()
            .map(|p| engine.artifacts.load_processor(&artifact(p)))
            .transpose()?;
        let writer = engine.artifacts.load_writer(&artifact(&chunk.writer))?;

        let readiness = match &chunk.checkpoint {
            CheckpointPolicy::Item {
                item_count,
                time_limit_secs,
            } => Readiness::Items {
                item_count: (*item_count)
                    .unwrap_or(engine.config.default_item_count)
                    .max(1),
                time_limit: (*time_limit_secs)
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            },
            CheckpointPolicy::Custom { algorithm } => Readiness::Custom(
                engine
                    .artifacts
                    .load_checkpoint_algorithm(&artifact(algorithm))?,
            ),
        };

        let key = CheckpointKey::new(ctx.job().instance_id, &ctx.step_name, ctx.partition);
        let tx = engine.transactions.transaction(&key);

        Ok(Self {
            engine,
            ctx,
            listeners,
            execution,
            key,
            reader,
            processor,
            writer,
            readiness,
            policy: ItemPolicy::new(chunk),
            tx,
            in_tx: false,
            timeout_secs: engine.config.transaction_timeout_secs,
            reader_open: false,
            writer_open: false,
            record: None,
            items_since_start: 0,
        })
    }

    async fn execute(&mut self) -> Result<BatchStatus, ChunkError> {
        self.record = self.engine.repo.get_checkpoint(&self.key).await?;
        let (reader_cp, writer_cp) = match &self.record {
            Some(record) => {
                tracing::info!(
                    key = %self.key,
                    items = record.items_since_start,
                    "resuming chunk from checkpoint"
                );
                self.items_since_start = record.items_since_start;
                (record.reader.clone(), record.writer.clone())
            }
            None => (None, None),
        };

        self.reader.open(reader_cp).await?;
        self.reader_open = true;
        self.writer.open(writer_cp).await?;
        self.writer_open = true;

        loop {
            self.begin_chunk()?;
            let started = Instant::now();
            let mut buffer = Vec::new();
            let mut read_in_chunk = 0u32;
            let mut exhausted = false;

            loop {
                if self.ctx.is_stop_requested() {
                    self.rollback()?;
                    if read_in_chunk > 0 {
                        self.execution.metrics.rollback_count += 1;
                    }
                    tracing::info!(
                        key = %self.key,
                        discarded = buffer.len(),
                        "stop requested, uncommitted chunk discarded"
                    );
                    return Ok(BatchStatus::Stopped);
                }

                match self.read_one().await? {
                    None => {
                        exhausted = true;
                        break;
                    }
                    Some(Read::Skipped) => {}
                    Some(Read::Item(item)) => {
                        read_in_chunk += 1;
                        self.items_since_start += 1;
                        self.execution.metrics.read_count += 1;
                        if let Some(out) = self.process_one(item).await? {
                            buffer.push(out);
                        }
                        if self.is_ready(read_in_chunk, started) {
                            break;
                        }
                    }
                }
                self.ctx.set_metrics(self.execution.metrics);
            }

            self.flush(buffer).await?;
            if exhausted {
                return Ok(BatchStatus::Completed);
            }
        }
    }

    fn begin_chunk(&mut self) -> Result<(), ChunkError> {
        if let Readiness::Custom(algorithm) = &mut self.readiness {
            self.timeout_secs = algorithm
                .checkpoint_timeout()
                .unwrap_or(self.engine.config.transaction_timeout_secs);
            algorithm.begin_checkpoint();
        }
        self.tx.set_timeout(self.timeout_secs)?;
        self.tx.begin()?;
        self.in_tx = true;
        for listener in &self.listeners.chunk {
            listener.before_chunk(self.ctx);
        }
        Ok(())
    }

    fn is_ready(&mut self, read_in_chunk: u32, started: Instant) -> bool {
        match &mut self.readiness {
            Readiness::Items {
                item_count,
                time_limit,
            } => {
                read_in_chunk >= *item_count
                    || matches!(time_limit, Some(limit) if started.elapsed() >= *limit)
            }
            Readiness::Custom(algorithm) => algorithm.is_ready_to_checkpoint(),
        }
    }

    async fn read_one(&mut self) -> Result<Option<Read>, ChunkError> {
        loop {
            let error = match self.reader.read_item().await {
                Ok(Some(item)) => return Ok(Some(Read::Item(item))),
                Ok(None) => return Ok(None),
                Err(e) => e,
            };
            match self.policy.classify(&error) {
                ItemAction::Retry => {
                    tracing::warn!(key = %self.key, error = %error, "retrying read");
                    for listener in &self.listeners.retry {
                        listener.on_retry_read(&error);
                    }
                }
                ItemAction::Skip => {
                    tracing::warn!(key = %self.key, error = %error, "skipping read");
                    self.execution.metrics.read_skip_count += 1;
                    for listener in &self.listeners.skip {
                        listener.on_skip_read(&error);
                    }
                    return Ok(Some(Read::Skipped));
                }
                ItemAction::Fatal => return Err(error.into()),
            }
        }
    }

    async fn process_one(&mut self, item: Value) -> Result<Option<Value>, ChunkError> {
        let Some(processor) = self.processor.as_mut() else {
            return Ok(Some(item));
        };
        loop {
            let error = match processor.process_item(item.clone()).await {
                Ok(Some(out)) => return Ok(Some(out)),
                Ok(None) => {
                    self.execution.metrics.filter_count += 1;
                    return Ok(None);
                }
                Err(e) => e,
            };
            match self.policy.classify(&error) {
                ItemAction::Retry => {
                    tracing::warn!(key = %self.key, error = %error, "retrying process");
                    for listener in &self.listeners.retry {
                        listener.on_retry_process(&item, &error);
                    }
                }
                ItemAction::Skip => {
                    tracing::warn!(key = %self.key, error = %error, "skipping processed item");
                    self.execution.metrics.process_skip_count += 1;
                    for listener in &self.listeners.skip {
                        listener.on_skip_process(&item, &error);
                    }
                    return Ok(None);
                }
                ItemAction::Fatal => return Err(error.into()),
            }
        }
    }

    async fn flush(&mut self, buffer: Vec<Value>) -> Result<(), ChunkError> {
        if !buffer.is_empty() {
            self.write(buffer).await?;
        }

        let record = CheckpointRecord {
            key: self.key.clone(),
            reader: self.reader.checkpoint_info().await?,
            writer: self.writer.checkpoint_info().await?,
            items_since_start: self.items_since_start,
            committed_at: Utc::now(),
        };
        self.engine.repo.put_checkpoint(&record).await?;

        // From here on the staged record must not outlive a failed chunk.
        self.execution.metrics.commit_count += 1;
        self.execution.persistent_user_data = self.ctx.persistent_data();
        let committed = match self.engine.repo.update_step_execution(&*self.execution).await {
            Ok(()) => self.tx.commit().map_err(ChunkError::from),
            Err(error) => Err(error.into()),
        };
        if let Err(error) = committed {
            self.execution.metrics.commit_count -= 1;
            self.restore_checkpoint().await;
            return Err(error);
        }
        self.in_tx = false;
        tracing::debug!(
            key = %self.key,
            items = self.items_since_start,
            commits = self.execution.metrics.commit_count,
            "chunk committed"
        );
        self.record = Some(record);

        self.ctx.set_metrics(self.execution.metrics);
        for listener in &self.listeners.chunk {
            listener.after_chunk(self.ctx);
        }
        if let Readiness::Custom(algorithm) = &mut self.readiness {
            algorithm.end_checkpoint();
        }
        Ok(())
    }

    /// Put back the last committed record after the chunk failed past staging.
    async fn restore_checkpoint(&mut self) {
        let repo = &self.engine.repo;
        let restored = match &self.record {
            Some(previous) => repo.put_checkpoint(previous).await,
            None => repo.delete_checkpoint(&self.key).await,
        };
        if let Err(e) = restored {
            tracing::error!(key = %self.key, error = %e, "failed to restore checkpoint after chunk failure");
        }
    }

    async fn write(&mut self, buffer: Vec<Value>) -> Result<(), ChunkError> {
        loop {
            let error = match self.writer.write_items(&buffer).await {
                Ok(()) => {
                    self.execution.metrics.write_count += buffer.len() as u64;
                    return Ok(());
                }
                Err(e) => e,
            };
            match self.policy.classify_batch(&error) {
                ItemAction::Retry => {
                    tracing::warn!(key = %self.key, error = %error, items = buffer.len(), "retrying write");
                    for listener in &self.listeners.retry {
                        listener.on_retry_write(&buffer, &error);
                    }
                    self.restart_transaction()?;
                }
                ItemAction::Skip => {
                    tracing::warn!(
                        key = %self.key,
                        error = %error,
                        items = buffer.len(),
                        "write failed, re-attempting items one at a time"
                    );
                    self.restart_transaction()?;
                    return self.write_each(buffer).await;
                }
                ItemAction::Fatal => return Err(error.into()),
            }
        }
    }

    async fn write_each(&mut self, buffer: Vec<Value>) -> Result<(), ChunkError> {
        for item in buffer {
            let single = std::slice::from_ref(&item);
            loop {
                let error = match self.writer.write_items(single).await {
                    Ok(()) => {
                        self.execution.metrics.write_count += 1;
                        break;
                    }
                    Err(e) => e,
                };
                match self.policy.classify(&error) {
                    ItemAction::Retry => {
                        for listener in &self.listeners.retry {
                            listener.on_retry_write(single, &error);
                        }
                    }
                    ItemAction::Skip => {
                        tracing::warn!(key = %self.key, error = %error, "skipping written item");
                        self.execution.metrics.write_skip_count += 1;
                        for listener in &self.listeners.skip {
                            listener.on_skip_write(single, &error);
                        }
                        break;
                    }
                    ItemAction::Fatal => return Err(error.into()),
                }
            }
        }
        Ok(())
    }

    fn restart_transaction(&mut self) -> Result<(), ChunkError> {
        self.rollback()?;
        self.execution.metrics.rollback_count += 1;
        self.tx.set_timeout(self.timeout_secs)?;
        self.tx.begin()?;
        self.in_tx = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ChunkError> {
        if self.in_tx {
            self.in_tx = false;
            self.tx.rollback()?;
        }
        Ok(())
    }

    /// Irrecoverable failure: undo the open chunk and tell the listeners.
    fn abort(&mut self, error: &ChunkError) {
        tracing::warn!(key = %self.key, error = %error, "chunk failed, rolling back");
        if self.in_tx {
            if let Err(e) = self.rollback() {
                tracing::error!(key = %self.key, error = %e, "rollback failed");
            }
            self.execution.metrics.rollback_count += 1;
        }
        let item_error = error.as_item_error();
        for listener in &self.listeners.chunk {
            listener.on_chunk_error(self.ctx, &item_error);
        }
        self.ctx.set_exception(error.to_string());
    }

    /// Close whatever was opened. The first close failure is returned.
    async fn close(&mut self) -> Result<(), ChunkError> {
        let mut first = None;
        if self.reader_open {
            self.reader_open = false;
            if let Err(e) = self.reader.close().await {
                tracing::warn!(key = %self.key, error = %e, "reader close failed");
                first = Some(ChunkError::from(e));
            }
        }
        if self.writer_open {
            self.writer_open = false;
            if let Err(e) = self.writer.close().await {
                tracing::warn!(key = %self.key, error = %e, "writer close failed");
                if first.is_none() {
                    first = Some(ChunkError::from(e));
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use batchline_types::job::JobParameters;
    use serde_json::json;

    use crate::repository::InMemoryJobRepository;
    use crate::testkit::{self, Recorder};

    async fn run(
        engine: &Engine<InMemoryJobRepository>,
        chunk: &ChunkDefinition,
        params: &[(&str, &str)],
        instance: Option<uuid::Uuid>,
    ) -> (ChunkOutcome, StepExecution) {
        let params: JobParameters = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let job = testkit::job_context("chunky", instance, params.clone());
        let mut execution = StepExecution::new(job.execution_id, "load", None);
        engine.repo.create_step_execution(&execution).await.unwrap();
        let ctx = StepContext::new(
            job.clone(),
            "load",
            None,
            execution.step_execution_id,
            Default::default(),
        );
        let resolver = PropertyResolver::new(params, Default::default());
        let outcome = engine
            .run_chunk(chunk, &ctx, &Listeners::default(), &mut execution, &resolver)
            .await;
        (outcome, execution)
    }

    #[tokio::test]
    async fn commits_every_item_count_and_at_end_of_data() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "10" } }
writer: { name: collect }
checkpoint: { policy: item, item_count: 4 }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(execution.metrics.read_count, 10);
        assert_eq!(execution.metrics.write_count, 10);
        // 4 + 4 + 2, then the end-of-data chunk.
        assert_eq!(execution.metrics.commit_count, 3);
        assert_eq!(recorder.written(), (0..10).map(|i| json!(i)).collect::<Vec<_>>());
        assert_eq!(recorder.count("tx:begin"), 3);
        assert_eq!(recorder.count("tx:commit"), 3);
    }

    #[tokio::test]
    async fn failed_read_keeps_last_committed_checkpoint() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r##"
reader: { name: seq, properties: { count: "20", fail_at: "#{jobParameters['fail_at']}" } }
writer: { name: collect }
checkpoint: { policy: item, item_count: 7 }
"##,
        );
        let instance = uuid::Uuid::now_v7();

        // The twelfth read (offset 11) fails with an unmapped error.
        let (outcome, execution) = run(&engine, &chunk, &[("fail_at", "11")], Some(instance)).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert!(matches!(outcome.failure, Some(ChunkError::Item(_))));
        assert_eq!(execution.metrics.commit_count, 1);
        assert_eq!(execution.metrics.rollback_count, 1);
        assert_eq!(recorder.written().len(), 7);

        let key = CheckpointKey::new(instance, "load", None);
        let record = engine.repo.get_checkpoint(&key).await.unwrap().unwrap();
        assert_eq!(record.reader, Some(json!(7)));
        assert_eq!(record.items_since_start, 7);

        let (outcome, _) = run(&engine, &chunk, &[], Some(instance)).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(recorder.opened(), vec![None, Some(json!(7))]);
        assert_eq!(recorder.written(), (0..20).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn second_skip_over_limit_fails_the_step() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "10", fail_at: "2,5", fail_kind: "data.Malformed", fail_advance: "true" } }
writer: { name: collect }
skip_limit: 1
skippable: { include: [data] }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert_eq!(execution.metrics.read_skip_count, 1);
        assert_eq!(execution.metrics.commit_count, 0);
    }

    #[tokio::test]
    async fn skipped_reads_are_counted_and_reading_continues() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "6", fail_at: "2", fail_kind: "data.Malformed", fail_advance: "true" } }
writer: { name: collect }
skippable: { include: [data] }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(execution.metrics.read_skip_count, 1);
        assert_eq!(execution.metrics.read_count, 5);
        assert_eq!(
            recorder.written(),
            vec![json!(0), json!(1), json!(3), json!(4), json!(5)]
        );
    }

    #[tokio::test]
    async fn retry_limit_bounds_transient_read_failures() {
        let chunk = |times: u32| {
            testkit::chunk(&format!(
                r#"
reader: {{ name: seq, properties: {{ count: "5", fail_at: "3", fail_times: "{times}", fail_kind: "io.Transient" }} }}
writer: {{ name: collect }}
retry_limit: 3
retryable: {{ include: [io] }}
"#
            ))
        };

        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let (outcome, _) = run(&engine, &chunk(3), &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(recorder.written().len(), 5);

        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let (outcome, _) = run(&engine, &chunk(4), &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn skippable_write_failure_is_retried_item_by_item() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "5" } }
writer: { name: collect, properties: { fail_on: "2" } }
checkpoint: { policy: item, item_count: 5 }
skippable: { include: [data] }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(
            recorder.written(),
            vec![json!(0), json!(1), json!(3), json!(4)]
        );
        assert_eq!(execution.metrics.write_skip_count, 1);
        assert_eq!(execution.metrics.write_count, 4);
        assert_eq!(execution.metrics.rollback_count, 1);
        assert_eq!(recorder.count("tx:rollback"), 1);
    }

    #[tokio::test]
    async fn retryable_write_failure_rewrites_the_batch() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "3" } }
writer: { name: collect, properties: { fail_on: "1", fail_times: "1", fail_kind: "io.Busy" } }
retryable: { include: [io] }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(recorder.written(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(execution.metrics.write_count, 3);
        assert_eq!(execution.metrics.rollback_count, 1);
    }

    #[tokio::test]
    async fn filtered_items_are_not_written() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "6" } }
processor: { name: parity }
writer: { name: collect }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(execution.metrics.filter_count, 3);
        assert_eq!(recorder.written(), vec![json!(0), json!(2), json!(4)]);
    }

    #[tokio::test]
    async fn custom_algorithm_decides_chunk_boundaries() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "7" } }
writer: { name: collect }
checkpoint: { policy: custom, algorithm: { name: every-n, properties: { n: "3" } } }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(execution.metrics.commit_count, 3);
        assert_eq!(recorder.count("algorithm:begin"), 3);
        assert_eq!(recorder.count("algorithm:end"), 3);
    }

    #[tokio::test]
    async fn stop_discards_the_open_chunk() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "100", stop_at: "5" } }
writer: { name: collect }
checkpoint: { policy: item, item_count: 4 }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Stopped);
        assert_eq!(recorder.written().len(), 4);
        assert_eq!(execution.metrics.commit_count, 1);
        assert_eq!(execution.metrics.rollback_count, 1);
        assert_eq!(recorder.count("reader:close"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn time_limit_commits_slow_chunks_early() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "5", delay_ms: "1000" } }
writer: { name: collect }
checkpoint: { policy: item, item_count: 100, time_limit_secs: 2 }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(execution.metrics.read_count, 5);
        // Two items fit in each two-second window; the last one ends with the data.
        assert_eq!(execution.metrics.commit_count, 3);
        assert_eq!(recorder.count("write:2"), 2);
        assert_eq!(recorder.count("write:1"), 1);
    }

    #[tokio::test]
    async fn failed_commit_puts_back_the_previous_checkpoint() {
        let recorder = Recorder::new();
        let engine = testkit::engine_with(
            &recorder,
            Arc::new(testkit::RecordingTransactions::failing_commit(&recorder, 2)),
        );
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "10" } }
writer: { name: collect }
checkpoint: { policy: item, item_count: 4 }
"#,
        );
        let instance = uuid::Uuid::now_v7();
        let (outcome, execution) = run(&engine, &chunk, &[], Some(instance)).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert!(matches!(outcome.failure, Some(ChunkError::Transaction(_))));
        assert_eq!(execution.metrics.commit_count, 1);
        assert_eq!(recorder.count("tx:commit-failed"), 1);
        assert_eq!(recorder.count("tx:rollback"), 1);

        let key = CheckpointKey::new(instance, "load", None);
        let record = engine.repo.get_checkpoint(&key).await.unwrap().unwrap();
        assert_eq!(record.reader, Some(json!(4)));
        assert_eq!(record.items_since_start, 4);
    }

    #[tokio::test]
    async fn repository_failure_before_commit_leaves_no_checkpoint() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq, properties: { count: "10" } }
writer: { name: collect }
checkpoint: { policy: item, item_count: 4 }
"#,
        );
        let job = testkit::job_context("chunky", None, JobParameters::new());
        // Never stored, so the per-chunk update of the execution fails.
        let mut execution = StepExecution::new(job.execution_id, "load", None);
        let ctx = StepContext::new(
            job.clone(),
            "load",
            None,
            execution.step_execution_id,
            Default::default(),
        );
        let resolver = PropertyResolver::new(JobParameters::new(), Default::default());
        let outcome = engine
            .run_chunk(&chunk, &ctx, &Listeners::default(), &mut execution, &resolver)
            .await;

        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert!(matches!(
            outcome.failure,
            Some(ChunkError::Repository(RepositoryError::NotFound))
        ));
        assert_eq!(execution.metrics.commit_count, 0);
        assert_eq!(recorder.count("tx:commit"), 0);
        assert_eq!(recorder.count("tx:rollback"), 1);

        let key = CheckpointKey::new(job.instance_id, "load", None);
        assert!(engine.repo.get_checkpoint(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_artifact_fails_without_opening_anything() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let chunk = testkit::chunk(
            r#"
reader: { name: seq }
writer: { name: nowhere }
"#,
        );
        let (outcome, execution) = run(&engine, &chunk, &[], None).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert!(matches!(outcome.failure, Some(ChunkError::Artifact(_))));
        assert_eq!(execution.metrics.rollback_count, 0);
        assert!(recorder.opened().is_empty());
    }

    #[test]
    fn engine_failures_get_batchline_kinds() {
        let err = ChunkError::Transaction(TransactionError::Timeout(5));
        assert_eq!(err.as_item_error().kind, "batchline.Transaction");
        let err = ChunkError::Item(ItemError::new("io.Disk", "full"));
        assert_eq!(err.as_item_error().kind, "io.Disk");
    }
}
