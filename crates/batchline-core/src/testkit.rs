//! Mock artifacts and builders shared by the engine tests.
//!
//! Every artifact reports what happened to a shared [`Recorder`]. Behaviour is
//! driven by artifact properties, so a test can steer a run through job
//! parameters (`#{jobParameters['...']}`) and a restart can change it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchline_types::checkpoint::CheckpointKey;
use batchline_types::config::EngineConfig;
use batchline_types::definition::{ChunkDefinition, JobDefinition, Properties, StepDefinition};
use batchline_types::job::JobParameters;
use batchline_types::partition::PartitionPlan;
use batchline_types::status::BatchStatus;
use batchline_types::step::StepExecution;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::artifact::{
    ArtifactContext, ArtifactRegistry, Batchlet, CheckpointAlgorithm, ChunkListener, Decider,
    ItemError, ItemProcessor, ItemReader, ItemWriter, JobListener, PartitionAnalyzer,
    PartitionCollector, PartitionMapper, PartitionReducer, PartitionStatus, RetryListener,
    SkipListener, StepListener,
};
use crate::engine::{Engine, JobContext, StepContext};
use crate::operator::{DefinitionCatalog, JobOperator};
use crate::repository::InMemoryJobRepository;
use crate::runtime::{Transaction, TransactionError, TransactionManager, WorkerPool};

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<String>>,
    written: Mutex<Vec<Value>>,
    opened: Mutex<Vec<Option<Value>>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub(crate) fn written(&self) -> Vec<Value> {
        self.written.lock().unwrap().clone()
    }

    /// Checkpoints the readers were opened with, in order.
    pub(crate) fn opened(&self) -> Vec<Option<Value>> {
        self.opened.lock().unwrap().clone()
    }

    /// Poll until `event` has been recorded.
    pub(crate) async fn wait_for(&self, event: &str) {
        for _ in 0..400 {
            if self.count(event) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event '{event}' never happened; saw {:?}", self.events());
    }
}

fn list(ctx: &ArtifactContext, key: &str) -> Vec<u64> {
    ctx.property(key)
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

fn flag(ctx: &ArtifactContext, key: &str) -> bool {
    ctx.property(key) == Some("true")
}

// ---------------------------------------------------------------------------
// Item artifacts
// ---------------------------------------------------------------------------

/// Reads `start..start+count` as JSON numbers; its checkpoint is the next
/// position. `fail_at` positions fail `fail_times` times each, and every
/// item takes `delay_ms` to arrive.
pub(crate) struct SeqReader {
    recorder: Arc<Recorder>,
    job: Arc<JobContext>,
    start: u64,
    end: u64,
    pos: u64,
    faults: HashMap<u64, u32>,
    fail_kind: String,
    fail_advance: bool,
    stop_at: Option<u64>,
    delay: Duration,
}

impl SeqReader {
    fn new(ctx: &ArtifactContext, recorder: Arc<Recorder>) -> Self {
        let start = ctx.property_or("start", 0u64);
        let times = ctx.property_or("fail_times", 1u32);
        Self {
            recorder,
            job: Arc::clone(&ctx.job),
            start,
            end: start + ctx.property_or("count", 10u64),
            pos: start,
            faults: list(ctx, "fail_at").into_iter().map(|at| (at, times)).collect(),
            fail_kind: ctx.property_or("fail_kind", "io.Transient".to_string()),
            fail_advance: flag(ctx, "fail_advance"),
            stop_at: ctx.property("stop_at").and_then(|v| v.parse().ok()),
            delay: Duration::from_millis(ctx.property_or("delay_ms", 0u64)),
        }
    }
}

impl ItemReader for SeqReader {
    async fn open(&mut self, checkpoint: Option<Value>) -> Result<(), ItemError> {
        self.pos = checkpoint.as_ref().and_then(Value::as_u64).unwrap_or(self.start);
        self.recorder.opened.lock().unwrap().push(checkpoint);
        Ok(())
    }

    async fn read_item(&mut self) -> Result<Option<Value>, ItemError> {
        if self.pos >= self.end {
            return Ok(None);
        }
        if let Some(remaining) = self.faults.get_mut(&self.pos) {
            if *remaining > 0 {
                *remaining -= 1;
                let at = self.pos;
                if self.fail_advance {
                    self.pos += 1;
                }
                return Err(ItemError::new(self.fail_kind.clone(), format!("read {at}")));
            }
        }
        if self.stop_at == Some(self.pos) {
            self.job.stop_token().cancel();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let item = json!(self.pos);
        self.pos += 1;
        Ok(Some(item))
    }

    async fn checkpoint_info(&mut self) -> Result<Option<Value>, ItemError> {
        Ok(Some(json!(self.pos)))
    }

    async fn close(&mut self) -> Result<(), ItemError> {
        self.recorder.record("reader:close");
        Ok(())
    }
}

/// Appends written batches to the recorder. Items listed in `fail_on` fail any
/// batch that contains them, `fail_times` times (forever by default).
pub(crate) struct CollectWriter {
    recorder: Arc<Recorder>,
    faults: HashMap<u64, u32>,
    fail_kind: String,
}

impl CollectWriter {
    fn new(ctx: &ArtifactContext, recorder: Arc<Recorder>) -> Self {
        let times = ctx.property_or("fail_times", u32::MAX);
        Self {
            recorder,
            faults: list(ctx, "fail_on").into_iter().map(|v| (v, times)).collect(),
            fail_kind: ctx.property_or("fail_kind", "data.BadRecord".to_string()),
        }
    }
}

impl ItemWriter for CollectWriter {
    async fn write_items(&mut self, items: &[Value]) -> Result<(), ItemError> {
        for item in items {
            let Some(value) = item.as_u64() else { continue };
            if let Some(remaining) = self.faults.get_mut(&value) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ItemError::new(self.fail_kind.clone(), format!("write {value}")));
                }
            }
        }
        self.recorder.written.lock().unwrap().extend_from_slice(items);
        self.recorder.record(format!("write:{}", items.len()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ItemError> {
        self.recorder.record("writer:close");
        Ok(())
    }
}

/// Filters out odd numbers.
pub(crate) struct ParityFilter;

impl ItemProcessor for ParityFilter {
    async fn process_item(&mut self, item: Value) -> Result<Option<Value>, ItemError> {
        Ok(item.as_u64().filter(|v| v % 2 == 0).map(|v| json!(v)))
    }
}

/// Ready every `n` items.
pub(crate) struct EveryN {
    recorder: Arc<Recorder>,
    n: u32,
    seen: u32,
}

impl CheckpointAlgorithm for EveryN {
    fn begin_checkpoint(&mut self) {
        self.seen = 0;
        self.recorder.record("algorithm:begin");
    }

    fn is_ready_to_checkpoint(&mut self) -> bool {
        self.seen += 1;
        self.seen >= self.n
    }

    fn end_checkpoint(&mut self) {
        self.recorder.record("algorithm:end");
    }
}

// ---------------------------------------------------------------------------
// Batchlets
// ---------------------------------------------------------------------------

/// Returns the `exit` property as its exit status; fails when `fail` is "true".
pub(crate) struct ExitBatchlet {
    recorder: Arc<Recorder>,
    exit: Option<String>,
    fail: bool,
}

impl Batchlet for ExitBatchlet {
    async fn process(&self, ctx: &StepContext) -> Result<Option<String>, ItemError> {
        match ctx.partition {
            Some(p) => self.recorder.record(format!("run:{}#{p}", ctx.step_name)),
            None => self.recorder.record(format!("run:{}", ctx.step_name)),
        }
        if self.fail {
            return Err(ItemError::new("batch.Broken", format!("{} failed", ctx.step_name)));
        }
        Ok(self.exit.clone())
    }
}

/// Runs until a stop is requested.
pub(crate) struct WaitForStop {
    recorder: Arc<Recorder>,
}

impl Batchlet for WaitForStop {
    async fn process(&self, ctx: &StepContext) -> Result<Option<String>, ItemError> {
        self.recorder.record("wait:started");
        ctx.stop_token().cancelled().await;
        Ok(None)
    }

    fn stop(&self) {
        self.recorder.record("wait:stop");
    }
}

// ---------------------------------------------------------------------------
// Decider, partition callbacks, listeners
// ---------------------------------------------------------------------------

/// Routes on the `route` property, else on the last prior exit status.
pub(crate) struct EchoDecider {
    recorder: Arc<Recorder>,
    route: Option<String>,
}

impl Decider for EchoDecider {
    fn decide(&self, executions: &[StepExecution]) -> Result<String, ItemError> {
        self.recorder.record(format!("decide:{}", executions.len()));
        if let Some(route) = &self.route {
            return Ok(route.clone());
        }
        executions
            .last()
            .map(|e| e.exit_status.clone())
            .ok_or_else(|| ItemError::new("decide.Empty", "nothing to decide on"))
    }
}

/// `partitions` partitions of `size` items each.
pub(crate) struct RangeMapper {
    partitions: u32,
    size: u64,
}

impl PartitionMapper for RangeMapper {
    fn map_partitions(&self) -> Result<PartitionPlan, ItemError> {
        let mut plan = PartitionPlan::new(self.partitions);
        plan.partition_properties = (0..self.partitions)
            .map(|i| {
                Properties::from([
                    ("start".to_string(), (u64::from(i) * self.size).to_string()),
                    ("count".to_string(), self.size.to_string()),
                ])
            })
            .collect();
        Ok(plan)
    }
}

pub(crate) struct MetricsCollector;

impl PartitionCollector for MetricsCollector {
    fn collect_partition_data(&mut self, ctx: &StepContext) -> Result<Option<Value>, ItemError> {
        Ok(Some(json!({
            "partition": ctx.partition,
            "read": ctx.metrics().read_count,
        })))
    }
}

pub(crate) struct RecordingAnalyzer {
    recorder: Arc<Recorder>,
}

impl PartitionAnalyzer for RecordingAnalyzer {
    fn analyze_collector_data(&mut self, data: &Value) -> Result<(), ItemError> {
        self.recorder.record(format!("analyze:data:{}", data["partition"]));
        Ok(())
    }

    fn analyze_status(&mut self, batch_status: BatchStatus, _exit: &str) -> Result<(), ItemError> {
        self.recorder.record(format!("analyze:status:{batch_status}"));
        Ok(())
    }
}

pub(crate) struct RecordingReducer {
    recorder: Arc<Recorder>,
}

impl PartitionReducer for RecordingReducer {
    fn begin_partitioned_step(&mut self) -> Result<(), ItemError> {
        self.recorder.record("reducer:begin");
        Ok(())
    }

    fn before_partitioned_step_completion(&mut self) -> Result<(), ItemError> {
        self.recorder.record("reducer:before_completion");
        Ok(())
    }

    fn rollback_partitioned_step(&mut self) -> Result<(), ItemError> {
        self.recorder.record("reducer:rollback");
        Ok(())
    }

    fn after_partitioned_step_completion(&mut self, status: PartitionStatus) -> Result<(), ItemError> {
        self.recorder.record(format!("reducer:after:{status:?}"));
        Ok(())
    }
}

pub(crate) struct Audit {
    recorder: Arc<Recorder>,
}

impl JobListener for Audit {
    fn before_job(&self, _ctx: &JobContext) {
        self.recorder.record("job:before");
    }

    fn after_job(&self, ctx: &JobContext) {
        self.recorder.record(format!("job:after:{}", ctx.batch_status()));
    }
}

impl StepListener for Audit {
    fn before_step(&self, ctx: &StepContext) {
        self.recorder.record(format!("step:before:{}", ctx.step_name));
    }

    fn after_step(&self, ctx: &StepContext) {
        self.recorder
            .record(format!("step:after:{}:{}", ctx.step_name, ctx.batch_status()));
    }
}

impl ChunkListener for Audit {
    fn before_chunk(&self, _ctx: &StepContext) {
        self.recorder.record("chunk:before");
    }

    fn after_chunk(&self, _ctx: &StepContext) {
        self.recorder.record("chunk:after");
    }

    fn on_chunk_error(&self, _ctx: &StepContext, error: &ItemError) {
        self.recorder.record(format!("chunk:error:{}", error.kind));
    }
}

impl SkipListener for Audit {
    fn on_skip_read(&self, _error: &ItemError) {
        self.recorder.record("skip:read");
    }

    fn on_skip_write(&self, _items: &[Value], _error: &ItemError) {
        self.recorder.record("skip:write");
    }
}

impl RetryListener for Audit {
    fn on_retry_read(&self, _error: &ItemError) {
        self.recorder.record("retry:read");
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Records transaction calls. With `fail_commit = Some(n)`, the n-th commit
/// (counted across every transaction the manager handed out) fails.
pub(crate) struct RecordingTransactions {
    recorder: Arc<Recorder>,
    commits: Arc<AtomicU32>,
    fail_commit: Option<u32>,
}

impl RecordingTransactions {
    pub(crate) fn new(recorder: &Arc<Recorder>) -> Self {
        Self {
            recorder: Arc::clone(recorder),
            commits: Arc::new(AtomicU32::new(0)),
            fail_commit: None,
        }
    }

    pub(crate) fn failing_commit(recorder: &Arc<Recorder>, nth: u32) -> Self {
        Self {
            fail_commit: Some(nth),
            ..Self::new(recorder)
        }
    }
}

impl TransactionManager for RecordingTransactions {
    fn transaction(&self, _key: &CheckpointKey) -> Box<dyn Transaction> {
        Box::new(RecordingTransaction {
            recorder: Arc::clone(&self.recorder),
            commits: Arc::clone(&self.commits),
            fail_commit: self.fail_commit,
        })
    }
}

struct RecordingTransaction {
    recorder: Arc<Recorder>,
    commits: Arc<AtomicU32>,
    fail_commit: Option<u32>,
}

impl Transaction for RecordingTransaction {
    fn set_timeout(&mut self, secs: u64) -> Result<(), TransactionError> {
        self.recorder.record(format!("tx:timeout:{secs}"));
        Ok(())
    }

    fn begin(&mut self) -> Result<(), TransactionError> {
        self.recorder.record("tx:begin");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TransactionError> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_commit == Some(n) {
            self.recorder.record("tx:commit-failed");
            return Err(TransactionError::Commit(format!("commit {n} refused")));
        }
        self.recorder.record("tx:commit");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), TransactionError> {
        self.recorder.record("tx:rollback");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub(crate) fn registry(recorder: &Arc<Recorder>) -> ArtifactRegistry {
    let mut registry = ArtifactRegistry::new();
    let p = Arc::clone(recorder);
    registry.register_reader("seq", move |ctx| SeqReader::new(ctx, Arc::clone(&p)));
    let p = Arc::clone(recorder);
    registry.register_writer("collect", move |ctx| CollectWriter::new(ctx, Arc::clone(&p)));
    registry.register_processor("parity", |_| ParityFilter);
    let p = Arc::clone(recorder);
    registry.register_checkpoint_algorithm("every-n", move |ctx| EveryN {
        recorder: Arc::clone(&p),
        n: ctx.property_or("n", 1),
        seen: 0,
    });
    let p = Arc::clone(recorder);
    registry.register_batchlet("exit", move |ctx| ExitBatchlet {
        recorder: Arc::clone(&p),
        exit: ctx.property("exit").filter(|e| !e.is_empty()).map(str::to_string),
        fail: flag(ctx, "fail"),
    });
    let p = Arc::clone(recorder);
    registry.register_batchlet("wait-stop", move |_| WaitForStop {
        recorder: Arc::clone(&p),
    });
    let p = Arc::clone(recorder);
    registry.register_decider("echo", move |ctx| EchoDecider {
        recorder: Arc::clone(&p),
        route: ctx.property("route").filter(|r| !r.is_empty()).map(str::to_string),
    });
    registry.register_mapper("range", |ctx| RangeMapper {
        partitions: ctx.property_or("partitions", 2),
        size: ctx.property_or("size", 5),
    });
    registry.register_collector("metrics", |_| MetricsCollector);
    let p = Arc::clone(recorder);
    registry.register_analyzer("recording", move |_| RecordingAnalyzer {
        recorder: Arc::clone(&p),
    });
    let p = Arc::clone(recorder);
    registry.register_reducer("recording", move |_| RecordingReducer {
        recorder: Arc::clone(&p),
    });

    let p = Arc::clone(recorder);
    registry.register_job_listener("audit", move |_| Audit {
        recorder: Arc::clone(&p),
    });
    let p = Arc::clone(recorder);
    registry.register_step_listener("audit", move |_| Audit {
        recorder: Arc::clone(&p),
    });
    let p = Arc::clone(recorder);
    registry.register_chunk_listener("audit", move |_| Audit {
        recorder: Arc::clone(&p),
    });
    let p = Arc::clone(recorder);
    registry.register_skip_listener("audit", move |_| Audit {
        recorder: Arc::clone(&p),
    });
    let p = Arc::clone(recorder);
    registry.register_retry_listener("audit", move |_| Audit {
        recorder: Arc::clone(&p),
    });
    registry
}

pub(crate) fn engine(recorder: &Arc<Recorder>) -> Engine<InMemoryJobRepository> {
    engine_with(recorder, Arc::new(RecordingTransactions::new(recorder)))
}

pub(crate) fn engine_with(
    recorder: &Arc<Recorder>,
    transactions: Arc<dyn TransactionManager>,
) -> Engine<InMemoryJobRepository> {
    Engine::new(
        Arc::new(InMemoryJobRepository::new()),
        transactions,
        WorkerPool::new(8),
        Arc::new(registry(recorder)),
        EngineConfig::default(),
    )
}

pub(crate) fn job(yaml: &str) -> JobDefinition {
    serde_yaml_ng::from_str(yaml).unwrap()
}

pub(crate) fn chunk(yaml: &str) -> ChunkDefinition {
    serde_yaml_ng::from_str(yaml).unwrap()
}

/// A bare step. YAML has no untagged form for `task: { batchlet: .. }`, so it
/// is read as a plain value first.
pub(crate) fn step(yaml: &str) -> StepDefinition {
    let value: Value = serde_yaml_ng::from_str(yaml).unwrap();
    serde_json::from_value(value).unwrap()
}

pub(crate) fn params(pairs: &[(&str, &str)]) -> JobParameters {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn job_context(
    job_name: &str,
    instance_id: Option<Uuid>,
    parameters: JobParameters,
) -> Arc<JobContext> {
    Arc::new(JobContext::new(
        job_name,
        instance_id.unwrap_or_else(Uuid::now_v7),
        Uuid::now_v7(),
        Properties::new(),
        parameters,
    ))
}

pub(crate) fn operator(recorder: &Arc<Recorder>, jobs: &[&str]) -> JobOperator<InMemoryJobRepository> {
    operator_with_pool(recorder, jobs, 8)
}

pub(crate) fn operator_with_pool(
    recorder: &Arc<Recorder>,
    jobs: &[&str],
    pool_size: usize,
) -> JobOperator<InMemoryJobRepository> {
    let mut catalog = DefinitionCatalog::new();
    for yaml in jobs {
        catalog.register(job(yaml));
    }
    JobOperator::new(
        Arc::new(InMemoryJobRepository::new()),
        Arc::new(RecordingTransactions::new(recorder)),
        WorkerPool::new(pool_size),
        Arc::new(registry(recorder)),
        Arc::new(catalog),
        EngineConfig::default(),
    )
}
