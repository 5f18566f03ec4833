//! Runtime contexts visible to user artifacts.
//!
//! `JobContext` lives for one job execution; `StepContext` for one step or
//! partition instance. Each partition gets its own `StepContext`, so
//! partitions never mutate a shared step context concurrently. The only
//! cross-partition merge point is the partition analyzer.

use std::sync::{Arc, Mutex};

use batchline_types::definition::Properties;
use batchline_types::job::JobParameters;
use batchline_types::status::BatchStatus;
use batchline_types::step::Metrics;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Job-level context shared by every step of one execution.
pub struct JobContext {
    pub job_name: String,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub properties: Properties,
    pub parameters: JobParameters,
    transient: Mutex<Option<Value>>,
    persistent: Mutex<Option<Value>>,
    exit_status: Mutex<Option<String>>,
    batch_status: Mutex<BatchStatus>,
    stop: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_name: &str,
        instance_id: Uuid,
        execution_id: Uuid,
        properties: Properties,
        parameters: JobParameters,
    ) -> Self {
        Self {
            job_name: job_name.to_string(),
            instance_id,
            execution_id,
            properties,
            parameters,
            transient: Mutex::new(None),
            persistent: Mutex::new(None),
            exit_status: Mutex::new(None),
            batch_status: Mutex::new(BatchStatus::Starting),
            stop: CancellationToken::new(),
        }
    }

    /// Cancelled when a stop is requested for this execution.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn transient_data(&self) -> Option<Value> {
        self.transient.lock().expect("job context lock poisoned").clone()
    }

    pub fn set_transient_data(&self, data: Option<Value>) {
        *self.transient.lock().expect("job context lock poisoned") = data;
    }

    /// Job-level user data, restored on restart.
    pub fn persistent_data(&self) -> Option<Value> {
        self.persistent.lock().expect("job context lock poisoned").clone()
    }

    pub fn set_persistent_data(&self, data: Option<Value>) {
        *self.persistent.lock().expect("job context lock poisoned") = data;
    }

    pub fn exit_status(&self) -> Option<String> {
        self.exit_status.lock().expect("job context lock poisoned").clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        *self.exit_status.lock().expect("job context lock poisoned") = Some(exit_status.into());
    }

    pub fn batch_status(&self) -> BatchStatus {
        *self.batch_status.lock().expect("job context lock poisoned")
    }

    pub(crate) fn set_batch_status(&self, status: BatchStatus) {
        *self.batch_status.lock().expect("job context lock poisoned") = status;
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_name", &self.job_name)
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

/// Context of one step instance (a whole step, or one partition of it).
pub struct StepContext {
    pub step_name: String,
    pub partition: Option<u32>,
    pub step_execution_id: Uuid,
    /// Step properties, already resolved against job parameters and the
    /// partition plan.
    pub properties: Properties,
    job: Arc<JobContext>,
    transient: Mutex<Option<Value>>,
    persistent: Mutex<Option<Value>>,
    exit_status: Mutex<Option<String>>,
    batch_status: Mutex<BatchStatus>,
    metrics: Mutex<Metrics>,
    exception: Mutex<Option<String>>,
    stop: CancellationToken,
}

impl StepContext {
    pub fn new(
        job: Arc<JobContext>,
        step_name: &str,
        partition: Option<u32>,
        step_execution_id: Uuid,
        properties: Properties,
    ) -> Self {
        let stop = job.stop_token().child_token();
        Self {
            step_name: step_name.to_string(),
            partition,
            step_execution_id,
            properties,
            job,
            transient: Mutex::new(None),
            persistent: Mutex::new(None),
            exit_status: Mutex::new(None),
            batch_status: Mutex::new(BatchStatus::Starting),
            metrics: Mutex::new(Metrics::default()),
            exception: Mutex::new(None),
            stop,
        }
    }

    pub fn job(&self) -> &Arc<JobContext> {
        &self.job
    }

    /// Child of the job's stop token.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn transient_data(&self) -> Option<Value> {
        self.transient.lock().expect("step context lock poisoned").clone()
    }

    pub fn set_transient_data(&self, data: Option<Value>) {
        *self.transient.lock().expect("step context lock poisoned") = data;
    }

    /// Step-level user data, saved at every commit and at step end.
    pub fn persistent_data(&self) -> Option<Value> {
        self.persistent.lock().expect("step context lock poisoned").clone()
    }

    pub fn set_persistent_data(&self, data: Option<Value>) {
        *self.persistent.lock().expect("step context lock poisoned") = data;
    }

    pub fn exit_status(&self) -> Option<String> {
        self.exit_status.lock().expect("step context lock poisoned").clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        *self.exit_status.lock().expect("step context lock poisoned") = Some(exit_status.into());
    }

    pub fn batch_status(&self) -> BatchStatus {
        *self.batch_status.lock().expect("step context lock poisoned")
    }

    pub(crate) fn set_batch_status(&self, status: BatchStatus) {
        *self.batch_status.lock().expect("step context lock poisoned") = status;
    }

    /// Snapshot of the live metrics.
    pub fn metrics(&self) -> Metrics {
        *self.metrics.lock().expect("step context lock poisoned")
    }

    pub(crate) fn set_metrics(&self, metrics: Metrics) {
        *self.metrics.lock().expect("step context lock poisoned") = metrics;
    }

    /// Text of the last failure seen by this step, if any.
    pub fn exception(&self) -> Option<String> {
        self.exception.lock().expect("step context lock poisoned").clone()
    }

    pub(crate) fn set_exception(&self, message: impl Into<String>) {
        *self.exception.lock().expect("step context lock poisoned") = Some(message.into());
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step_name", &self.step_name)
            .field("partition", &self.partition)
            .field("step_execution_id", &self.step_execution_id)
            .finish_non_exhaustive()
    }
}
