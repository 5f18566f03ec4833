//! Step execution records and metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::BatchStatus;

/// Item-level counters for one step execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub filter_count: u64,
}

impl Metrics {
    /// Add another set of counters into this one (partition roll-up).
    pub fn merge(&mut self, other: &Metrics) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.filter_count += other.filter_count;
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

/// One attempt to run one step (or one partition of a step) within a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_execution_id: Uuid,
    pub execution_id: Uuid,
    pub step_name: String,
    /// Partition index, `None` for the top-level step execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    pub batch_status: BatchStatus,
    pub exit_status: String,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(execution_id: Uuid, step_name: &str, partition: Option<u32>) -> Self {
        Self {
            step_execution_id: Uuid::now_v7(),
            execution_id,
            step_name: step_name.to_string(),
            partition,
            batch_status: BatchStatus::Starting,
            exit_status: BatchStatus::Starting.to_string(),
            metrics: Metrics::default(),
            persistent_user_data: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Lineage record for a step name within a job instance, keyed by
/// `(instance_id, step_name, partition)`. Survives across executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub instance_id: Uuid,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    pub batch_status: BatchStatus,
    pub exit_status: String,
    /// How many times this step has been started across all executions.
    #[serde(default)]
    pub start_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<serde_json::Value>,
    /// Number of partitions in the plan used by the last attempt (top-level only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_size: Option<u32>,
    /// Data the collector produced for this partition (partition records only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_data: Option<serde_json::Value>,
}

impl StepStatus {
    pub fn new(instance_id: Uuid, step_name: &str, partition: Option<u32>) -> Self {
        Self {
            instance_id,
            step_name: step_name.to_string(),
            partition,
            batch_status: BatchStatus::Starting,
            exit_status: BatchStatus::Starting.to_string(),
            start_count: 0,
            last_step_execution_id: None,
            persistent_user_data: None,
            plan_size: None,
            collector_data: None,
        }
    }
}
