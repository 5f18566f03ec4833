//! Partition callbacks: mapper, collector, analyzer, reducer.

use batchline_types::partition::PartitionPlan;
use batchline_types::status::BatchStatus;
use serde_json::Value;

use super::ItemError;
use crate::engine::context::StepContext;

/// Computes the partition plan at step start.
pub trait PartitionMapper: Send + Sync {
    fn map_partitions(&self) -> Result<PartitionPlan, ItemError>;
}

/// Runs on the partition's side once the partition ends, summarising it.
/// One instance per partition.
pub trait PartitionCollector: Send {
    fn collect_partition_data(&mut self, ctx: &StepContext) -> Result<Option<Value>, ItemError>;
}

/// Consumes collector output on the orchestrator side.
///
/// Calls are serialized: one partition's data and status are analyzed before
/// the next partition's.
pub trait PartitionAnalyzer: Send {
    fn analyze_collector_data(&mut self, _data: &Value) -> Result<(), ItemError> {
        Ok(())
    }

    fn analyze_status(
        &mut self,
        _batch_status: BatchStatus,
        _exit_status: &str,
    ) -> Result<(), ItemError> {
        Ok(())
    }
}

/// How the partitioned step as a whole ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Commit,
    Rollback,
}

/// Step-wide hooks around a partitioned step.
pub trait PartitionReducer: Send {
    fn begin_partitioned_step(&mut self) -> Result<(), ItemError> {
        Ok(())
    }

    /// Every partition completed.
    fn before_partitioned_step_completion(&mut self) -> Result<(), ItemError> {
        Ok(())
    }

    /// At least one partition did not complete.
    fn rollback_partitioned_step(&mut self) -> Result<(), ItemError> {
        Ok(())
    }

    fn after_partitioned_step_completion(&mut self, _status: PartitionStatus) -> Result<(), ItemError> {
        Ok(())
    }
}
