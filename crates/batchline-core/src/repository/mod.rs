//! Job repository trait (port).
//!
//! Defines the storage interface for job instances, executions, step
//! executions, status lineage and checkpoints. The infrastructure layer
//! (batchline-infra) implements it with SQLite; [`memory::InMemoryJobRepository`]
//! keeps everything in process.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

pub mod memory;

use std::future::Future;

use batchline_types::checkpoint::{CheckpointKey, CheckpointRecord};
use batchline_types::error::RepositoryError;
use batchline_types::job::{JobExecution, JobInstance, JobStatus};
use batchline_types::step::{StepExecution, StepStatus};
use uuid::Uuid;

pub use memory::InMemoryJobRepository;

pub trait JobRepository: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a new instance of `job_name`.
    fn create_job_instance(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<JobInstance, RepositoryError>> + Send;

    fn get_job_instance(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<Option<JobInstance>, RepositoryError>> + Send;

    /// Distinct job names with at least one instance, sorted.
    fn get_job_names(&self) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Instances of `job_name`, most recent first, paged by `start`/`count`.
    fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> impl Future<Output = Result<Vec<JobInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    fn create_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn update_job_execution(
        &self,
        execution: &JobExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job_execution(
        &self,
        execution_id: Uuid,
    ) -> impl Future<Output = Result<Option<JobExecution>, RepositoryError>> + Send;

    /// Executions of one instance, oldest first.
    fn get_job_executions(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<Vec<JobExecution>, RepositoryError>> + Send;

    /// Executions of `job_name` whose batch status is still running.
    fn get_running_executions(
        &self,
        job_name: &str,
    ) -> impl Future<Output = Result<Vec<JobExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Status lineage
    // -----------------------------------------------------------------------

    fn get_job_status(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<Option<JobStatus>, RepositoryError>> + Send;

    fn put_job_status(
        &self,
        status: &JobStatus,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step_status(
        &self,
        instance_id: Uuid,
        step_name: &str,
        partition: Option<u32>,
    ) -> impl Future<Output = Result<Option<StepStatus>, RepositoryError>> + Send;

    fn put_step_status(
        &self,
        status: &StepStatus,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove every partition-level status of a step (the top-level record stays).
    fn delete_step_statuses(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    fn create_step_execution(
        &self,
        execution: &StepExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn update_step_execution(
        &self,
        execution: &StepExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn get_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> impl Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;

    /// Step executions (top-level and partition) of one job execution, in creation order.
    fn get_step_executions(
        &self,
        execution_id: Uuid,
    ) -> impl Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, RepositoryError>> + Send;

    /// Insert or overwrite the record for `record.key`.
    fn put_checkpoint(
        &self,
        record: &CheckpointRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    fn delete_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove every checkpoint of a step, partitioned or not.
    fn delete_checkpoints(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}
