//! Partition orchestrator.
//!
//! Fans one step definition out over N partitions. Each partition is its own
//! unit on the worker pool with its own StepExecution, StepContext, status
//! record and checkpoint key; partitions never share mutable state. Their
//! results flow back over a channel to a single consumer that drives the
//! analyzer, so analyzer calls are serialized in completion order.

use std::sync::Arc;

use batchline_types::definition::{ArtifactRef, PartitionDefinition, StepDefinition};
use batchline_types::partition::PartitionPlan;
use batchline_types::status::BatchStatus;
use batchline_types::step::{Metrics, StepExecution, StepStatus};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};

use super::context::{JobContext, StepContext};
use super::properties::PropertyResolver;
use super::step::{BodyOutcome, StepError};
use super::{Engine, artifact_context};
use crate::artifact::{
    ArtifactError, ItemError, Listeners, PartitionAnalyzer, PartitionReducer, PartitionStatus,
};
use crate::repository::JobRepository;
use crate::runtime::WorkerError;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition mapper failed: {0}")]
    Mapper(ItemError),

    #[error("partition plan has no partitions")]
    EmptyPlan,

    #[error("partition collector failed: {0}")]
    Collector(ItemError),

    #[error("partition analyzer failed: {0}")]
    Analyzer(ItemError),

    #[error("partition reducer failed: {0}")]
    Reducer(ItemError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("partition {index}: {source}")]
    Partition { index: u32, source: StepError },
}

/// What one partition reports back to the orchestrator.
#[derive(Debug, Clone)]
struct PartitionReport {
    index: u32,
    batch_status: BatchStatus,
    exit_status: String,
    metrics: Metrics,
    collector_data: Option<Value>,
}

fn analyze(
    analyzer: &mut dyn PartitionAnalyzer,
    data: Option<&Value>,
    batch_status: BatchStatus,
    exit_status: &str,
) -> Result<(), PartitionError> {
    if let Some(data) = data {
        analyzer
            .analyze_collector_data(data)
            .map_err(PartitionError::Analyzer)?;
    }
    analyzer
        .analyze_status(batch_status, exit_status)
        .map_err(PartitionError::Analyzer)
}

impl<R: JobRepository> Engine<R> {
    /// Run a partitioned step. `status` is the step's top-level status
    /// record; the persisted plan size lives there.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_partitioned(
        &self,
        step: &StepDefinition,
        partition: &PartitionDefinition,
        ctx: &StepContext,
        listeners: &Listeners,
        execution: &mut StepExecution,
        status: &mut StepStatus,
        resolver: &PropertyResolver,
    ) -> Result<BodyOutcome, StepError> {
        let job = ctx.job();
        let load = |r: &ArtifactRef| artifact_context(r, job, Some(step.id.as_str()), None, resolver);

        let callbacks = (|| -> Result<_, PartitionError> {
            let mapper = partition
                .mapper
                .as_ref()
                .map(|r| self.artifacts.load_mapper(&load(r)))
                .transpose()?;
            let analyzer = partition
                .analyzer
                .as_ref()
                .map(|r| self.artifacts.load_analyzer(&load(r)))
                .transpose()?;
            let reducer = partition
                .reducer
                .as_ref()
                .map(|r| self.artifacts.load_reducer(&load(r)))
                .transpose()?;
            let plan = match (&partition.plan, &mapper) {
                (Some(plan), _) => plan.clone(),
                (None, Some(mapper)) => mapper.map_partitions().map_err(PartitionError::Mapper)?,
                (None, None) => return Err(PartitionError::EmptyPlan),
            };
            if plan.partitions < 1 {
                return Err(PartitionError::EmptyPlan);
            }
            Ok((plan, analyzer, reducer))
        })();
        let (mut plan, mut analyzer, mut reducer) = match callbacks {
            Ok(callbacks) => callbacks,
            Err(e) => return Ok(BodyOutcome::failed(e.to_string())),
        };

        self.settle_plan(&mut plan, status).await?;

        tracing::info!(
            step = %step.id,
            partitions = plan.partitions,
            threads = plan.effective_threads(),
            "partitioned step started"
        );

        let mut failures: Vec<PartitionError> = Vec::new();

        if let Some(reducer) = reducer.as_mut() {
            if let Err(e) = reducer.begin_partitioned_step() {
                failures.push(PartitionError::Reducer(e));
                finish_reducer(reducer.as_mut(), BatchStatus::Failed, &mut failures);
                return Ok(outcome(BatchStatus::Failed, &failures));
            }
        }

        // Partitions that completed in an earlier execution are not re-run;
        // the analyzer still sees what they reported.
        let mut pending = Vec::new();
        let mut analyzer_error = None;
        for index in 0..plan.partitions {
            let previous = self
                .repo
                .get_step_status(job.instance_id, &step.id, Some(index))
                .await?;
            match previous {
                Some(previous) if previous.batch_status == BatchStatus::Completed => {
                    tracing::debug!(step = %step.id, partition = index, "partition already completed");
                    if let Some(analyzer) = analyzer.as_mut().filter(|_| analyzer_error.is_none()) {
                        analyzer_error = analyze(
                            analyzer.as_mut(),
                            previous.collector_data.as_ref(),
                            previous.batch_status,
                            &previous.exit_status,
                        )
                        .err();
                    }
                }
                _ => pending.push(index),
            }
        }

        let partition_listeners = Listeners {
            step: Vec::new(),
            ..listeners.clone()
        };
        let threads = Arc::new(Semaphore::new(plan.effective_threads() as usize));
        let (reports, mut inbox) = mpsc::unbounded_channel::<PartitionReport>();

        let handles: Vec<_> = pending
            .iter()
            .map(|&index| {
                let engine = self.clone();
                let step = step.clone();
                let collector = partition.collector.clone();
                let job = Arc::clone(job);
                let listeners = partition_listeners.clone();
                let resolver = resolver.for_partition(plan.properties_for(index));
                let threads = Arc::clone(&threads);
                let reports = reports.clone();
                self.pool.submit(format!("{}#{index}", step.id), async move {
                    let _slot = threads.acquire_owned().await.ok();
                    engine
                        .run_partition(
                            &step,
                            collector.as_ref(),
                            index,
                            &job,
                            &listeners,
                            &resolver,
                            &reports,
                        )
                        .await
                })
            })
            .collect();
        drop(reports);

        let consume = async {
            while let Some(report) = inbox.recv().await {
                if let Some(analyzer) = analyzer.as_mut().filter(|_| analyzer_error.is_none()) {
                    analyzer_error = analyze(
                        analyzer.as_mut(),
                        report.collector_data.as_ref(),
                        report.batch_status,
                        &report.exit_status,
                    )
                    .err();
                }
            }
        };
        let (results, ()) = tokio::join!(self.pool.await_all(handles), consume);

        let mut any_failed = false;
        let mut any_stopped = false;
        for (index, result) in pending.iter().zip(results) {
            match result {
                Ok(Ok(report)) => {
                    execution.metrics.merge(&report.metrics);
                    match report.batch_status {
                        BatchStatus::Failed => any_failed = true,
                        BatchStatus::Stopped => any_stopped = true,
                        _ => {}
                    }
                }
                Ok(Err(source)) => {
                    any_failed = true;
                    failures.push(PartitionError::Partition {
                        index: *index,
                        source,
                    });
                }
                Err(worker) => {
                    any_failed = true;
                    failures.push(PartitionError::Worker(worker));
                }
            }
        }
        ctx.set_metrics(execution.metrics);

        if let Some(e) = analyzer_error {
            any_failed = true;
            failures.push(e);
        }

        let mut batch_status = if any_failed {
            BatchStatus::Failed
        } else if any_stopped {
            BatchStatus::Stopped
        } else {
            BatchStatus::Completed
        };
        if let Some(reducer) = reducer.as_mut() {
            batch_status = finish_reducer(reducer.as_mut(), batch_status, &mut failures);
        }

        tracing::info!(
            step = %step.id,
            status = %batch_status,
            ran = pending.len(),
            "partitioned step finished"
        );
        Ok(outcome(batch_status, &failures))
    }

    /// Decide the partition count for this execution and persist it.
    async fn settle_plan(
        &self,
        plan: &mut PartitionPlan,
        status: &mut StepStatus,
    ) -> Result<(), StepError> {
        match status.plan_size {
            Some(_) if plan.override_on_restart => {
                tracing::info!(step = %status.step_name, "discarding prior partition state");
                self.repo
                    .delete_step_statuses(status.instance_id, &status.step_name)
                    .await?;
                self.repo
                    .delete_checkpoints(status.instance_id, &status.step_name)
                    .await?;
            }
            Some(size) => plan.partitions = size,
            None => {}
        }
        status.plan_size = Some(plan.partitions);
        self.repo.put_step_status(status).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_partition(
        &self,
        step: &StepDefinition,
        collector: Option<&ArtifactRef>,
        index: u32,
        job: &Arc<JobContext>,
        listeners: &Listeners,
        resolver: &PropertyResolver,
        reports: &mpsc::UnboundedSender<PartitionReport>,
    ) -> Result<PartitionReport, StepError> {
        let mut status = self
            .repo
            .get_step_status(job.instance_id, &step.id, Some(index))
            .await?
            .unwrap_or_else(|| StepStatus::new(job.instance_id, &step.id, Some(index)));
        status.start_count += 1;

        let mut execution = StepExecution::new(job.execution_id, &step.id, Some(index));
        execution.batch_status = BatchStatus::Started;
        execution.exit_status = BatchStatus::Started.to_string();
        execution.start_time = Some(Utc::now());
        execution.persistent_user_data = status.persistent_user_data.clone();
        self.repo.create_step_execution(&execution).await?;

        status.batch_status = BatchStatus::Started;
        status.exit_status = execution.exit_status.clone();
        status.last_step_execution_id = Some(execution.step_execution_id);
        self.repo.put_step_status(&status).await?;

        let ctx = StepContext::new(
            Arc::clone(job),
            &step.id,
            Some(index),
            execution.step_execution_id,
            resolver.resolve_all(&step.properties),
        );
        ctx.set_persistent_data(status.persistent_user_data.clone());
        ctx.set_batch_status(BatchStatus::Started);
        tracing::debug!(step = %step.id, partition = index, "partition started");

        let body = self
            .run_body(&step.task, &ctx, listeners, &mut execution, resolver)
            .await;
        let mut batch_status = body.batch_status;
        ctx.set_batch_status(batch_status);

        let collected = collector.map(|r| {
            self.artifacts
                .load_collector(&artifact_context(r, job, Some(step.id.as_str()), Some(index), resolver))
                .map_err(PartitionError::from)
                .and_then(|mut c| {
                    c.collect_partition_data(&ctx)
                        .map_err(PartitionError::Collector)
                })
        });
        let collector_data = match collected {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                tracing::warn!(step = %step.id, partition = index, error = %e, "collector failed");
                batch_status = BatchStatus::Failed;
                ctx.set_batch_status(batch_status);
                ctx.set_exception(e.to_string());
                None
            }
            None => None,
        };
        if let Some(failure) = &body.failure {
            ctx.set_exception(failure.clone());
        }

        let exit_status = ctx
            .exit_status()
            .or(body.exit_status)
            .unwrap_or_else(|| batch_status.to_string());

        execution.batch_status = batch_status;
        execution.exit_status = exit_status.clone();
        execution.end_time = Some(Utc::now());
        execution.persistent_user_data = ctx.persistent_data();
        self.repo.update_step_execution(&execution).await?;

        status.batch_status = batch_status;
        status.exit_status = exit_status.clone();
        status.persistent_user_data = execution.persistent_user_data.clone();
        status.collector_data = collector_data.clone();
        self.repo.put_step_status(&status).await?;

        tracing::debug!(
            step = %step.id,
            partition = index,
            status = %batch_status,
            "partition finished"
        );

        let report = PartitionReport {
            index,
            batch_status,
            exit_status,
            metrics: execution.metrics,
            collector_data,
        };
        if reports.send(report.clone()).is_err() {
            tracing::debug!(partition = report.index, "analyzer channel already closed");
        }
        Ok(report)
    }
}

/// Reducer end-of-step hooks. Rollback runs exactly once when the step did
/// not complete; the after hook always runs.
fn finish_reducer(
    reducer: &mut dyn PartitionReducer,
    mut batch_status: BatchStatus,
    failures: &mut Vec<PartitionError>,
) -> BatchStatus {
    if batch_status == BatchStatus::Completed {
        if let Err(e) = reducer.before_partitioned_step_completion() {
            failures.push(PartitionError::Reducer(e));
            batch_status = BatchStatus::Failed;
        }
    }
    let partition_status = if batch_status == BatchStatus::Completed {
        PartitionStatus::Commit
    } else {
        if let Err(e) = reducer.rollback_partitioned_step() {
            failures.push(PartitionError::Reducer(e));
        }
        PartitionStatus::Rollback
    };
    if let Err(e) = reducer.after_partitioned_step_completion(partition_status) {
        failures.push(PartitionError::Reducer(e));
        batch_status = BatchStatus::Failed;
    }
    batch_status
}

fn outcome(batch_status: BatchStatus, failures: &[PartitionError]) -> BodyOutcome {
    BodyOutcome {
        batch_status,
        exit_status: None,
        failure: (!failures.is_empty()).then(|| {
            failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use batchline_types::job::JobParameters;
    use serde_json::json;
    use uuid::Uuid;

    use crate::engine::StepOutcome;
    use crate::repository::InMemoryJobRepository;
    use crate::testkit::{self, Recorder, step};

    async fn run(
        engine: &Engine<InMemoryJobRepository>,
        def: &StepDefinition,
        instance: Uuid,
        params: JobParameters,
    ) -> StepOutcome {
        let job = testkit::job_context("parts", Some(instance), params);
        let resolver = PropertyResolver::new(job.parameters.clone(), Default::default());
        engine.run_step(def, &job, &resolver).await.unwrap()
    }

    const RANGES: &str = r##"
id: load
task:
  chunk:
    reader:
      name: seq
      properties:
        start: "#{partitionPlan['start']}"
        count: "5"
        fail_at: "#{jobParameters['fail_at']}"
    writer: { name: collect }
    checkpoint: { policy: item, item_count: 2 }
partition:
  plan:
    partitions: 3
    threads: 2
    properties:
      - { start: "0" }
      - { start: "5" }
      - { start: "10" }
  collector: { name: metrics }
  analyzer: { name: recording }
  reducer: { name: recording }
"##;

    #[tokio::test]
    async fn all_partitions_complete_and_metrics_roll_up() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let outcome = run(&engine, &step(RANGES), Uuid::now_v7(), JobParameters::new()).await;

        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        let execution = outcome.execution.unwrap();
        assert_eq!(execution.metrics.read_count, 15);
        assert_eq!(execution.metrics.write_count, 15);

        let mut written: Vec<u64> = recorder.written().iter().filter_map(Value::as_u64).collect();
        written.sort_unstable();
        assert_eq!(written, (0..15).collect::<Vec<_>>());

        assert_eq!(recorder.count("reducer:begin"), 1);
        assert_eq!(recorder.count("reducer:before_completion"), 1);
        assert_eq!(recorder.count("reducer:rollback"), 0);
        assert_eq!(recorder.count("reducer:after:Commit"), 1);
        assert_eq!(recorder.count("analyze:status:COMPLETED"), 3);
        for p in 0..3 {
            assert_eq!(recorder.count(&format!("analyze:data:{p}")), 1);
        }
    }

    #[tokio::test]
    async fn one_failed_partition_rolls_back_once_and_restart_reruns_only_it() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let def = step(RANGES);
        let instance = Uuid::now_v7();

        // Offset 7 lives in partition 1 (5..10).
        let outcome = run(&engine, &def, instance, testkit::params(&[("fail_at", "7")])).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        assert_eq!(recorder.count("reducer:rollback"), 1);
        assert_eq!(recorder.count("reducer:after:Rollback"), 1);
        assert_eq!(recorder.count("analyze:status:FAILED"), 1);

        for (p, expected) in [
            (0, BatchStatus::Completed),
            (1, BatchStatus::Failed),
            (2, BatchStatus::Completed),
        ] {
            let status = engine
                .repo
                .get_step_status(instance, "load", Some(p))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(status.batch_status, expected, "partition {p}");
        }

        let outcome = run(&engine, &def, instance, JobParameters::new()).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        // Only partition 1 reopened, at its committed offset.
        assert_eq!(recorder.opened().len(), 4);
        assert_eq!(recorder.opened()[3], Some(json!(7)));
        assert_eq!(recorder.count("analyze:status:COMPLETED"), 2 + 3);
        assert_eq!(outcome.execution.unwrap().metrics.read_count, 3);
    }

    #[tokio::test]
    async fn mapper_supplies_the_plan() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let def = step(
            r##"
id: mapped
task:
  chunk:
    reader: { name: seq, properties: { start: "#{partitionPlan['start']}", count: "#{partitionPlan['count']}" } }
    writer: { name: collect }
partition:
  mapper: { name: range, properties: { partitions: "4", size: "3" } }
"##,
        );
        let instance = Uuid::now_v7();
        let outcome = run(&engine, &def, instance, JobParameters::new()).await;
        assert_eq!(outcome.batch_status, BatchStatus::Completed);
        assert_eq!(recorder.written().len(), 12);

        let top = engine
            .repo
            .get_step_status(instance, "mapped", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(top.plan_size, Some(4));
    }

    #[tokio::test]
    async fn failing_batchlet_partition_fails_the_step_without_aborting_siblings() {
        let recorder = Recorder::new();
        let engine = testkit::engine(&recorder);
        let def = step(
            r##"
id: work
task: { batchlet: { name: exit, properties: { fail: "#{partitionPlan['fail']}" } } }
partition:
  plan:
    partitions: 3
    properties: [{}, { fail: "true" }, {}]
  reducer: { name: recording }
"##,
        );
        let outcome = run(&engine, &def, Uuid::now_v7(), JobParameters::new()).await;
        assert_eq!(outcome.batch_status, BatchStatus::Failed);
        for p in 0..3 {
            assert_eq!(recorder.count(&format!("run:work#{p}")), 1);
        }
        assert_eq!(recorder.count("reducer:rollback"), 1);
    }

    #[test]
    fn reducer_error_before_completion_rolls_back() {
        struct Refuses(Vec<String>);
        impl PartitionReducer for Refuses {
            fn before_partitioned_step_completion(&mut self) -> Result<(), ItemError> {
                Err(ItemError::new("reduce.Refused", "no"))
            }
            fn rollback_partitioned_step(&mut self) -> Result<(), ItemError> {
                self.0.push("rollback".to_string());
                Ok(())
            }
            fn after_partitioned_step_completion(&mut self, s: PartitionStatus) -> Result<(), ItemError> {
                self.0.push(format!("{s:?}"));
                Ok(())
            }
        }

        let mut reducer = Refuses(Vec::new());
        let mut failures = Vec::new();
        let status = finish_reducer(&mut reducer, BatchStatus::Completed, &mut failures);
        assert_eq!(status, BatchStatus::Failed);
        assert_eq!(reducer.0, vec!["rollback", "Rollback"]);
        assert_eq!(failures.len(), 1);
    }
}
