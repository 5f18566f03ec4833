//! Step engine: runs exactly one step execution.
//!
//! Decides whether the step runs at all (already completed, start limit),
//! creates the StepExecution, fires step listeners around the body and
//! persists the step's status lineage afterwards. The body is a batchlet or a
//! chunk loop, run on a pool worker, or (for partitioned steps) the partition
//! orchestrator, which submits each partition itself.

use std::future::Future;
use std::sync::Arc;

use batchline_types::definition::{ArtifactRef, StepDefinition, StepTask};
use batchline_types::error::RepositoryError;
use batchline_types::status::BatchStatus;
use batchline_types::step::{StepExecution, StepStatus};
use chrono::Utc;
use thiserror::Error;

use super::context::{JobContext, StepContext};
use super::properties::PropertyResolver;
use super::{Engine, artifact_context};
use crate::artifact::{ArtifactError, Listeners};
use crate::repository::JobRepository;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// How one step ended, as seen by the flow walker.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: String,
    /// The execution that ran, or the reused prior one for a skipped step.
    pub execution: Option<StepExecution>,
    /// The step had already completed and was not run again.
    pub skipped: bool,
}

/// Result of a step body (batchlet, chunk loop or one partition of either).
#[derive(Debug)]
pub(crate) struct BodyOutcome {
    pub batch_status: BatchStatus,
    /// Exit status returned by a batchlet.
    pub exit_status: Option<String>,
    pub failure: Option<String>,
}

impl BodyOutcome {
    pub(crate) fn failed(failure: impl Into<String>) -> Self {
        Self {
            batch_status: BatchStatus::Failed,
            exit_status: None,
            failure: Some(failure.into()),
        }
    }
}

impl<R: JobRepository> Engine<R> {
    pub async fn run_step(
        &self,
        step: &StepDefinition,
        job: &Arc<JobContext>,
        resolver: &PropertyResolver,
    ) -> Result<StepOutcome, StepError> {
        let mut status = self
            .repo
            .get_step_status(job.instance_id, &step.id, None)
            .await?
            .unwrap_or_else(|| StepStatus::new(job.instance_id, &step.id, None));

        if status.batch_status == BatchStatus::Completed {
            if !step.allow_start_if_complete {
                let prior = match status.last_step_execution_id {
                    Some(id) => self.repo.get_step_execution(id).await?,
                    None => None,
                };
                tracing::info!(
                    step = %step.id,
                    exit_status = %status.exit_status,
                    "step already completed, not run again"
                );
                return Ok(StepOutcome {
                    step_name: step.id.clone(),
                    batch_status: BatchStatus::Completed,
                    exit_status: status.exit_status,
                    execution: prior,
                    skipped: true,
                });
            }
            // A fresh run of a completed step starts from nothing.
            self.repo.delete_checkpoints(job.instance_id, &step.id).await?;
            self.repo.delete_step_statuses(job.instance_id, &step.id).await?;
            status.plan_size = None;
        }

        if step.start_limit > 0 && status.start_count >= step.start_limit {
            tracing::warn!(
                step = %step.id,
                start_limit = step.start_limit,
                "start limit reached"
            );
            let now = Utc::now();
            let mut execution = StepExecution::new(job.execution_id, &step.id, None);
            execution.batch_status = BatchStatus::Failed;
            execution.exit_status = BatchStatus::Failed.to_string();
            execution.start_time = Some(now);
            execution.end_time = Some(now);
            self.repo.create_step_execution(&execution).await?;

            status.batch_status = BatchStatus::Failed;
            status.exit_status = execution.exit_status.clone();
            status.last_step_execution_id = Some(execution.step_execution_id);
            self.repo.put_step_status(&status).await?;
            return Ok(StepOutcome {
                step_name: step.id.clone(),
                batch_status: BatchStatus::Failed,
                exit_status: execution.exit_status.clone(),
                execution: Some(execution),
                skipped: false,
            });
        }

        status.start_count += 1;
        let mut execution = StepExecution::new(job.execution_id, &step.id, None);
        execution.batch_status = BatchStatus::Started;
        execution.exit_status = BatchStatus::Started.to_string();
        execution.start_time = Some(Utc::now());
        execution.persistent_user_data = status.persistent_user_data.clone();
        self.repo.create_step_execution(&execution).await?;

        status.batch_status = BatchStatus::Started;
        status.exit_status = execution.exit_status.clone();
        status.last_step_execution_id = Some(execution.step_execution_id);
        self.repo.put_step_status(&status).await?;

        tracing::info!(
            job = %job.job_name,
            step = %step.id,
            step_execution_id = %execution.step_execution_id,
            start_count = status.start_count,
            "step started"
        );

        let ctx = Arc::new(StepContext::new(
            Arc::clone(job),
            &step.id,
            None,
            execution.step_execution_id,
            resolver.resolve_all(&step.properties),
        ));
        ctx.set_persistent_data(status.persistent_user_data.clone());
        ctx.set_batch_status(BatchStatus::Started);

        let (body, listeners) = match self.load_listeners(&step.listeners, job, &step.id, None, resolver) {
            Ok(listeners) => {
                for listener in &listeners.step {
                    listener.before_step(&ctx);
                }
                let snapshot = execution.clone();
                let run = async {
                    match &step.partition {
                        Some(partition) => {
                            self.run_partitioned(
                                step,
                                partition,
                                &ctx,
                                &listeners,
                                &mut execution,
                                &mut status,
                                resolver,
                            )
                            .await
                        }
                        None => Ok(self
                            .submit_body(step, &ctx, &listeners, &mut execution, resolver)
                            .await),
                    }
                };
                let body = self.watch_stop(run, &ctx, snapshot).await?;
                (body, listeners)
            }
            Err(e) => (BodyOutcome::failed(e.to_string()), Listeners::default()),
        };

        if let Some(failure) = &body.failure {
            ctx.set_exception(failure.clone());
        }
        ctx.set_batch_status(body.batch_status);
        for listener in &listeners.step {
            listener.after_step(&ctx);
        }

        let exit_status = ctx
            .exit_status()
            .or(body.exit_status)
            .unwrap_or_else(|| body.batch_status.to_string());

        execution.batch_status = body.batch_status;
        execution.exit_status = exit_status.clone();
        execution.end_time = Some(Utc::now());
        execution.persistent_user_data = ctx.persistent_data();
        self.repo.update_step_execution(&execution).await?;

        status.batch_status = body.batch_status;
        status.exit_status = exit_status.clone();
        status.persistent_user_data = execution.persistent_user_data.clone();
        self.repo.put_step_status(&status).await?;

        match &body.failure {
            Some(failure) => tracing::warn!(
                step = %step.id,
                status = %body.batch_status,
                exit_status = %exit_status,
                failure = %failure,
                "step finished"
            ),
            None => tracing::info!(
                step = %step.id,
                status = %body.batch_status,
                exit_status = %exit_status,
                "step finished"
            ),
        }

        Ok(StepOutcome {
            step_name: step.id.clone(),
            batch_status: body.batch_status,
            exit_status,
            execution: Some(execution),
            skipped: false,
        })
    }

    /// Run the body of a non-partitioned step on a pool worker and wait for it.
    async fn submit_body(
        &self,
        step: &StepDefinition,
        ctx: &Arc<StepContext>,
        listeners: &Listeners,
        execution: &mut StepExecution,
        resolver: &PropertyResolver,
    ) -> BodyOutcome {
        let engine = self.clone();
        let task = step.task.clone();
        let body_ctx = Arc::clone(ctx);
        let listeners = listeners.clone();
        let resolver = resolver.clone();
        let mut owned = execution.clone();
        let handle = self.pool.submit(step.id.clone(), async move {
            let body = engine
                .run_body(&task, &body_ctx, &listeners, &mut owned, &resolver)
                .await;
            (body, owned)
        });
        match handle.join().await {
            Ok((body, ran)) => {
                *execution = ran;
                body
            }
            Err(e) => {
                tracing::warn!(step = %step.id, error = %e, "step body did not finish");
                BodyOutcome::failed(e.to_string())
            }
        }
    }

    /// Drive `body` to completion. A stop request seen first marks the step
    /// execution `STOPPING` while the body winds down.
    pub(crate) async fn watch_stop<F: Future>(
        &self,
        body: F,
        ctx: &StepContext,
        mut snapshot: StepExecution,
    ) -> F::Output {
        tokio::pin!(body);
        let finished = tokio::select! {
            biased;
            output = &mut body => Some(output),
            _ = ctx.stop_token().cancelled() => None,
        };
        if let Some(output) = finished {
            return output;
        }

        ctx.set_batch_status(BatchStatus::Stopping);
        snapshot.batch_status = BatchStatus::Stopping;
        snapshot.exit_status = BatchStatus::Stopping.to_string();
        if let Err(e) = self.repo.update_step_execution(&snapshot).await {
            tracing::warn!(step = %ctx.step_name, error = %e, "could not record stopping step");
        }
        tracing::info!(
            step = %ctx.step_name,
            step_execution_id = %snapshot.step_execution_id,
            "step stopping"
        );
        body.await
    }

    /// Run a batchlet or chunk body against one step context.
    pub(crate) async fn run_body(
        &self,
        task: &StepTask,
        ctx: &StepContext,
        listeners: &Listeners,
        execution: &mut StepExecution,
        resolver: &PropertyResolver,
    ) -> BodyOutcome {
        match task {
            StepTask::Batchlet(artifact) => self.run_batchlet(artifact, ctx, resolver).await,
            StepTask::Chunk(chunk) => {
                let outcome = self.run_chunk(chunk, ctx, listeners, execution, resolver).await;
                BodyOutcome {
                    batch_status: outcome.batch_status,
                    exit_status: None,
                    failure: outcome.failure.map(|e| e.to_string()),
                }
            }
        }
    }

    async fn run_batchlet(
        &self,
        artifact: &ArtifactRef,
        ctx: &StepContext,
        resolver: &PropertyResolver,
    ) -> BodyOutcome {
        let loaded = self.artifacts.load_batchlet(&artifact_context(
            artifact,
            ctx.job(),
            Some(ctx.step_name.as_str()),
            ctx.partition,
            resolver,
        ));
        let batchlet = match loaded {
            Ok(batchlet) => batchlet,
            Err(e) => return BodyOutcome::failed(e.to_string()),
        };

        let process = batchlet.process(ctx);
        tokio::pin!(process);
        let finished = tokio::select! {
            biased;
            _ = ctx.stop_token().cancelled() => None,
            result = &mut process => Some(result),
        };
        let result = match finished {
            Some(result) => result,
            None => {
                tracing::info!(
                    step = %ctx.step_name,
                    partition = ?ctx.partition,
                    "stop requested, signalling batchlet"
                );
                batchlet.stop();
                process.await
            }
        };

        match result {
            Ok(exit_status) => BodyOutcome {
                batch_status: if ctx.is_stop_requested() {
                    BatchStatus::Stopped
                } else {
                    BatchStatus::Completed
                },
                exit_status,
                failure: None,
            },
            Err(e) => BodyOutcome::failed(e.to_string()),
        }
    }

    /// Load every declared listener, in declaration order.
    pub(crate) fn load_listeners(
        &self,
        refs: &[ArtifactRef],
        job: &Arc<JobContext>,
        step_name: &str,
        partition: Option<u32>,
        resolver: &PropertyResolver,
    ) -> Result<Listeners, ArtifactError> {
        let mut listeners = Listeners::default();
        for listener in refs {
            let ctx = artifact_context(listener, job, Some(step_name), partition, resolver);
            listeners.extend(self.artifacts.load_step_listeners(&ctx)?);
        }
        Ok(listeners)
    }
}
