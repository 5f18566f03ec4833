//! Job operator: the engine's public surface.
//!
//! Starts, restarts, stops and abandons job executions, and answers read-only
//! queries over the repository. Each started execution runs as a coordinator
//! task on the worker pool; the operator keeps the execution's stop token and
//! a watch channel that delivers the final snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use batchline_types::config::EngineConfig;
use batchline_types::definition::JobDefinition;
use batchline_types::error::RepositoryError;
use batchline_types::job::{JobExecution, JobInstance, JobParameters};
use batchline_types::status::BatchStatus;
use batchline_types::step::StepExecution;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::artifact::ArtifactLoader;
use crate::engine::{DefinitionError, Engine, JobContext, PropertyResolver, validate_job};
use crate::repository::JobRepository;
use crate::runtime::{TransactionManager, WorkerPool};

// ---------------------------------------------------------------------------
// Definition source
// ---------------------------------------------------------------------------

/// Looks up job definitions by job name.
pub trait JobDefinitionSource: Send + Sync {
    fn load(&self, job_name: &str) -> Result<JobDefinition, DefinitionError>;
}

/// In-memory definitions registered up front.
#[derive(Debug, Default)]
pub struct DefinitionCatalog {
    jobs: HashMap<String, JobDefinition>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: JobDefinition) -> &mut Self {
        self.jobs.insert(def.id.clone(), def);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl JobDefinitionSource for DefinitionCatalog {
    fn load(&self, job_name: &str) -> Result<JobDefinition, DefinitionError> {
        self.jobs
            .get(job_name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownJob(job_name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("no job execution {0}")]
    NoSuchExecution(Uuid),

    #[error("no job instance {0}")]
    NoSuchInstance(Uuid),

    #[error("execution {execution_id} is not the most recent execution of instance {instance_id}")]
    NotMostRecent { execution_id: Uuid, instance_id: Uuid },

    #[error("job '{0}' is not restartable")]
    NotRestartable(String),

    #[error("job instance {0} already completed")]
    AlreadyCompleted(Uuid),

    #[error("job instance {0} was abandoned")]
    Abandoned(Uuid),

    #[error("execution {0} is still running")]
    StillRunning(Uuid),

    #[error("execution {0} is not running")]
    NotRunning(Uuid),
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

struct RunningExecution {
    job: Arc<JobContext>,
    done: watch::Receiver<Option<JobExecution>>,
}

pub struct JobOperator<R: JobRepository> {
    engine: Engine<R>,
    definitions: Arc<dyn JobDefinitionSource>,
    running: Arc<DashMap<Uuid, RunningExecution>>,
}

impl<R: JobRepository> JobOperator<R> {
    pub fn new(
        repo: Arc<R>,
        transactions: Arc<dyn TransactionManager>,
        pool: WorkerPool,
        artifacts: Arc<dyn ArtifactLoader>,
        definitions: Arc<dyn JobDefinitionSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine: Engine::new(repo, transactions, pool, artifacts, config),
            definitions,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine<R> {
        &self.engine
    }

    fn repo(&self) -> &R {
        self.engine.repository()
    }

    /// Start a new instance of `job_name`. Returns as soon as the execution
    /// is recorded; the job runs in the background.
    pub async fn start(
        &self,
        job_name: &str,
        parameters: JobParameters,
    ) -> Result<Uuid, OperatorError> {
        let def = self.definitions.load(job_name)?;
        validate_job(&def)?;

        let instance = self.repo().create_job_instance(&def.id).await?;
        let execution = JobExecution::new(&instance, parameters);
        self.repo().create_job_execution(&execution).await?;

        let execution_id = execution.execution_id;
        tracing::info!(job = %def.id, execution_id = %execution_id, "job submitted");
        self.launch(Arc::new(def), execution, None);
        Ok(execution_id)
    }

    /// Restart the instance whose most recent execution is `execution_id`.
    pub async fn restart(
        &self,
        execution_id: Uuid,
        parameters: JobParameters,
    ) -> Result<Uuid, OperatorError> {
        let mut previous = self.get_job_execution(execution_id).await?;
        let instance_id = previous.instance_id;

        let latest = self.repo().get_job_executions(instance_id).await?;
        if latest.last().map(|e| e.execution_id) != Some(execution_id) {
            return Err(OperatorError::NotMostRecent {
                execution_id,
                instance_id,
            });
        }

        let def = self.definitions.load(&previous.job_name)?;
        if !def.restartable {
            return Err(OperatorError::NotRestartable(def.id));
        }
        validate_job(&def)?;

        let mut status = self
            .repo()
            .get_job_status(instance_id)
            .await?
            .ok_or(OperatorError::NoSuchInstance(instance_id))?;

        match previous.batch_status {
            BatchStatus::Completed => return Err(OperatorError::AlreadyCompleted(instance_id)),
            BatchStatus::Abandoned => return Err(OperatorError::Abandoned(instance_id)),
            s if s.is_running() => {
                if self.running.contains_key(&execution_id) {
                    return Err(OperatorError::StillRunning(execution_id));
                }
                // Recorded as running but no controller owns it: the process
                // that ran it is gone.
                tracing::warn!(execution_id = %execution_id, status = %s, "marking orphaned execution FAILED");
                previous.batch_status = BatchStatus::Failed;
                previous.exit_status = BatchStatus::Failed.to_string();
                previous.end_time = Some(Utc::now());
                previous.last_updated = Utc::now();
                self.repo().update_job_execution(&previous).await?;
                status.batch_status = BatchStatus::Failed;
                status.exit_status = previous.exit_status.clone();
            }
            _ => {}
        }

        let instance = self
            .repo()
            .get_job_instance(instance_id)
            .await?
            .ok_or(OperatorError::NoSuchInstance(instance_id))?;
        let execution = JobExecution::new(&instance, parameters);
        self.repo().create_job_execution(&execution).await?;
        status.latest_execution_id = Some(execution.execution_id);
        self.repo().put_job_status(&status).await?;

        tracing::info!(
            job = %def.id,
            execution_id = %execution.execution_id,
            previous = %execution_id,
            restart_on = ?status.restart_on,
            "job restarted"
        );
        let restarted = execution.execution_id;
        self.launch(Arc::new(def), execution, status.restart_on);
        Ok(restarted)
    }

    fn launch(&self, def: Arc<JobDefinition>, execution: JobExecution, start_at: Option<String>) {
        let resolver = PropertyResolver::new(execution.parameters.clone(), def.properties.clone());
        let job = Arc::new(JobContext::new(
            &def.id,
            execution.instance_id,
            execution.execution_id,
            resolver.resolve_all(&def.properties),
            execution.parameters.clone(),
        ));

        let execution_id = execution.execution_id;
        let (done, watcher) = watch::channel(None);
        self.running.insert(
            execution_id,
            RunningExecution {
                job: Arc::clone(&job),
                done: watcher,
            },
        );

        let engine = self.engine.clone();
        let running = Arc::clone(&self.running);
        // Detached: the watch channel and the repository carry the result.
        let _ = self
            .engine
            .pool()
            .spawn_coordinator(format!("job:{execution_id}"), async move {
                let finished = engine.run_job(def, execution, job, start_at).await;
                running.remove(&execution_id);
                done.send_replace(Some(finished));
            });
    }

    /// Ask a running execution to stop. The controller records `STOPPING`
    /// and resolves to `STOPPED` once the active work has wound down.
    pub async fn stop(&self, execution_id: Uuid) -> Result<(), OperatorError> {
        let job = self.running.get(&execution_id).map(|r| Arc::clone(&r.job));
        if let Some(job) = job {
            tracing::info!(execution_id = %execution_id, "stop requested");
            job.stop_token().cancel();
            return Ok(());
        }

        let mut execution = self.get_job_execution(execution_id).await?;
        if !execution.batch_status.is_running() {
            return Err(OperatorError::NotRunning(execution_id));
        }
        tracing::warn!(execution_id = %execution_id, "stopping an execution with no live controller");
        execution.batch_status = BatchStatus::Stopped;
        execution.exit_status = BatchStatus::Stopped.to_string();
        execution.end_time = Some(Utc::now());
        execution.last_updated = Utc::now();
        self.repo().update_job_execution(&execution).await?;
        if let Some(mut status) = self.repo().get_job_status(execution.instance_id).await? {
            status.batch_status = BatchStatus::Stopped;
            status.exit_status = execution.exit_status.clone();
            self.repo().put_job_status(&status).await?;
        }
        Ok(())
    }

    /// Mark a finished execution `ABANDONED`; its instance can no longer be restarted.
    pub async fn abandon(&self, execution_id: Uuid) -> Result<(), OperatorError> {
        let mut execution = self.get_job_execution(execution_id).await?;
        if self.running.contains_key(&execution_id) || execution.batch_status.is_running() {
            return Err(OperatorError::StillRunning(execution_id));
        }
        if !execution.batch_status.can_transition_to(BatchStatus::Abandoned) {
            return Err(OperatorError::Abandoned(execution.instance_id));
        }

        execution.batch_status = BatchStatus::Abandoned;
        execution.last_updated = Utc::now();
        self.repo().update_job_execution(&execution).await?;

        if let Some(mut status) = self.repo().get_job_status(execution.instance_id).await? {
            if status.latest_execution_id == Some(execution_id) {
                status.batch_status = BatchStatus::Abandoned;
                self.repo().put_job_status(&status).await?;
            }
        }
        tracing::info!(execution_id = %execution_id, "execution abandoned");
        Ok(())
    }

    /// Wait for an execution to reach its terminal status.
    pub async fn wait_for(&self, execution_id: Uuid) -> Result<JobExecution, OperatorError> {
        let watcher = self.running.get(&execution_id).map(|r| r.done.clone());
        if let Some(mut watcher) = watcher {
            if let Ok(finished) = watcher.wait_for(Option::is_some).await {
                if let Some(execution) = finished.clone() {
                    return Ok(execution);
                }
            }
        }
        self.get_job_execution(execution_id).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_job_execution(&self, execution_id: Uuid) -> Result<JobExecution, OperatorError> {
        self.repo()
            .get_job_execution(execution_id)
            .await?
            .ok_or(OperatorError::NoSuchExecution(execution_id))
    }

    /// Top-level step executions of one job execution, in start order.
    pub async fn get_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, OperatorError> {
        let steps = self.repo().get_step_executions(execution_id).await?;
        Ok(steps.into_iter().filter(|s| s.partition.is_none()).collect())
    }

    /// The instance an execution belongs to.
    pub async fn get_job_instance(&self, execution_id: Uuid) -> Result<JobInstance, OperatorError> {
        let execution = self.get_job_execution(execution_id).await?;
        self.repo()
            .get_job_instance(execution.instance_id)
            .await?
            .ok_or(OperatorError::NoSuchInstance(execution.instance_id))
    }

    pub async fn get_job_names(&self) -> Result<Vec<String>, OperatorError> {
        Ok(self.repo().get_job_names().await?)
    }

    pub async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, OperatorError> {
        Ok(self.repo().get_job_instances(job_name, start, count).await?)
    }

    pub async fn get_job_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<JobExecution>, OperatorError> {
        Ok(self.repo().get_job_executions(instance_id).await?)
    }

    pub async fn get_running_executions(&self, job_name: &str) -> Result<Vec<Uuid>, OperatorError> {
        let executions = self.repo().get_running_executions(job_name).await?;
        Ok(executions.into_iter().map(|e| e.execution_id).collect())
    }
}
