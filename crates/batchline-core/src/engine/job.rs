//! Job controller: owns one JobExecution from `STARTED` to its terminal status.

use std::sync::Arc;

use batchline_types::definition::JobDefinition;
use batchline_types::job::{JobExecution, JobStatus};
use batchline_types::status::BatchStatus;
use chrono::Utc;

use super::context::JobContext;
use super::flow::{ScopeOutcome, Terminal, TerminalKind};
use super::properties::PropertyResolver;
use super::{Engine, EngineError, artifact_context};
use crate::artifact::{ArtifactError, JobListener};
use crate::repository::JobRepository;

impl<R: JobRepository> Engine<R> {
    /// Drive `execution` to a terminal status and return its final snapshot.
    /// `start_at` is the restart target recorded by a previous `stop` rule.
    pub(crate) async fn run_job(
        &self,
        def: Arc<JobDefinition>,
        mut execution: JobExecution,
        job: Arc<JobContext>,
        start_at: Option<String>,
    ) -> JobExecution {
        let resolver = PropertyResolver::new(execution.parameters.clone(), def.properties.clone());

        let status = match self.begin_job(&mut execution, &job).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job = %def.id, execution_id = %execution.execution_id, error = %e, "job could not start");
                return self
                    .finish_job(execution, None, &job, BatchStatus::Failed, None, None)
                    .await;
            }
        };

        let listeners = match self.load_job_listeners(&def, &job, &resolver) {
            Ok(listeners) => listeners,
            Err(e) => {
                tracing::warn!(job = %def.id, error = %e, "job listener failed to load");
                return self
                    .finish_job(execution, Some(status), &job, BatchStatus::Failed, None, None)
                    .await;
            }
        };
        for listener in &listeners {
            listener.before_job(&job);
        }

        let mut walk = self.run_scope(&def.id, &def.elements, start_at.as_deref(), &job, &resolver);
        let walked = tokio::select! {
            walked = &mut walk => walked,
            _ = job.stop_token().cancelled() => {
                tracing::info!(job = %def.id, execution_id = %execution.execution_id, "stop requested");
                execution.batch_status = BatchStatus::Stopping;
                execution.last_updated = Utc::now();
                if let Err(e) = self.repo.update_job_execution(&execution).await {
                    tracing::warn!(execution_id = %execution.execution_id, error = %e, "failed to record STOPPING");
                }
                job.set_batch_status(BatchStatus::Stopping);
                walk.await
            }
        };

        let (mut batch_status, exit_override, restart_on) = settle(walked, &def.id);
        if batch_status == BatchStatus::Completed && job.is_stop_requested() {
            batch_status = BatchStatus::Stopped;
        }

        job.set_batch_status(batch_status);
        for listener in &listeners {
            listener.after_job(&job);
        }

        self.finish_job(execution, Some(status), &job, batch_status, exit_override, restart_on)
            .await
    }

    async fn begin_job(
        &self,
        execution: &mut JobExecution,
        job: &JobContext,
    ) -> Result<JobStatus, EngineError> {
        execution.batch_status = BatchStatus::Started;
        execution.exit_status = BatchStatus::Started.to_string();
        execution.start_time = Some(Utc::now());
        execution.last_updated = Utc::now();
        self.repo.update_job_execution(execution).await?;

        let mut status = match self.repo.get_job_status(execution.instance_id).await? {
            Some(status) => status,
            None => JobStatus {
                instance_id: execution.instance_id,
                job_name: execution.job_name.clone(),
                batch_status: BatchStatus::Starting,
                exit_status: BatchStatus::Starting.to_string(),
                latest_execution_id: None,
                restart_on: None,
                persistent_user_data: None,
            },
        };
        status.batch_status = BatchStatus::Started;
        status.exit_status = execution.exit_status.clone();
        status.latest_execution_id = Some(execution.execution_id);
        self.repo.put_job_status(&status).await?;

        job.set_persistent_data(status.persistent_user_data.clone());
        job.set_batch_status(BatchStatus::Started);
        tracing::info!(
            job = %execution.job_name,
            execution_id = %execution.execution_id,
            instance_id = %execution.instance_id,
            "job started"
        );
        Ok(status)
    }

    fn load_job_listeners(
        &self,
        def: &JobDefinition,
        job: &Arc<JobContext>,
        resolver: &PropertyResolver,
    ) -> Result<Vec<Arc<dyn JobListener>>, ArtifactError> {
        def.listeners
            .iter()
            .map(|r| {
                self.artifacts
                    .load_job_listener(&artifact_context(r, job, None, None, resolver))
            })
            .collect()
    }

    async fn finish_job(
        &self,
        mut execution: JobExecution,
        status: Option<JobStatus>,
        job: &JobContext,
        batch_status: BatchStatus,
        exit_override: Option<String>,
        restart_on: Option<String>,
    ) -> JobExecution {
        let exit_status = exit_override
            .or_else(|| job.exit_status())
            .unwrap_or_else(|| batch_status.to_string());

        let now = Utc::now();
        execution.batch_status = batch_status;
        execution.exit_status = exit_status.clone();
        execution.end_time = Some(now);
        execution.last_updated = now;
        if let Err(e) = self.repo.update_job_execution(&execution).await {
            tracing::error!(execution_id = %execution.execution_id, error = %e, "failed to persist final job execution");
        }

        if let Some(mut status) = status {
            status.batch_status = batch_status;
            status.exit_status = exit_status;
            status.restart_on = restart_on;
            status.persistent_user_data = job.persistent_data();
            if let Err(e) = self.repo.put_job_status(&status).await {
                tracing::error!(instance_id = %status.instance_id, error = %e, "failed to persist job status");
            }
        }

        match batch_status {
            BatchStatus::Completed => tracing::info!(
                job = %execution.job_name,
                execution_id = %execution.execution_id,
                exit_status = %execution.exit_status,
                "job completed"
            ),
            _ => tracing::warn!(
                job = %execution.job_name,
                execution_id = %execution.execution_id,
                status = %batch_status,
                exit_status = %execution.exit_status,
                "job did not complete"
            ),
        }
        execution
    }
}

/// Final batch status, exit-status override and restart target of a walk.
fn settle(
    walked: Result<ScopeOutcome, EngineError>,
    job_name: &str,
) -> (BatchStatus, Option<String>, Option<String>) {
    match walked {
        Err(e) => {
            tracing::warn!(job = job_name, error = %e, "job walk failed");
            (BatchStatus::Failed, None, None)
        }
        Ok(outcome) => match outcome.terminal {
            Some(Terminal {
                kind: TerminalKind::Stop,
                exit_status,
                restart,
            }) => (BatchStatus::Stopped, exit_status, restart),
            Some(Terminal {
                kind, exit_status, ..
            }) => (kind.batch_status(), exit_status, None),
            None => (outcome.batch_status, None, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::DefinitionError;

    fn outcome(terminal: Option<Terminal>, batch_status: BatchStatus) -> ScopeOutcome {
        ScopeOutcome {
            batch_status,
            exit_status: Some("LAST".to_string()),
            terminal,
            last_executions: Vec::new(),
        }
    }

    #[test]
    fn stop_rule_carries_its_restart_target() {
        let settled = settle(
            Ok(outcome(
                Some(Terminal {
                    kind: TerminalKind::Stop,
                    exit_status: None,
                    restart: Some("step2".to_string()),
                }),
                BatchStatus::Stopped,
            )),
            "j",
        );
        assert_eq!(settled, (BatchStatus::Stopped, None, Some("step2".to_string())));
    }

    #[test]
    fn end_and_fail_rules_override_the_exit_status() {
        let end = settle(
            Ok(outcome(
                Some(Terminal {
                    kind: TerminalKind::End,
                    exit_status: Some("DONE".to_string()),
                    restart: None,
                }),
                BatchStatus::Completed,
            )),
            "j",
        );
        assert_eq!(end, (BatchStatus::Completed, Some("DONE".to_string()), None));

        let fail = settle(
            Ok(outcome(
                Some(Terminal {
                    kind: TerminalKind::Fail,
                    exit_status: None,
                    restart: None,
                }),
                BatchStatus::Failed,
            )),
            "j",
        );
        assert_eq!(fail, (BatchStatus::Failed, None, None));
    }

    #[test]
    fn plain_completion_keeps_no_override() {
        let settled = settle(Ok(outcome(None, BatchStatus::Completed)), "j");
        assert_eq!(settled, (BatchStatus::Completed, None, None));
    }

    #[test]
    fn structural_failure_fails_the_job() {
        let settled = settle(
            Err(DefinitionError::TransitionLoop("a".to_string()).into()),
            "j",
        );
        assert_eq!(settled.0, BatchStatus::Failed);
    }
}
