//! In-process job repository.
//!
//! Everything lives behind one mutex, so each call is atomic with respect to
//! the others. Nothing survives the process.

use std::collections::HashMap;
use std::sync::Mutex;

use batchline_types::checkpoint::{CheckpointKey, CheckpointRecord};
use batchline_types::error::RepositoryError;
use batchline_types::job::{JobExecution, JobInstance, JobStatus};
use batchline_types::step::{StepExecution, StepStatus};
use chrono::Utc;
use uuid::Uuid;

use super::JobRepository;

type StepStatusKey = (Uuid, String, Option<u32>);

#[derive(Default)]
struct Tables {
    instances: Vec<JobInstance>,
    executions: Vec<JobExecution>,
    job_statuses: HashMap<Uuid, JobStatus>,
    step_statuses: HashMap<StepStatusKey, StepStatus>,
    step_executions: Vec<StepExecution>,
    checkpoints: HashMap<CheckpointKey, CheckpointRecord>,
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    tables: Mutex<Tables>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        let mut tables = self.tables.lock().expect("repository lock poisoned");
        f(&mut tables)
    }
}

impl JobRepository for InMemoryJobRepository {
    async fn create_job_instance(&self, job_name: &str) -> Result<JobInstance, RepositoryError> {
        let instance = JobInstance {
            instance_id: Uuid::now_v7(),
            job_name: job_name.to_string(),
            created_at: Utc::now(),
        };
        self.with_tables(|t| t.instances.push(instance.clone()));
        Ok(instance)
    }

    async fn get_job_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.instances
                .iter()
                .find(|i| i.instance_id == instance_id)
                .cloned()
        }))
    }

    async fn get_job_names(&self) -> Result<Vec<String>, RepositoryError> {
        let mut names: Vec<String> =
            self.with_tables(|t| t.instances.iter().map(|i| i.job_name.clone()).collect());
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.instances
                .iter()
                .rev()
                .filter(|i| i.job_name == job_name)
                .skip(start)
                .take(count)
                .cloned()
                .collect()
        }))
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            if t.executions
                .iter()
                .any(|e| e.execution_id == execution.execution_id)
            {
                return Err(RepositoryError::Conflict(format!(
                    "job execution {} already exists",
                    execution.execution_id
                )));
            }
            t.executions.push(execution.clone());
            Ok(())
        })
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            let existing = t
                .executions
                .iter_mut()
                .find(|e| e.execution_id == execution.execution_id)
                .ok_or(RepositoryError::NotFound)?;
            *existing = execution.clone();
            Ok(())
        })
    }

    async fn get_job_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.executions
                .iter()
                .find(|e| e.execution_id == execution_id)
                .cloned()
        }))
    }

    async fn get_job_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.executions
                .iter()
                .filter(|e| e.instance_id == instance_id)
                .cloned()
                .collect()
        }))
    }

    async fn get_running_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.executions
                .iter()
                .filter(|e| e.job_name == job_name && e.batch_status.is_running())
                .cloned()
                .collect()
        }))
    }

    async fn get_job_status(&self, instance_id: Uuid) -> Result<Option<JobStatus>, RepositoryError> {
        Ok(self.with_tables(|t| t.job_statuses.get(&instance_id).cloned()))
    }

    async fn put_job_status(&self, status: &JobStatus) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            t.job_statuses.insert(status.instance_id, status.clone());
        });
        Ok(())
    }

    async fn get_step_status(
        &self,
        instance_id: Uuid,
        step_name: &str,
        partition: Option<u32>,
    ) -> Result<Option<StepStatus>, RepositoryError> {
        let key = (instance_id, step_name.to_string(), partition);
        Ok(self.with_tables(|t| t.step_statuses.get(&key).cloned()))
    }

    async fn put_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError> {
        let key = (status.instance_id, status.step_name.clone(), status.partition);
        self.with_tables(|t| {
            t.step_statuses.insert(key, status.clone());
        });
        Ok(())
    }

    async fn delete_step_statuses(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            t.step_statuses.retain(|(instance, step, partition), _| {
                !(*instance == instance_id && step == step_name && partition.is_some())
            });
        });
        Ok(())
    }

    async fn create_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        self.with_tables(|t| t.step_executions.push(execution.clone()));
        Ok(())
    }

    async fn update_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            let existing = t
                .step_executions
                .iter_mut()
                .find(|e| e.step_execution_id == execution.step_execution_id)
                .ok_or(RepositoryError::NotFound)?;
            *existing = execution.clone();
            Ok(())
        })
    }

    async fn get_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.step_executions
                .iter()
                .find(|e| e.step_execution_id == step_execution_id)
                .cloned()
        }))
    }

    async fn get_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self.with_tables(|t| {
            t.step_executions
                .iter()
                .filter(|e| e.execution_id == execution_id)
                .cloned()
                .collect()
        }))
    }

    async fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        Ok(self.with_tables(|t| t.checkpoints.get(key).cloned()))
    }

    async fn put_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            t.checkpoints.insert(record.key.clone(), record.clone());
        });
        Ok(())
    }

    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            t.checkpoints.remove(key);
        });
        Ok(())
    }

    async fn delete_checkpoints(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<(), RepositoryError> {
        self.with_tables(|t| {
            t.checkpoints
                .retain(|key, _| !(key.instance_id == instance_id && key.step_name == step_name));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use batchline_types::job::JobParameters;
    use batchline_types::status::BatchStatus;

    #[tokio::test]
    async fn instances_page_most_recent_first() {
        let repo = InMemoryJobRepository::new();
        let first = repo.create_job_instance("payroll").await.unwrap();
        let second = repo.create_job_instance("payroll").await.unwrap();
        repo.create_job_instance("audit").await.unwrap();

        let page = repo.get_job_instances("payroll", 0, 10).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].instance_id, second.instance_id);
        assert_eq!(page[1].instance_id, first.instance_id);

        let page = repo.get_job_instances("payroll", 1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(repo.get_job_names().await.unwrap(), vec!["audit", "payroll"]);
    }

    #[tokio::test]
    async fn update_missing_execution_is_not_found() {
        let repo = InMemoryJobRepository::new();
        let instance = repo.create_job_instance("payroll").await.unwrap();
        let execution = JobExecution::new(&instance, JobParameters::new());
        let err = repo.update_job_execution(&execution).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));

        repo.create_job_execution(&execution).await.unwrap();
        let mut running = execution.clone();
        running.batch_status = BatchStatus::Started;
        repo.update_job_execution(&running).await.unwrap();
        let running_list = repo.get_running_executions("payroll").await.unwrap();
        assert_eq!(running_list.len(), 1);
        assert!(repo.create_job_execution(&execution).await.is_err());
    }

    #[tokio::test]
    async fn delete_step_statuses_keeps_top_level_record() {
        let repo = InMemoryJobRepository::new();
        let instance_id = Uuid::now_v7();
        for partition in [None, Some(0), Some(1)] {
            repo.put_step_status(&StepStatus::new(instance_id, "load", partition))
                .await
                .unwrap();
        }
        repo.delete_step_statuses(instance_id, "load").await.unwrap();
        assert!(repo.get_step_status(instance_id, "load", None).await.unwrap().is_some());
        assert!(repo.get_step_status(instance_id, "load", Some(0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoints_are_keyed_by_partition() {
        let repo = InMemoryJobRepository::new();
        let instance_id = Uuid::now_v7();
        for partition in [Some(0), Some(1)] {
            let record = CheckpointRecord {
                key: CheckpointKey::new(instance_id, "load", partition),
                reader: Some(serde_json::json!(partition)),
                writer: None,
                items_since_start: 3,
                committed_at: Utc::now(),
            };
            repo.put_checkpoint(&record).await.unwrap();
        }
        let p1 = repo
            .get_checkpoint(&CheckpointKey::new(instance_id, "load", Some(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p1.reader, Some(serde_json::json!(1)));

        repo.delete_checkpoints(instance_id, "load").await.unwrap();
        assert!(
            repo.get_checkpoint(&CheckpointKey::new(instance_id, "load", Some(0)))
                .await
                .unwrap()
                .is_none()
        );
    }
}
