//! Job instance and job execution records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::BatchStatus;

/// Job parameters supplied at start or restart (name -> value).
pub type JobParameters = BTreeMap<String, String>;

/// One logical job. Stable identity across restarts, immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: Uuid,
    pub job_name: String,
    pub created_at: DateTime<Utc>,
}

/// One attempt to run a [`JobInstance`].
///
/// Mutated only by the job controller while it runs; immutable once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: Uuid,
    pub instance_id: Uuid,
    pub job_name: String,
    pub batch_status: BatchStatus,
    /// Free-form exit status; defaults to the batch status name.
    pub exit_status: String,
    #[serde(default)]
    pub parameters: JobParameters,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl JobExecution {
    /// A fresh execution in `Starting` state.
    pub fn new(instance: &JobInstance, parameters: JobParameters) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            instance_id: instance.instance_id,
            job_name: instance.job_name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: BatchStatus::Starting.to_string(),
            parameters,
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated: now,
        }
    }
}

/// Instance-level status record, updated at the end of every execution.
///
/// Carries what a restart needs: where to resume (`restart_on`, set by a
/// `stop` transition with a restart target) and job-level persistent data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub instance_id: Uuid,
    pub job_name: String,
    pub batch_status: BatchStatus,
    pub exit_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<serde_json::Value>,
}

impl JobStatus {
    pub fn new(instance: &JobInstance) -> Self {
        Self {
            instance_id: instance.instance_id,
            job_name: instance.job_name.clone(),
            batch_status: BatchStatus::Starting,
            exit_status: BatchStatus::Starting.to_string(),
            latest_execution_id: None,
            restart_on: None,
            persistent_user_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> JobInstance {
        JobInstance {
            instance_id: Uuid::now_v7(),
            job_name: "payroll".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn new_execution_starts_in_starting_state() {
        let inst = instance();
        let exec = JobExecution::new(&inst, JobParameters::new());
        assert_eq!(exec.batch_status, BatchStatus::Starting);
        assert_eq!(exec.exit_status, "STARTING");
        assert_eq!(exec.instance_id, inst.instance_id);
        assert!(exec.start_time.is_none());
    }

    #[test]
    fn job_status_json_roundtrip() {
        let mut status = JobStatus::new(&instance());
        status.restart_on = Some("step2".to_string());
        let json = serde_json::to_string(&status).unwrap();
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
