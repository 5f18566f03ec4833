//! SQLite job repository implementation.
//!
//! Implements `JobRepository` from `batchline-core` using sqlx with split
//! read/write pools. Parameters, metrics, persistent user data and checkpoint
//! payloads are stored as JSON text.

use batchline_core::repository::JobRepository;
use batchline_types::checkpoint::{CheckpointKey, CheckpointRecord};
use batchline_types::error::RepositoryError;
use batchline_types::job::{JobExecution, JobInstance, JobParameters, JobStatus};
use batchline_types::status::BatchStatus;
use batchline_types::step::{Metrics, StepExecution, StepStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `JobRepository`.
pub struct SqliteJobRepository {
    pool: DatabasePool,
}

impl SqliteJobRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JobExecutionRow {
    execution_id: String,
    instance_id: String,
    job_name: String,
    batch_status: String,
    exit_status: String,
    parameters: String,
    create_time: String,
    start_time: Option<String>,
    end_time: Option<String>,
    last_updated: String,
}

impl JobExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            parameters: row.try_get("parameters")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            last_updated: row.try_get("last_updated")?,
        })
    }

    fn into_execution(self) -> Result<JobExecution, RepositoryError> {
        let parameters: JobParameters = from_json(&self.parameters, "parameters")?;
        Ok(JobExecution {
            execution_id: parse_uuid(&self.execution_id)?,
            instance_id: parse_uuid(&self.instance_id)?,
            job_name: self.job_name,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            parameters,
            create_time: parse_datetime(&self.create_time)?,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            last_updated: parse_datetime(&self.last_updated)?,
        })
    }
}

struct StepExecutionRow {
    step_execution_id: String,
    execution_id: String,
    step_name: String,
    partition: i64,
    batch_status: String,
    exit_status: String,
    metrics: String,
    persistent_user_data: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl StepExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_execution_id: row.try_get("step_execution_id")?,
            execution_id: row.try_get("execution_id")?,
            step_name: row.try_get("step_name")?,
            partition: row.try_get("partition")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            metrics: row.try_get("metrics")?,
            persistent_user_data: row.try_get("persistent_user_data")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    fn into_execution(self) -> Result<StepExecution, RepositoryError> {
        let metrics: Metrics = from_json(&self.metrics, "metrics")?;
        Ok(StepExecution {
            step_execution_id: parse_uuid(&self.step_execution_id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_name: self.step_name,
            partition: partition_from_column(self.partition)?,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            metrics,
            persistent_user_data: optional_json(self.persistent_user_data.as_deref(), "persistent_user_data")?,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepStatusRow {
    instance_id: String,
    step_name: String,
    partition: i64,
    batch_status: String,
    exit_status: String,
    start_count: i64,
    last_step_execution_id: Option<String>,
    persistent_user_data: Option<String>,
    plan_size: Option<i64>,
    collector_data: Option<String>,
}

impl StepStatusRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            step_name: row.try_get("step_name")?,
            partition: row.try_get("partition")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            start_count: row.try_get("start_count")?,
            last_step_execution_id: row.try_get("last_step_execution_id")?,
            persistent_user_data: row.try_get("persistent_user_data")?,
            plan_size: row.try_get("plan_size")?,
            collector_data: row.try_get("collector_data")?,
        })
    }

    fn into_status(self) -> Result<StepStatus, RepositoryError> {
        Ok(StepStatus {
            instance_id: parse_uuid(&self.instance_id)?,
            step_name: self.step_name,
            partition: partition_from_column(self.partition)?,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            start_count: u32::try_from(self.start_count)
                .map_err(|_| RepositoryError::Query(format!("invalid start_count: {}", self.start_count)))?,
            last_step_execution_id: self
                .last_step_execution_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            persistent_user_data: optional_json(self.persistent_user_data.as_deref(), "persistent_user_data")?,
            plan_size: self
                .plan_size
                .map(|n| {
                    u32::try_from(n)
                        .map_err(|_| RepositoryError::Query(format!("invalid plan_size: {n}")))
                })
                .transpose()?,
            collector_data: optional_json(self.collector_data.as_deref(), "collector_data")?,
        })
    }
}

fn job_instance_from_row(row: &SqliteRow) -> Result<JobInstance, RepositoryError> {
    let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
    let created_at: String = row.try_get("created_at").map_err(query_error)?;
    Ok(JobInstance {
        instance_id: parse_uuid(&instance_id)?,
        job_name: row.try_get("job_name").map_err(query_error)?,
        created_at: parse_datetime(&created_at)?,
    })
}

fn job_status_from_row(row: &SqliteRow) -> Result<JobStatus, RepositoryError> {
    let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
    let batch_status: String = row.try_get("batch_status").map_err(query_error)?;
    let latest: Option<String> = row.try_get("latest_execution_id").map_err(query_error)?;
    let data: Option<String> = row.try_get("persistent_user_data").map_err(query_error)?;
    Ok(JobStatus {
        instance_id: parse_uuid(&instance_id)?,
        job_name: row.try_get("job_name").map_err(query_error)?,
        batch_status: parse_status(&batch_status)?,
        exit_status: row.try_get("exit_status").map_err(query_error)?,
        latest_execution_id: latest.as_deref().map(parse_uuid).transpose()?,
        restart_on: row.try_get("restart_on").map_err(query_error)?,
        persistent_user_data: optional_json(data.as_deref(), "persistent_user_data")?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<CheckpointRecord, RepositoryError> {
    let instance_id: String = row.try_get("instance_id").map_err(query_error)?;
    let step_name: String = row.try_get("step_name").map_err(query_error)?;
    let partition: i64 = row.try_get("partition").map_err(query_error)?;
    let reader: Option<String> = row.try_get("reader").map_err(query_error)?;
    let writer: Option<String> = row.try_get("writer").map_err(query_error)?;
    let items: i64 = row.try_get("items_since_start").map_err(query_error)?;
    let committed_at: String = row.try_get("committed_at").map_err(query_error)?;
    Ok(CheckpointRecord {
        key: CheckpointKey {
            instance_id: parse_uuid(&instance_id)?,
            step_name,
            partition: partition_from_column(partition)?,
        },
        reader: optional_json(reader.as_deref(), "reader")?,
        writer: optional_json(writer.as_deref(), "writer")?,
        items_since_start: u64::try_from(items)
            .map_err(|_| RepositoryError::Query(format!("invalid items_since_start: {items}")))?,
        committed_at: parse_datetime(&committed_at)?,
    })
}

// ---------------------------------------------------------------------------
// Column helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn write_error(e: sqlx::Error) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_status(s: &str) -> Result<BatchStatus, RepositoryError> {
    s.parse::<BatchStatus>()
        .map_err(|_| RepositoryError::Query(format!("invalid batch status: {s}")))
}

/// `-1` stores the top-level record of a step.
fn partition_column(partition: Option<u32>) -> i64 {
    partition.map_or(-1, i64::from)
}

fn partition_from_column(value: i64) -> Result<Option<u32>, RepositoryError> {
    if value < 0 {
        return Ok(None);
    }
    u32::try_from(value)
        .map(Some)
        .map_err(|_| RepositoryError::Query(format!("invalid partition: {value}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

fn optional_to_json(value: Option<&serde_json::Value>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s)
        .map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn optional_json(
    s: Option<&str>,
    column: &str,
) -> Result<Option<serde_json::Value>, RepositoryError> {
    s.map(|s| from_json(s, column)).transpose()
}

// ---------------------------------------------------------------------------
// JobRepository impl
// ---------------------------------------------------------------------------

impl JobRepository for SqliteJobRepository {
    async fn create_job_instance(&self, job_name: &str) -> Result<JobInstance, RepositoryError> {
        let instance = JobInstance {
            instance_id: Uuid::now_v7(),
            job_name: job_name.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO job_instances (instance_id, job_name, created_at) VALUES (?, ?, ?)")
            .bind(instance.instance_id.to_string())
            .bind(&instance.job_name)
            .bind(format_datetime(&instance.created_at))
            .execute(&self.pool.writer)
            .await
            .map_err(write_error)?;

        Ok(instance)
    }

    async fn get_job_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM job_instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(job_instance_from_row).transpose()
    }

    async fn get_job_names(&self) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT job_name FROM job_instances ORDER BY job_name")
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_error)?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let offset = i64::try_from(start).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT * FROM job_instances WHERE job_name = ? ORDER BY rowid DESC LIMIT ? OFFSET ?",
        )
        .bind(job_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(job_instance_from_row).collect()
    }

    async fn create_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO job_executions
               (execution_id, instance_id, job_name, batch_status, exit_status, parameters,
                create_time, start_time, end_time, last_updated)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.execution_id.to_string())
        .bind(execution.instance_id.to_string())
        .bind(&execution.job_name)
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(to_json(&execution.parameters)?)
        .bind(format_datetime(&execution.create_time))
        .bind(execution.start_time.as_ref().map(format_datetime))
        .bind(execution.end_time.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.last_updated))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn update_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE job_executions
               SET batch_status = ?, exit_status = ?, parameters = ?,
                   start_time = ?, end_time = ?, last_updated = ?
               WHERE execution_id = ?"#,
        )
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(to_json(&execution.parameters)?)
        .bind(execution.start_time.as_ref().map(format_datetime))
        .bind(execution.end_time.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.last_updated))
        .bind(execution.execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_job_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM job_executions WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = JobExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn get_job_executions(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM job_executions WHERE instance_id = ? ORDER BY rowid")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                JobExecutionRow::from_row(row)
                    .map_err(query_error)?
                    .into_execution()
            })
            .collect()
    }

    async fn get_running_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM job_executions
               WHERE job_name = ? AND batch_status IN (?, ?, ?)
               ORDER BY rowid"#,
        )
        .bind(job_name)
        .bind(BatchStatus::Starting.as_str())
        .bind(BatchStatus::Started.as_str())
        .bind(BatchStatus::Stopping.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                JobExecutionRow::from_row(row)
                    .map_err(query_error)?
                    .into_execution()
            })
            .collect()
    }

    async fn get_job_status(&self, instance_id: Uuid) -> Result<Option<JobStatus>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM job_status WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.as_ref().map(job_status_from_row).transpose()
    }

    async fn put_job_status(&self, status: &JobStatus) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO job_status
               (instance_id, job_name, batch_status, exit_status, latest_execution_id,
                restart_on, persistent_user_data)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 job_name = excluded.job_name,
                 batch_status = excluded.batch_status,
                 exit_status = excluded.exit_status,
                 latest_execution_id = excluded.latest_execution_id,
                 restart_on = excluded.restart_on,
                 persistent_user_data = excluded.persistent_user_data"#,
        )
        .bind(status.instance_id.to_string())
        .bind(&status.job_name)
        .bind(status.batch_status.as_str())
        .bind(&status.exit_status)
        .bind(status.latest_execution_id.map(|id| id.to_string()))
        .bind(&status.restart_on)
        .bind(optional_to_json(status.persistent_user_data.as_ref())?)
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn get_step_status(
        &self,
        instance_id: Uuid,
        step_name: &str,
        partition: Option<u32>,
    ) -> Result<Option<StepStatus>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM step_status WHERE instance_id = ? AND step_name = ? AND partition = ?",
        )
        .bind(instance_id.to_string())
        .bind(step_name)
        .bind(partition_column(partition))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = StepStatusRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_status()?))
            }
            None => Ok(None),
        }
    }

    async fn put_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_status
               (instance_id, step_name, partition, batch_status, exit_status, start_count,
                last_step_execution_id, persistent_user_data, plan_size, collector_data)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, step_name, partition) DO UPDATE SET
                 batch_status = excluded.batch_status,
                 exit_status = excluded.exit_status,
                 start_count = excluded.start_count,
                 last_step_execution_id = excluded.last_step_execution_id,
                 persistent_user_data = excluded.persistent_user_data,
                 plan_size = excluded.plan_size,
                 collector_data = excluded.collector_data"#,
        )
        .bind(status.instance_id.to_string())
        .bind(&status.step_name)
        .bind(partition_column(status.partition))
        .bind(status.batch_status.as_str())
        .bind(&status.exit_status)
        .bind(i64::from(status.start_count))
        .bind(status.last_step_execution_id.map(|id| id.to_string()))
        .bind(optional_to_json(status.persistent_user_data.as_ref())?)
        .bind(status.plan_size.map(i64::from))
        .bind(optional_to_json(status.collector_data.as_ref())?)
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn delete_step_statuses(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM step_status WHERE instance_id = ? AND step_name = ? AND partition >= 0")
            .bind(instance_id.to_string())
            .bind(step_name)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn create_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_executions
               (step_execution_id, execution_id, step_name, partition, batch_status, exit_status,
                metrics, persistent_user_data, start_time, end_time)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.step_execution_id.to_string())
        .bind(execution.execution_id.to_string())
        .bind(&execution.step_name)
        .bind(partition_column(execution.partition))
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(to_json(&execution.metrics)?)
        .bind(optional_to_json(execution.persistent_user_data.as_ref())?)
        .bind(execution.start_time.as_ref().map(format_datetime))
        .bind(execution.end_time.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn update_step_execution(&self, execution: &StepExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE step_executions
               SET batch_status = ?, exit_status = ?, metrics = ?, persistent_user_data = ?,
                   start_time = ?, end_time = ?
               WHERE step_execution_id = ?"#,
        )
        .bind(execution.batch_status.as_str())
        .bind(&execution.exit_status)
        .bind(to_json(&execution.metrics)?)
        .bind(optional_to_json(execution.persistent_user_data.as_ref())?)
        .bind(execution.start_time.as_ref().map(format_datetime))
        .bind(execution.end_time.as_ref().map(format_datetime))
        .bind(execution.step_execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE step_execution_id = ?")
            .bind(step_execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = StepExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn get_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows =
            sqlx::query("SELECT * FROM step_executions WHERE execution_id = ? ORDER BY rowid")
                .bind(execution_id.to_string())
                .fetch_all(&self.pool.reader)
                .await
                .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                StepExecutionRow::from_row(row)
                    .map_err(query_error)?
                    .into_execution()
            })
            .collect()
    }

    async fn get_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<CheckpointRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE instance_id = ? AND step_name = ? AND partition = ?",
        )
        .bind(key.instance_id.to_string())
        .bind(&key.step_name)
        .bind(partition_column(key.partition))
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn put_checkpoint(&self, record: &CheckpointRecord) -> Result<(), RepositoryError> {
        let items = i64::try_from(record.items_since_start)
            .map_err(|_| RepositoryError::Query(format!("items_since_start overflow for {}", record.key)))?;

        sqlx::query(
            r#"INSERT INTO checkpoints
               (instance_id, step_name, partition, reader, writer, items_since_start, committed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id, step_name, partition) DO UPDATE SET
                 reader = excluded.reader,
                 writer = excluded.writer,
                 items_since_start = excluded.items_since_start,
                 committed_at = excluded.committed_at"#,
        )
        .bind(record.key.instance_id.to_string())
        .bind(&record.key.step_name)
        .bind(partition_column(record.key.partition))
        .bind(optional_to_json(record.reader.as_ref())?)
        .bind(optional_to_json(record.writer.as_ref())?)
        .bind(items)
        .bind(format_datetime(&record.committed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(write_error)?;

        Ok(())
    }

    async fn delete_checkpoint(&self, key: &CheckpointKey) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM checkpoints WHERE instance_id = ? AND step_name = ? AND partition = ?")
            .bind(key.instance_id.to_string())
            .bind(&key.step_name)
            .bind(partition_column(key.partition))
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn delete_checkpoints(
        &self,
        instance_id: Uuid,
        step_name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM checkpoints WHERE instance_id = ? AND step_name = ?")
            .bind(instance_id.to_string())
            .bind(step_name)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(())
    }
}
