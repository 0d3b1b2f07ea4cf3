// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for jobflow-core.
//!
//! [`Persistence`] is the pool-level interface used for status queries and to
//! open transactions. [`Transaction`] is everything that happens while a job
//! is locked: candidate claiming, lifecycle writes and audit logging.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::error::EngineError;
use crate::model::{
    ConfigRef, Job, JobData, JobId, JobLog, JobStatus, Process, ProcessId, ProcessLog,
    ProcessStatus,
};

/// Process row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ProcessRow {
    pub id: i64,
    pub workflow: String,
    pub config_type: Option<String>,
    pub config_id: Option<String>,
    pub data: Json<JobData>,
    pub status: String,
    pub done_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ProcessRow> for Process {
    type Error = EngineError;

    fn try_from(row: ProcessRow) -> Result<Self, Self::Error> {
        let config = match (row.config_type, row.config_id) {
            (Some(kind), Some(id)) => Some(ConfigRef { kind, id }),
            _ => None,
        };
        Ok(Process {
            id: row.id,
            workflow: row.workflow,
            config,
            data: row.data.0,
            status: row.status.parse()?,
            done_at: row.done_at,
            created_at: row.created_at,
        })
    }
}

/// Job row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub process_id: i64,
    pub stage: String,
    pub status: String,
    pub data: Json<JobData>,
    pub debounced_till: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub touched_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = EngineError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            process_id: row.process_id,
            stage: row.stage,
            status: row.status.parse()?,
            data: row.data.0,
            debounced_till: row.debounced_till,
            done_at: row.done_at,
            created_at: row.created_at,
            touched_at: row.touched_at,
        })
    }
}

pub(crate) fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, EngineError> {
    rows.into_iter().map(Job::try_from).collect()
}

pub(crate) fn into_processes(rows: Vec<ProcessRow>) -> Result<Vec<Process>, EngineError> {
    rows.into_iter().map(Process::try_from).collect()
}

/// Column list shared by every job query.
pub(crate) const JOB_COLUMNS: &str = "id, process_id, stage, status, data, debounced_till, done_at, created_at, touched_at";

/// Column list shared by every process query.
pub(crate) const PROCESS_COLUMNS: &str =
    "id, workflow, config_type, config_id, data, status, done_at, created_at";

/// Values for a new process row.
#[derive(Debug, Clone)]
pub struct NewProcessRecord<'a> {
    /// Workflow identifier.
    pub workflow: &'a str,
    /// External configuration pointer.
    pub config: Option<&'a ConfigRef>,
    /// Initial process data.
    pub data: &'a JobData,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Values for a new job row.
#[derive(Debug, Clone)]
pub struct NewJobRecord<'a> {
    /// Owning process.
    pub process_id: ProcessId,
    /// Stage name.
    pub stage: &'a str,
    /// Initial status.
    pub status: JobStatus,
    /// Initial data.
    pub data: &'a JobData,
    /// Creation time, also used as the initial `touched_at`.
    pub created_at: DateTime<Utc>,
}

/// Filter options for listing processes.
#[derive(Debug, Clone, Default)]
pub struct ListProcessesFilter {
    /// Only processes of this workflow.
    pub workflow: Option<String>,
    /// Only processes with this status.
    pub status: Option<ProcessStatus>,
    /// Only processes configured by this external object.
    pub config: Option<ConfigRef>,
}

/// Pool-level persistence interface.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Open a transaction. All writes of one scheduling pass happen inside it.
    async fn begin(&self) -> Result<Box<dyn Transaction>, EngineError>;

    async fn get_process(&self, process_id: ProcessId) -> Result<Option<Process>, EngineError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, EngineError>;

    /// List processes, newest first.
    async fn list_processes(
        &self,
        filter: &ListProcessesFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Process>, EngineError>;

    /// All jobs of a process in creation order.
    async fn list_process_jobs(&self, process_id: ProcessId) -> Result<Vec<Job>, EngineError>;

    async fn job_parents(&self, job_id: JobId) -> Result<Vec<Job>, EngineError>;

    async fn job_children(&self, job_id: JobId) -> Result<Vec<Job>, EngineError>;

    /// Job log entries, oldest first.
    async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, EngineError>;

    /// Process log entries, oldest first.
    async fn list_process_logs(&self, process_id: ProcessId)
    -> Result<Vec<ProcessLog>, EngineError>;

    /// Number of jobs the scheduler could pick at `now`.
    async fn count_runnable_jobs(&self, now: DateTime<Utc>) -> Result<i64, EngineError>;

    async fn health_check_db(&self) -> Result<bool, EngineError>;
}

/// One open database transaction.
///
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// rolls it back.
#[allow(missing_docs)]
#[async_trait]
pub trait Transaction: Send {
    /// Pick the oldest-touched runnable job and lock it for the rest of the
    /// transaction. Jobs locked by other transactions are skipped.
    async fn claim_next_job(&mut self, now: DateTime<Utc>) -> Result<Option<Job>, EngineError>;

    /// Lock a specific job, waiting for other holders, and return its
    /// current state.
    async fn lock_job(&mut self, job_id: JobId) -> Result<Option<Job>, EngineError>;

    /// Lock a process row, waiting for other holders. Held by whoever decides
    /// child activation or completion for the process, so those decisions
    /// see every job status committed before the lock was granted.
    async fn lock_process(&mut self, process_id: ProcessId)
    -> Result<Option<Process>, EngineError>;

    async fn get_job(&mut self, job_id: JobId) -> Result<Option<Job>, EngineError>;

    async fn get_process(&mut self, process_id: ProcessId) -> Result<Option<Process>, EngineError>;

    async fn insert_process(&mut self, record: NewProcessRecord<'_>) -> Result<Process, EngineError>;

    async fn insert_job(&mut self, record: NewJobRecord<'_>) -> Result<Job, EngineError>;

    async fn add_job_parents(&mut self, job_id: JobId, parents: &[JobId]) -> Result<(), EngineError>;

    async fn job_parents(&mut self, job_id: JobId) -> Result<Vec<Job>, EngineError>;

    async fn job_children(&mut self, job_id: JobId) -> Result<Vec<Job>, EngineError>;

    /// Jobs of the process whose status is neither Success nor Failed.
    async fn count_unfinished_jobs(&mut self, process_id: ProcessId) -> Result<i64, EngineError>;

    async fn set_job_status(
        &mut self,
        job_id: JobId,
        status: JobStatus,
        done_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError>;

    async fn set_job_data(&mut self, job_id: JobId, data: &JobData) -> Result<(), EngineError>;

    async fn set_job_debounce(
        &mut self,
        job_id: JobId,
        debounced_till: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError>;

    async fn touch_job(&mut self, job_id: JobId, touched_at: DateTime<Utc>)
    -> Result<(), EngineError>;

    async fn set_process_status(
        &mut self,
        process_id: ProcessId,
        status: ProcessStatus,
        done_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError>;

    async fn set_process_data(
        &mut self,
        process_id: ProcessId,
        data: &JobData,
    ) -> Result<(), EngineError>;

    async fn insert_job_log(
        &mut self,
        job_id: JobId,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    async fn insert_process_log(
        &mut self,
        process_id: ProcessId,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Open a named savepoint inside the transaction.
    async fn savepoint(&mut self, name: &str) -> Result<(), EngineError>;

    /// Undo everything written since the savepoint.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), EngineError>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), EngineError>;

    async fn commit(self: Box<Self>) -> Result<(), EngineError>;

    async fn rollback(self: Box<Self>) -> Result<(), EngineError>;
}

/// Savepoint names are interpolated into SQL, so only identifiers are allowed.
pub(crate) fn validate_savepoint_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(EngineError::validation(
            "savepoint",
            format!("'{}' is not a valid identifier", name),
        ))
    }
}
