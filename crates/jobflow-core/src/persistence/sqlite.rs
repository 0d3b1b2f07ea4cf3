// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! SQLite has no row locks. A transaction that starts with a write statement
//! holds the database write lock until it ends, which gives the scheduler the
//! same exclusivity a row lock gives it on PostgreSQL: claiming a job is a
//! single `UPDATE ... RETURNING` so selection and locking cannot interleave.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{Sqlite, SqliteExecutor, SqlitePool};

use crate::error::EngineError;
use crate::model::{
    Job, JobData, JobId, JobLog, JobStatus, Process, ProcessId, ProcessLog, ProcessStatus,
};

use super::{
    JOB_COLUMNS, JobRow, ListProcessesFilter, NewJobRecord, NewProcessRecord, PROCESS_COLUMNS,
    Persistence, ProcessRow, Transaction, into_jobs, into_processes, validate_savepoint_name,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to a `sqlite:` URL and run migrations. The database file is
    /// created if missing.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database with the schema applied.
    ///
    /// Every transaction shares the one connection, so callers must not read
    /// through the pool while a transaction is open.
    pub async fn in_memory() -> Result<Self, EngineError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Shared queries (pool or transaction)
// ============================================================================

async fn fetch_job<'e, E: SqliteExecutor<'e>>(
    executor: E,
    job_id: JobId,
) -> Result<Option<Job>, EngineError> {
    let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    row.map(Job::try_from).transpose()
}

async fn fetch_process<'e, E: SqliteExecutor<'e>>(
    executor: E,
    process_id: ProcessId,
) -> Result<Option<Process>, EngineError> {
    let sql = format!("SELECT {} FROM processes WHERE id = ?", PROCESS_COLUMNS);
    let row = sqlx::query_as::<_, ProcessRow>(&sql)
        .bind(process_id)
        .fetch_optional(executor)
        .await?;

    row.map(Process::try_from).transpose()
}

async fn fetch_parents<'e, E: SqliteExecutor<'e>>(
    executor: E,
    job_id: JobId,
) -> Result<Vec<Job>, EngineError> {
    let sql = format!(
        r#"
        SELECT {}
        FROM jobs
        WHERE id IN (SELECT parent_id FROM job_parents WHERE job_id = ?)
        ORDER BY id ASC
        "#,
        JOB_COLUMNS
    );
    let rows = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_all(executor)
        .await?;

    into_jobs(rows)
}

async fn fetch_children<'e, E: SqliteExecutor<'e>>(
    executor: E,
    job_id: JobId,
) -> Result<Vec<Job>, EngineError> {
    let sql = format!(
        r#"
        SELECT {}
        FROM jobs
        WHERE id IN (SELECT job_id FROM job_parents WHERE parent_id = ?)
        ORDER BY id ASC
        "#,
        JOB_COLUMNS
    );
    let rows = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_all(executor)
        .await?;

    into_jobs(rows)
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn begin(&self) -> Result<Box<dyn Transaction>, EngineError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn get_process(&self, process_id: ProcessId) -> Result<Option<Process>, EngineError> {
        fetch_process(&self.pool, process_id).await
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        fetch_job(&self.pool, job_id).await
    }

    async fn list_processes(
        &self,
        filter: &ListProcessesFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Process>, EngineError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM processes
            WHERE (?1 IS NULL OR workflow = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR config_type = ?3)
              AND (?4 IS NULL OR config_id = ?4)
            ORDER BY created_at DESC, id DESC
            LIMIT ?5 OFFSET ?6
            "#,
            PROCESS_COLUMNS
        );
        let rows = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(filter.workflow.as_deref())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.config.as_ref().map(|c| c.kind.as_str()))
            .bind(filter.config.as_ref().map(|c| c.id.as_str()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        into_processes(rows)
    }

    async fn list_process_jobs(&self, process_id: ProcessId) -> Result<Vec<Job>, EngineError> {
        let sql = format!(
            "SELECT {} FROM jobs WHERE process_id = ? ORDER BY id ASC",
            JOB_COLUMNS
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(process_id)
            .fetch_all(&self.pool)
            .await?;

        into_jobs(rows)
    }

    async fn job_parents(&self, job_id: JobId) -> Result<Vec<Job>, EngineError> {
        fetch_parents(&self.pool, job_id).await
    }

    async fn job_children(&self, job_id: JobId) -> Result<Vec<Job>, EngineError> {
        fetch_children(&self.pool, job_id).await
    }

    async fn list_job_logs(&self, job_id: JobId) -> Result<Vec<JobLog>, EngineError> {
        let logs = sqlx::query_as::<_, JobLog>(
            r#"
            SELECT id, job_id, message, created_at
            FROM job_logs
            WHERE job_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    async fn list_process_logs(
        &self,
        process_id: ProcessId,
    ) -> Result<Vec<ProcessLog>, EngineError> {
        let logs = sqlx::query_as::<_, ProcessLog>(
            r#"
            SELECT id, process_id, message, created_at
            FROM process_logs
            WHERE process_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    async fn count_runnable_jobs(&self, now: DateTime<Utc>) -> Result<i64, EngineError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE status = 'active'
              AND (debounced_till IS NULL OR debounced_till <= ?)
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// An open SQLite transaction.
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn claim_next_job(&mut self, now: DateTime<Utc>) -> Result<Option<Job>, EngineError> {
        // The no-op UPDATE takes the write lock in the same statement that
        // picks the candidate.
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET touched_at = touched_at
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE status = 'active'
                  AND (debounced_till IS NULL OR debounced_till <= ?1)
                ORDER BY touched_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;

        match claimed {
            Some(job_id) => fetch_job(&mut *self.tx, job_id).await,
            None => Ok(None),
        }
    }

    async fn lock_job(&mut self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        let locked: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET touched_at = touched_at
            WHERE id = ?
            RETURNING id
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match locked {
            Some(job_id) => fetch_job(&mut *self.tx, job_id).await,
            None => Ok(None),
        }
    }

    async fn lock_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<Option<Process>, EngineError> {
        let locked: Option<i64> = sqlx::query_scalar(
            "UPDATE processes SET status = status WHERE id = ? RETURNING id",
        )
        .bind(process_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match locked {
            Some(process_id) => fetch_process(&mut *self.tx, process_id).await,
            None => Ok(None),
        }
    }

    async fn get_job(&mut self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        fetch_job(&mut *self.tx, job_id).await
    }

    async fn get_process(&mut self, process_id: ProcessId) -> Result<Option<Process>, EngineError> {
        fetch_process(&mut *self.tx, process_id).await
    }

    async fn insert_process(&mut self, record: NewProcessRecord<'_>) -> Result<Process, EngineError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO processes (workflow, config_type, config_id, data, status, created_at)
            VALUES (?, ?, ?, ?, 'active', ?)
            RETURNING id
            "#,
        )
        .bind(record.workflow)
        .bind(record.config.map(|c| c.kind.as_str()))
        .bind(record.config.map(|c| c.id.as_str()))
        .bind(Json(record.data))
        .bind(record.created_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Process {
            id,
            workflow: record.workflow.to_string(),
            config: record.config.cloned(),
            data: record.data.clone(),
            status: ProcessStatus::Active,
            done_at: None,
            created_at: record.created_at,
        })
    }

    async fn insert_job(&mut self, record: NewJobRecord<'_>) -> Result<Job, EngineError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (process_id, stage, status, data, created_at, touched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            RETURNING id
            "#,
        )
        .bind(record.process_id)
        .bind(record.stage)
        .bind(record.status.as_str())
        .bind(Json(record.data))
        .bind(record.created_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(Job {
            id,
            process_id: record.process_id,
            stage: record.stage.to_string(),
            status: record.status,
            data: record.data.clone(),
            debounced_till: None,
            done_at: None,
            created_at: record.created_at,
            touched_at: record.created_at,
        })
    }

    async fn add_job_parents(&mut self, job_id: JobId, parents: &[JobId]) -> Result<(), EngineError> {
        for parent_id in parents {
            sqlx::query(
                r#"
                INSERT INTO job_parents (job_id, parent_id)
                VALUES (?, ?)
                ON CONFLICT (job_id, parent_id) DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(parent_id)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }

    async fn job_parents(&mut self, job_id: JobId) -> Result<Vec<Job>, EngineError> {
        fetch_parents(&mut *self.tx, job_id).await
    }

    async fn job_children(&mut self, job_id: JobId) -> Result<Vec<Job>, EngineError> {
        fetch_children(&mut *self.tx, job_id).await
    }

    async fn count_unfinished_jobs(&mut self, process_id: ProcessId) -> Result<i64, EngineError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE process_id = ?
              AND status NOT IN ('success', 'failed')
            "#,
        )
        .bind(process_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(count)
    }

    async fn set_job_status(
        &mut self,
        job_id: JobId,
        status: JobStatus,
        done_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE jobs SET status = ?, done_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(done_at)
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(job_id));
        }

        Ok(())
    }

    async fn set_job_data(&mut self, job_id: JobId, data: &JobData) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE jobs SET data = ? WHERE id = ?")
            .bind(Json(data))
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(job_id));
        }

        Ok(())
    }

    async fn set_job_debounce(
        &mut self,
        job_id: JobId,
        debounced_till: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE jobs SET debounced_till = ? WHERE id = ?")
            .bind(debounced_till)
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(job_id));
        }

        Ok(())
    }

    async fn touch_job(
        &mut self,
        job_id: JobId,
        touched_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE jobs SET touched_at = ? WHERE id = ?")
            .bind(touched_at)
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(job_id));
        }

        Ok(())
    }

    async fn set_process_status(
        &mut self,
        process_id: ProcessId,
        status: ProcessStatus,
        done_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE processes SET status = ?, done_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(done_at)
            .bind(process_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ProcessNotFound(process_id));
        }

        Ok(())
    }

    async fn set_process_data(
        &mut self,
        process_id: ProcessId,
        data: &JobData,
    ) -> Result<(), EngineError> {
        let result = sqlx::query("UPDATE processes SET data = ? WHERE id = ?")
            .bind(Json(data))
            .bind(process_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::ProcessNotFound(process_id));
        }

        Ok(())
    }

    async fn insert_job_log(
        &mut self,
        job_id: JobId,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query("INSERT INTO job_logs (job_id, message, created_at) VALUES (?, ?, ?)")
            .bind(job_id)
            .bind(message)
            .bind(created_at)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn insert_process_log(
        &mut self,
        process_id: ProcessId,
        message: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO process_logs (process_id, message, created_at) VALUES (?, ?, ?)",
        )
        .bind(process_id)
        .bind(message)
        .bind(created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), EngineError> {
        validate_savepoint_name(name)?;
        sqlx::query(&format!("SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), EngineError> {
        validate_savepoint_name(name)?;
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), EngineError> {
        validate_savepoint_name(name)?;
        sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
