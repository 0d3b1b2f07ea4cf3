// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Postgres};

use crate::error::EngineError;
use crate::model::{
    Job, JobData, JobId, JobLog, JobStatus, Process, ProcessId, ProcessLog, ProcessStatus,
};

use super::{
    JOB_COLUMNS, JobRow, ListProcessesFilter, NewJobRecord, NewProcessRecord, PROCESS_COLUMNS,
    Persistence, ProcessRow, Transaction, into_jobs, into_processes, validate_savepoint_name,
};

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new PostgreSQL persistence provider.
    ///
    /// Migrations are not run; see [`crate::migrations::run_postgres`].
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a `postgres://` URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| EngineError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        crate::migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn fetch_job<'e, E: PgExecutor<'e>>(
    executor: E,
    job_id: JobId,
) -> Result<Option<Job>, EngineError> {
    let sql = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    row.map(Job::try_from).transpose()
}

async fn fetch_process<'e, E: PgExecutor<'e>>(
    executor: E,
    process_id: ProcessId,
) -> Result<Option<Process>, EngineError> {
    let sql = format!("SELECT {} FROM processes WHERE id = $1", PROCESS_COLUMNS);
    let row = sqlx::query_as::<_, ProcessRow>(&sql)
        .bind(process_id)
        .fetch_optional(executor)
        .await?;

    row.map(Process::try_from).transpose()
}

async fn fetch_parents<'e, E: PgExecutor<'e>>(
    executor: E,
    job_id: JobId,
) -> Result<Vec<Job>, EngineError> {
    let sql = format!(
        r#"
        SELECT {}
        FROM jobs
        WHERE id IN (SELECT parent_id FROM job_parents WHERE job_id = $1)
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

async fn fetch_children<'e, E: PgExecutor<'e>>(
    executor: E,
    job_id: JobId,
) -> Result<Vec<Job>, EngineError> {
    let sql = format!(
        r#"
        SELECT {}
        FROM jobs
        WHERE id IN (SELECT job_id FROM job_parents WHERE parent_id = $1)
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
impl Persistence for PostgresPersistence {
    async fn begin(&self) -> Result<Box<dyn Transaction>, EngineError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
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
            WHERE ($1::TEXT IS NULL OR workflow = $1)
              AND ($2::TEXT IS NULL OR status = $2)
              AND ($3::TEXT IS NULL OR config_type = $3)
              AND ($4::TEXT IS NULL OR config_id = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
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
            "SELECT {} FROM jobs WHERE process_id = $1 ORDER BY id ASC",
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
            WHERE job_id = $1
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
            WHERE process_id = $1
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
              AND (debounced_till IS NULL OR debounced_till <= $1)
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn health_check_db(&self) -> Result<bool, EngineError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

/// An open PostgreSQL transaction.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn expect_updated(
        &mut self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<bool, EngineError> {
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn claim_next_job(&mut self, now: DateTime<Utc>) -> Result<Option<Job>, EngineError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM jobs
            WHERE status = 'active'
              AND (debounced_till IS NULL OR debounced_till <= $1)
            ORDER BY touched_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn lock_job(&mut self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn lock_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<Option<Process>, EngineError> {
        let sql = format!(
            "SELECT {} FROM processes WHERE id = $1 FOR UPDATE",
            PROCESS_COLUMNS
        );
        let row = sqlx::query_as::<_, ProcessRow>(&sql)
            .bind(process_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Process::try_from).transpose()
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
            VALUES ($1, $2, $3, $4, 'active', $5)
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
            VALUES ($1, $2, $3, $4, $5, $5)
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
        if parents.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO job_parents (job_id, parent_id)
            SELECT $1, parent_id FROM UNNEST($2::BIGINT[]) AS parent_id
            ON CONFLICT (job_id, parent_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(parents)
        .execute(&mut *self.tx)
        .await?;

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
            WHERE process_id = $1
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
        let query = sqlx::query("UPDATE jobs SET status = $1, done_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(done_at)
            .bind(job_id);

        if !self.expect_updated(query).await? {
            return Err(EngineError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn set_job_data(&mut self, job_id: JobId, data: &JobData) -> Result<(), EngineError> {
        let query = sqlx::query("UPDATE jobs SET data = $1 WHERE id = $2")
            .bind(Json(data))
            .bind(job_id);

        if !self.expect_updated(query).await? {
            return Err(EngineError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn set_job_debounce(
        &mut self,
        job_id: JobId,
        debounced_till: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let query = sqlx::query("UPDATE jobs SET debounced_till = $1 WHERE id = $2")
            .bind(debounced_till)
            .bind(job_id);

        if !self.expect_updated(query).await? {
            return Err(EngineError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn touch_job(
        &mut self,
        job_id: JobId,
        touched_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let query = sqlx::query("UPDATE jobs SET touched_at = $1 WHERE id = $2")
            .bind(touched_at)
            .bind(job_id);

        if !self.expect_updated(query).await? {
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
        let query = sqlx::query("UPDATE processes SET status = $1, done_at = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(done_at)
            .bind(process_id);

        if !self.expect_updated(query).await? {
            return Err(EngineError::ProcessNotFound(process_id));
        }
        Ok(())
    }

    async fn set_process_data(
        &mut self,
        process_id: ProcessId,
        data: &JobData,
    ) -> Result<(), EngineError> {
        let query = sqlx::query("UPDATE processes SET data = $1 WHERE id = $2")
            .bind(Json(data))
            .bind(process_id);

        if !self.expect_updated(query).await? {
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
        sqlx::query("INSERT INTO job_logs (job_id, message, created_at) VALUES ($1, $2, $3)")
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
            "INSERT INTO process_logs (process_id, message, created_at) VALUES ($1, $2, $3)",
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
