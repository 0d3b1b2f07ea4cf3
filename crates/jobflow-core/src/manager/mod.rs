// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler loop and administrative operations.
//!
//! One scheduling pass runs entirely inside one transaction:
//!
//! 1. claim the oldest-touched Active job that is not debounced, locking it
//! 2. resolve its workflow and run the stage inside a savepoint
//! 3. on a stage error, roll back to the savepoint and debounce the job
//! 4. touch the job so it moves behind every other ready job, and commit
//!
//! Several managers (or several workers of one manager) may run against the
//! same database; the row lock taken in step 1 is what keeps them from running
//! the same job twice.

mod blocking;

pub use blocking::BlockingManager;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EngineError, Result};
use crate::model::{ConfigRef, Job, JobData, JobId, JobStatus, Process};
use crate::persistence::{NewProcessRecord, Persistence, Transaction};
use crate::registry::WorkflowRegistry;
use crate::workflow::{
    NewJob, StageContext, Workflow, check_process_completion, log_job, run_children,
};

const STAGE_SAVEPOINT: &str = "jobflow_stage";

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Sleep between polls when no job is runnable.
    pub poll_interval: Duration,
    /// How long a job is held back after its stage raised an error.
    pub debounce: Duration,
    /// Number of concurrent worker tasks.
    pub concurrency: usize,
    /// Return from `run` as soon as no job is runnable.
    pub stop_when_empty: bool,
    /// Return from `run` after this long.
    pub timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_secs(60),
            concurrency: 1,
            stop_when_empty: false,
            timeout: None,
        }
    }
}

/// What happened to a job in one scheduling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The stage completed the job.
    Succeeded,
    /// The stage (or the scheduler) failed the job.
    Failed,
    /// The stage raised an error and the job was debounced.
    Debounced,
    /// The stage returned without finishing the job.
    Pending,
}

/// Counters over one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Scheduling passes that ran a stage.
    pub executed: u64,
    /// Jobs that ended in Success.
    pub succeeded: u64,
    /// Jobs that ended in Failed.
    pub failed: u64,
    /// Jobs debounced after a stage error.
    pub debounced: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: JobOutcome) {
        self.executed += 1;
        match outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Debounced => self.debounced += 1,
            JobOutcome::Pending => {}
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.executed += other.executed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.debounced += other.debounced;
    }
}

/// Result of [`Manager::run_triggers`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerOutcome {
    /// Planned children that were activated.
    pub activated: usize,
    /// Whether the process was marked Done.
    pub process_completed: bool,
}

/// Stops a running manager. Workers finish their current job first.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask every worker to stop.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// The scheduler.
#[derive(Clone)]
pub struct Manager {
    persistence: Arc<dyn Persistence>,
    registry: Arc<WorkflowRegistry>,
    config: ManagerConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Manager {
    /// Create a manager over a storage backend and a set of workflows.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: WorkflowRegistry,
        config: ManagerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            persistence,
            registry: Arc::new(registry),
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// The storage backend, for status queries.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// The registered workflows.
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Current settings.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Handle to stop [`run`](Self::run) from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Start a process of workflow `W`.
    ///
    /// Creates the process and one Active root job in `stage`, or in the
    /// workflow's default stage when `stage` is `None`.
    pub async fn create_process<W: Workflow>(
        &self,
        config: Option<ConfigRef>,
        stage: Option<&str>,
        stage_data: Option<JobData>,
    ) -> Result<(Process, Job)> {
        let identifier = self.registry.identifier_for::<W>()?;
        self.create_process_for(identifier, config, stage, stage_data)
            .await
    }

    /// Start a process of the workflow registered as `identifier`.
    #[instrument(skip(self, config, stage_data), fields(workflow = identifier))]
    pub async fn create_process_for(
        &self,
        identifier: &str,
        config: Option<ConfigRef>,
        stage: Option<&str>,
        stage_data: Option<JobData>,
    ) -> Result<(Process, Job)> {
        let workflow = self.registry.resolve(identifier)?;
        let stage = stage.unwrap_or(workflow.default_stage()).to_string();

        if !workflow.has_stage(&stage) {
            return Err(EngineError::InvalidStage {
                workflow: identifier.to_string(),
                stage,
            });
        }

        let mut tx = self.persistence.begin().await?;
        let process = tx
            .insert_process(NewProcessRecord {
                workflow: workflow.identifier(),
                config: config.as_ref(),
                data: &JobData::new(),
                created_at: Utc::now(),
            })
            .await?;

        let mut ctx = StageContext::new(tx, Arc::clone(workflow.meta()));
        ctx.process_log(&process, format!("Process created in stage '{}'", stage))
            .await?;
        let job = ctx
            .create_job(
                &process,
                NewJob::new(stage).data(stage_data.unwrap_or_default()),
            )
            .await?;
        ctx.into_transaction().commit().await?;

        info!(
            process_id = process.id,
            job_id = job.id,
            stage = %job.stage,
            "Process created"
        );

        Ok((process, job))
    }

    /// Run the scheduler until shutdown, timeout, or (with
    /// `stop_when_empty`) an empty queue.
    pub async fn run(&self) -> RunSummary {
        self.run_for(self.config.timeout).await
    }

    #[instrument(skip(self), fields(concurrency = self.config.concurrency))]
    pub(crate) async fn run_for(&self, timeout: Option<Duration>) -> RunSummary {
        let deadline = timeout.map(|t| Instant::now() + t);
        let workers = self.config.concurrency.max(1);

        info!(
            workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            debounce_secs = self.config.debounce.as_secs(),
            stop_when_empty = self.config.stop_when_empty,
            "Manager started"
        );

        let summary = if workers == 1 {
            self.worker_loop(0, deadline).await
        } else {
            let mut set = JoinSet::new();
            for worker in 0..workers {
                let manager = self.clone();
                set.spawn(async move { manager.worker_loop(worker, deadline).await });
            }

            let mut summary = RunSummary::default();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(worker_summary) => summary.merge(worker_summary),
                    Err(e) => error!(error = %e, "Worker task failed"),
                }
            }
            summary
        };

        info!(
            executed = summary.executed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            debounced = summary.debounced,
            "Manager stopped"
        );

        summary
    }

    async fn worker_loop(&self, worker: usize, deadline: Option<Instant>) -> RunSummary {
        let mut shutdown = self.shutdown.subscribe();
        let mut summary = RunSummary::default();

        loop {
            if *shutdown.borrow() {
                info!(worker, "Worker shutting down");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!(worker, "Worker reached its timeout");
                break;
            }

            let idle = match self.run_once().await {
                Ok(Some(outcome)) => {
                    summary.record(outcome);
                    false
                }
                Ok(None) => {
                    if self.config.stop_when_empty {
                        debug!(worker, "No runnable jobs, stopping");
                        break;
                    }
                    true
                }
                Err(e) => {
                    error!(
                        worker,
                        error = %e,
                        code = e.error_code(),
                        "Scheduling pass failed"
                    );
                    true
                }
            };

            if idle {
                let mut wait = self.config.poll_interval;
                if let Some(deadline) = deadline {
                    wait = wait.min(deadline.saturating_duration_since(Instant::now()));
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        summary
    }

    /// Run one scheduling pass. Returns `None` when no job is runnable.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let mut tx = self.persistence.begin().await?;
        let Some(job) = tx.claim_next_job(Utc::now()).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        self.execute(tx, job).await.map(Some)
    }

    /// Run `job`, which must be locked by `tx`, and commit.
    #[instrument(skip(self, tx, job), fields(job_id = job.id, process_id = job.process_id, stage = %job.stage))]
    async fn execute(&self, mut tx: Box<dyn Transaction>, job: Job) -> Result<JobOutcome> {
        let process = tx
            .get_process(job.process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(job.process_id))?;

        let workflow = match self.registry.resolve(&process.workflow) {
            Ok(workflow) => workflow,
            Err(e) => {
                warn!(workflow = %process.workflow, "Workflow is not registered, debouncing job");
                self.debounce(tx.as_mut(), &job, &e.to_string()).await?;
                tx.touch_job(job.id, Utc::now()).await?;
                tx.commit().await?;
                return Ok(JobOutcome::Debounced);
            }
        };

        if !workflow.has_stage(&job.stage) {
            error!(workflow = %process.workflow, "Stage is not declared by its workflow, failing job");
            let mut failed = job.clone();
            let reason = format!(
                "Stage '{}' is not declared by workflow '{}'",
                job.stage,
                workflow.identifier()
            );
            tx.savepoint(STAGE_SAVEPOINT).await?;
            let mut ctx = StageContext::new(tx, Arc::clone(workflow.meta()));
            let result = match ctx.job_log(&failed, reason.as_str()).await {
                Ok(()) => ctx.fail_job(&mut failed).await,
                Err(e) => Err(e),
            };
            let (mut tx, _) = ctx.into_parts();

            let outcome = match result {
                Ok(()) => {
                    tx.release_savepoint(STAGE_SAVEPOINT).await?;
                    JobOutcome::Failed
                }
                Err(e) => {
                    tx.rollback_to_savepoint(STAGE_SAVEPOINT).await?;
                    tx.release_savepoint(STAGE_SAVEPOINT).await?;
                    error!(error = %e, "Job could not be failed, debouncing job");
                    self.debounce(tx.as_mut(), &job, &format!("{}: {}", reason, e))
                        .await?;
                    JobOutcome::Debounced
                }
            };
            tx.touch_job(job.id, Utc::now()).await?;
            tx.commit().await?;
            return Ok(outcome);
        }

        let job_id = job.id;
        let started = Instant::now();
        tx.savepoint(STAGE_SAVEPOINT).await?;
        let ctx = StageContext::new(tx, Arc::clone(workflow.meta()));

        match workflow.invoke(ctx, process, job.clone()).await {
            Ok((ctx, Ok(()))) => {
                let mut tx = ctx.into_transaction();
                tx.release_savepoint(STAGE_SAVEPOINT).await?;
                tx.touch_job(job_id, Utc::now()).await?;
                let status = tx.get_job(job_id).await?.map(|j| j.status);
                tx.commit().await?;

                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    status = ?status,
                    "Stage finished"
                );

                Ok(match status {
                    Some(JobStatus::Success) => JobOutcome::Succeeded,
                    Some(JobStatus::Failed) => JobOutcome::Failed,
                    _ => JobOutcome::Pending,
                })
            }
            Ok((ctx, Err(err))) => {
                let (mut tx, notes) = ctx.into_parts();
                tx.rollback_to_savepoint(STAGE_SAVEPOINT).await?;
                tx.release_savepoint(STAGE_SAVEPOINT).await?;

                for (_, note) in notes.iter().filter(|(id, _)| *id == job_id) {
                    log_job(tx.as_mut(), &job, note).await?;
                }

                match err.downcast_ref::<EngineError>() {
                    Some(engine) if engine.is_unrecoverable() => error!(
                        error = %engine,
                        code = engine.error_code(),
                        "Stage hit an engine error, debouncing job"
                    ),
                    _ => warn!(error = ?err, "Stage raised an error, debouncing job"),
                }

                self.debounce(tx.as_mut(), &job, &format!("{:#}", err))
                    .await?;
                tx.touch_job(job_id, Utc::now()).await?;
                tx.commit().await?;
                Ok(JobOutcome::Debounced)
            }
            Err(e) => {
                // The stage task is gone and took its transaction with it.
                error!(error = %e, "Stage task aborted, debouncing job");
                let mut tx = self.persistence.begin().await?;
                if tx.lock_job(job_id).await?.is_some() {
                    self.debounce(tx.as_mut(), &job, &e.to_string()).await?;
                    tx.touch_job(job_id, Utc::now()).await?;
                }
                tx.commit().await?;
                Ok(JobOutcome::Debounced)
            }
        }
    }

    async fn debounce(
        &self,
        tx: &mut dyn Transaction,
        job: &Job,
        reason: &str,
    ) -> Result<DateTime<Utc>> {
        let window = TimeDelta::from_std(self.config.debounce)
            .map_err(|e| EngineError::validation("debounce", e.to_string()))?;
        let till = Utc::now() + window;

        tx.set_job_debounce(job.id, Some(till)).await?;
        log_job(
            tx,
            job,
            &format!(
                "Stage '{}' raised an error, retrying after {}: {}",
                job.stage,
                till.to_rfc3339(),
                reason
            ),
        )
        .await?;

        Ok(till)
    }

    // ------------------------------------------------------------------
    // Administrative operations
    // ------------------------------------------------------------------

    /// Make a debounced job eligible again immediately.
    #[instrument(skip(self))]
    pub async fn reset_debounce(&self, job_id: JobId) -> Result<Job> {
        let mut tx = self.persistence.begin().await?;
        let mut job = lock_existing(tx.as_mut(), job_id).await?;

        tx.set_job_debounce(job_id, None).await?;
        job.debounced_till = None;
        log_job(tx.as_mut(), &job, "Debounce reset").await?;
        tx.commit().await?;

        Ok(job)
    }

    /// Run an Active job now, outside the loop and ignoring its debounce.
    #[instrument(skip(self))]
    pub async fn run_job(&self, job_id: JobId) -> Result<JobOutcome> {
        let mut tx = self.persistence.begin().await?;
        let job = lock_existing(tx.as_mut(), job_id).await?;

        if job.status != JobStatus::Active {
            return Err(EngineError::validation(
                "status",
                format!("job {} is {}, only active jobs can be run", job_id, job.status),
            ));
        }

        self.execute(tx, job).await
    }

    /// Force a job to Success. Children are not activated; use
    /// [`run_triggers`](Self::run_triggers) afterwards if they should be.
    #[instrument(skip(self))]
    pub async fn force_done_job(&self, job_id: JobId) -> Result<Job> {
        self.force_status(job_id, JobStatus::Success).await
    }

    /// Force a job to Failed. Ancestors are left untouched.
    #[instrument(skip(self))]
    pub async fn force_fail_job(&self, job_id: JobId) -> Result<Job> {
        self.force_status(job_id, JobStatus::Failed).await
    }

    /// Cancel a job that has not finished.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        self.force_status(job_id, JobStatus::Canceled).await
    }

    async fn force_status(&self, job_id: JobId, target: JobStatus) -> Result<Job> {
        let mut tx = self.persistence.begin().await?;
        let mut job = lock_existing(tx.as_mut(), job_id).await?;

        if job.status == target {
            tx.rollback().await?;
            return Ok(job);
        }

        if target == JobStatus::Canceled && job.status.is_finished() {
            return Err(EngineError::IllegalTransition {
                entity: "job",
                id: job_id,
                from: job.status.to_string(),
                to: target.to_string(),
            });
        }

        let previous = job.status;
        let done_at = target.is_finished().then(Utc::now);
        tx.set_job_status(job_id, target, done_at).await?;
        job.status = target;
        job.done_at = done_at;

        let message = match target {
            JobStatus::Canceled => "Job canceled".to_string(),
            _ => format!("Job forced from '{}' to '{}'", previous, target),
        };
        log_job(tx.as_mut(), &job, &message).await?;
        tx.commit().await?;

        warn!(job_id, from = %previous, to = %target, "Job status forced");
        Ok(job)
    }

    /// Re-run child activation and the process completion check for a job,
    /// typically after a forced transition.
    #[instrument(skip(self))]
    pub async fn run_triggers(&self, job_id: JobId) -> Result<TriggerOutcome> {
        let mut tx = self.persistence.begin().await?;
        let job = lock_existing(tx.as_mut(), job_id).await?;

        let activated = if job.status == JobStatus::Success {
            run_children(tx.as_mut(), &job).await?
        } else {
            0
        };
        let process_completed = check_process_completion(tx.as_mut(), job.process_id).await?;
        tx.commit().await?;

        Ok(TriggerOutcome {
            activated,
            process_completed,
        })
    }
}

async fn lock_existing(tx: &mut dyn Transaction, job_id: JobId) -> Result<Job> {
    tx.lock_job(job_id)
        .await?
        .ok_or(EngineError::JobNotFound(job_id))
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
