// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle helpers available to stage functions.
//!
//! Every state change of a job or process goes through here, inside the
//! transaction that holds the running job's lock. Status decisions are always
//! taken on the row as re-read through that transaction, never on the copy a
//! stage holds, so a stale `Job` cannot cause an illegal transition to slip
//! through.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::model::{Job, JobData, JobId, JobStatus, Process, ProcessId, ProcessStatus};
use crate::persistence::{NewJobRecord, Transaction};

use super::{NewJob, WorkflowMeta};

/// Handle through which a stage reads and changes engine state.
///
/// Owns the transaction of the current scheduling pass. Nothing a stage does
/// is visible to other workers until the pass commits, and if the stage
/// returns an error all of it is rolled back.
pub struct StageContext {
    tx: Box<dyn Transaction>,
    meta: Arc<WorkflowMeta>,
    notes: Vec<(JobId, String)>,
}

impl StageContext {
    pub(crate) fn new(tx: Box<dyn Transaction>, meta: Arc<WorkflowMeta>) -> Self {
        Self {
            tx,
            meta,
            notes: Vec::new(),
        }
    }

    pub(crate) fn into_transaction(self) -> Box<dyn Transaction> {
        self.tx
    }

    /// The transaction plus every message written through [`job_log`](Self::job_log),
    /// in order, so they can be written again after a rollback.
    pub(crate) fn into_parts(self) -> (Box<dyn Transaction>, Vec<(JobId, String)>) {
        (self.tx, self.notes)
    }

    /// The workflow this context runs for.
    pub fn workflow(&self) -> &WorkflowMeta {
        &self.meta
    }

    /// Create a job in `process`.
    ///
    /// The stage must be declared by this workflow and every parent must
    /// belong to the same process. An Active job is visible to the scheduler
    /// as soon as the pass commits.
    pub async fn create_job(&mut self, process: &Process, new_job: NewJob) -> Result<Job> {
        let NewJob {
            stage,
            data,
            parents,
            status,
        } = new_job;

        if !self.meta.has_stage(&stage) {
            return Err(EngineError::InvalidStage {
                workflow: self.meta.identifier().to_string(),
                stage,
            });
        }

        if !matches!(status, JobStatus::Planned | JobStatus::Active) {
            return Err(EngineError::validation(
                "status",
                format!("new jobs must be planned or active, got '{}'", status),
            ));
        }

        let mut unique = HashSet::new();
        let parents: Vec<JobId> = parents.into_iter().filter(|id| unique.insert(*id)).collect();

        for parent_id in &parents {
            let parent = self
                .tx
                .get_job(*parent_id)
                .await?
                .ok_or(EngineError::JobNotFound(*parent_id))?;
            if parent.process_id != process.id {
                return Err(EngineError::validation(
                    "parents",
                    format!(
                        "job {} belongs to process {}, not {}",
                        parent.id, parent.process_id, process.id
                    ),
                ));
            }
        }

        let job = self
            .tx
            .insert_job(NewJobRecord {
                process_id: process.id,
                stage: &stage,
                status,
                data: &data,
                created_at: Utc::now(),
            })
            .await?;
        self.tx.add_job_parents(job.id, &parents).await?;

        log_job(self.tx.as_mut(), &job, "Job created").await?;

        Ok(job)
    }

    /// Move a Planned job to Active. No-op if it already is.
    pub async fn activate_job(&mut self, job: &mut Job) -> Result<()> {
        activate(self.tx.as_mut(), job).await
    }

    /// Mark a job successful, then activate ready children and check whether
    /// the process is complete.
    pub async fn done_job(&mut self, job: &mut Job) -> Result<()> {
        self.finish_job(job, JobStatus::Success, true).await
    }

    /// Mark a job successful without running child activation or the
    /// process completion check.
    pub async fn done_job_without_triggers(&mut self, job: &mut Job) -> Result<()> {
        self.finish_job(job, JobStatus::Success, false).await
    }

    /// Mark a job failed and fail its ancestors up to the default stage, then
    /// check whether the process is complete.
    pub async fn fail_job(&mut self, job: &mut Job) -> Result<()> {
        self.finish_job(job, JobStatus::Failed, true).await
    }

    /// Mark a job failed, including ancestors, without the process
    /// completion check.
    pub async fn fail_job_without_triggers(&mut self, job: &mut Job) -> Result<()> {
        self.finish_job(job, JobStatus::Failed, false).await
    }

    /// Mark the process Done.
    ///
    /// If `job` is given and not yet terminal it is completed first, without
    /// triggers. `comment` is written to the process log.
    pub async fn done_process(
        &mut self,
        process: &mut Process,
        job: Option<&mut Job>,
        comment: &str,
    ) -> Result<()> {
        self.finish_process(process, job, ProcessStatus::Done, comment)
            .await
    }

    /// Mark the process Failed.
    ///
    /// If `job` is given and not yet terminal it is failed first, without
    /// triggers. `comment` is written to the process log.
    pub async fn fail_process(
        &mut self,
        process: &mut Process,
        job: Option<&mut Job>,
        comment: &str,
    ) -> Result<()> {
        self.finish_process(process, job, ProcessStatus::Failed, comment)
            .await
    }

    /// Shallow-merge `data` into the job's stored data.
    pub async fn update_job_data(&mut self, job: &mut Job, data: JobData) -> Result<()> {
        let mut current = self.current_job(job.id).await?;
        let delta = data.to_string();
        current.data.merge(data);
        self.tx.set_job_data(job.id, &current.data).await?;
        job.data = current.data;

        log_job(self.tx.as_mut(), job, &format!("Job data updated: {}", delta)).await
    }

    /// Shallow-merge `data` into the process' stored data.
    pub async fn update_process_data(&mut self, process: &mut Process, data: JobData) -> Result<()> {
        let mut current = self
            .tx
            .get_process(process.id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process.id))?;
        let delta = data.to_string();
        current.data.merge(data);
        self.tx.set_process_data(process.id, &current.data).await?;
        process.data = current.data;

        log_process(
            self.tx.as_mut(),
            process.id,
            &format!("Process data updated: {}", delta),
        )
        .await
    }

    /// Append to the job's audit log.
    ///
    /// Entries for the running job survive a stage error: they are written
    /// again after the stage's other changes are rolled back.
    pub async fn job_log(&mut self, job: &Job, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        log_job(self.tx.as_mut(), job, &message).await?;
        self.notes.push((job.id, message));
        Ok(())
    }

    /// Append to the process' audit log.
    pub async fn process_log(&mut self, process: &Process, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        log_process(self.tx.as_mut(), process.id, &message).await
    }

    /// Parents of `job`.
    pub async fn parents(&mut self, job: &Job) -> Result<Vec<Job>> {
        self.tx.job_parents(job.id).await
    }

    /// Children of `job`.
    pub async fn children(&mut self, job: &Job) -> Result<Vec<Job>> {
        self.tx.job_children(job.id).await
    }

    /// Re-read a job as this transaction sees it.
    pub async fn get_job(&mut self, job_id: JobId) -> Result<Job> {
        self.current_job(job_id).await
    }

    async fn current_job(&mut self, job_id: JobId) -> Result<Job> {
        self.tx
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    async fn finish_job(&mut self, job: &mut Job, target: JobStatus, triggers: bool) -> Result<()> {
        // Taken before any job row is written so that workers finishing jobs of
        // the same process queue up here rather than on each other's jobs.
        self.tx
            .lock_process(job.process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound(job.process_id))?;

        let current = self.current_job(job.id).await?;

        if current.status == target {
            debug!(job_id = job.id, status = %target, "Job already finished");
            job.status = current.status;
            job.done_at = current.done_at;
            return Ok(());
        }

        if current.status.is_terminal() {
            return Err(EngineError::IllegalTransition {
                entity: "job",
                id: job.id,
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        let now = Utc::now();
        self.tx.set_job_status(job.id, target, Some(now)).await?;
        job.status = target;
        job.done_at = Some(now);

        match target {
            JobStatus::Success => log_job(self.tx.as_mut(), job, "Job done").await?,
            _ => {
                log_job(self.tx.as_mut(), job, "Job failed").await?;
                self.fail_ancestors(job).await?;
            }
        }

        if triggers {
            if target == JobStatus::Success {
                run_children(self.tx.as_mut(), job).await?;
            }
            check_process_completion(self.tx.as_mut(), job.process_id).await?;
        }

        Ok(())
    }

    /// Walk up from `job`, failing every ancestor outside the default stage.
    ///
    /// The walk stops at default-stage jobs and at ancestors that already
    /// failed. An ancestor that finished any other way cannot be failed and
    /// aborts the whole transition with [`EngineError::IllegalTransition`].
    async fn fail_ancestors(&mut self, job: &Job) -> Result<()> {
        let default_stage = self.meta.default_stage().to_string();
        let mut visited = HashSet::from([job.id]);
        let mut pending = vec![job.id];

        while let Some(current) = pending.pop() {
            for mut parent in self.tx.job_parents(current).await? {
                if !visited.insert(parent.id) {
                    continue;
                }
                if parent.stage == default_stage || parent.status == JobStatus::Failed {
                    continue;
                }
                if parent.status.is_terminal() {
                    return Err(EngineError::IllegalTransition {
                        entity: "job",
                        id: parent.id,
                        from: parent.status.to_string(),
                        to: JobStatus::Failed.to_string(),
                    });
                }

                let now = Utc::now();
                self.tx
                    .set_job_status(parent.id, JobStatus::Failed, Some(now))
                    .await?;
                parent.status = JobStatus::Failed;
                parent.done_at = Some(now);
                log_job(
                    self.tx.as_mut(),
                    &parent,
                    &format!("Job failed: dependent job {} failed", current),
                )
                .await?;

                pending.push(parent.id);
            }
        }

        Ok(())
    }

    async fn finish_process(
        &mut self,
        process: &mut Process,
        job: Option<&mut Job>,
        target: ProcessStatus,
        comment: &str,
    ) -> Result<()> {
        let current = self
            .tx
            .get_process(process.id)
            .await?
            .ok_or(EngineError::ProcessNotFound(process.id))?;

        if current.status.is_terminal() && current.status != target {
            return Err(EngineError::IllegalTransition {
                entity: "process",
                id: process.id,
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        if let Some(job) = job {
            let job_status = self.current_job(job.id).await?.status;
            if !job_status.is_terminal() {
                let job_target = match target {
                    ProcessStatus::Failed => JobStatus::Failed,
                    _ => JobStatus::Success,
                };
                self.finish_job(job, job_target, false).await?;
            }
        }

        set_process_status(self.tx.as_mut(), process, target, comment).await
    }
}

/// Write a job audit row and emit it to tracing.
pub(crate) async fn log_job(tx: &mut dyn Transaction, job: &Job, message: &str) -> Result<()> {
    tx.insert_job_log(job.id, message, Utc::now()).await?;
    info!(
        process_id = job.process_id,
        job_id = job.id,
        stage = %job.stage,
        "{}",
        message
    );
    Ok(())
}

/// Write a process audit row and emit it to tracing.
pub(crate) async fn log_process(
    tx: &mut dyn Transaction,
    process_id: ProcessId,
    message: &str,
) -> Result<()> {
    tx.insert_process_log(process_id, message, Utc::now())
        .await?;
    info!(process_id, "{}", message);
    Ok(())
}

pub(crate) async fn activate(tx: &mut dyn Transaction, job: &mut Job) -> Result<()> {
    let current = tx
        .get_job(job.id)
        .await?
        .ok_or(EngineError::JobNotFound(job.id))?;

    match current.status {
        JobStatus::Active => {
            job.status = JobStatus::Active;
            Ok(())
        }
        JobStatus::Planned => {
            tx.set_job_status(job.id, JobStatus::Active, None).await?;
            job.status = JobStatus::Active;
            log_job(tx, job, "Job activated").await
        }
        other => Err(EngineError::IllegalTransition {
            entity: "job",
            id: job.id,
            from: other.to_string(),
            to: JobStatus::Active.to_string(),
        }),
    }
}

/// Activate every Planned child of `job` whose parents have all succeeded.
/// Returns how many were activated.
///
/// Locks the process first, so a sibling parent finishing concurrently is
/// either already committed or still waiting for the lock.
pub(crate) async fn run_children(tx: &mut dyn Transaction, job: &Job) -> Result<usize> {
    tx.lock_process(job.process_id)
        .await?
        .ok_or(EngineError::ProcessNotFound(job.process_id))?;

    let mut activated = 0;

    for mut child in tx.job_children(job.id).await? {
        if child.status != JobStatus::Planned {
            continue;
        }

        let parents = tx.job_parents(child.id).await?;
        if parents.iter().all(|p| p.status == JobStatus::Success) {
            activate(tx, &mut child).await?;
            activated += 1;
        }
    }

    Ok(activated)
}

/// Mark the process Done when none of its jobs is outside Success/Failed.
/// Returns whether the process was finalized by this call.
pub(crate) async fn check_process_completion(
    tx: &mut dyn Transaction,
    process_id: ProcessId,
) -> Result<bool> {
    let mut process = tx
        .lock_process(process_id)
        .await?
        .ok_or(EngineError::ProcessNotFound(process_id))?;

    if process.status.is_terminal() {
        return Ok(false);
    }

    if tx.count_unfinished_jobs(process_id).await? > 0 {
        return Ok(false);
    }

    set_process_status(tx, &mut process, ProcessStatus::Done, "All jobs finished").await?;
    Ok(true)
}

async fn set_process_status(
    tx: &mut dyn Transaction,
    process: &mut Process,
    target: ProcessStatus,
    comment: &str,
) -> Result<()> {
    let current = tx
        .get_process(process.id)
        .await?
        .ok_or(EngineError::ProcessNotFound(process.id))?;

    if current.status == target {
        process.status = current.status;
        process.done_at = current.done_at;
        return log_process(tx, process.id, comment).await;
    }

    let now = Utc::now();
    tx.set_process_status(process.id, target, Some(now)).await?;
    process.status = target;
    process.done_at = Some(now);

    info!(process_id = process.id, status = %target, "Process finished");
    log_process(tx, process.id, comment).await
}
