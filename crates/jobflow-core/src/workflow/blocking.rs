// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Synchronous view of [`StageContext`] for blocking stages.

use tokio::runtime::Handle;

use crate::error::Result;
use crate::model::{Job, JobData, JobId, Process};

use super::{NewJob, StageContext, WorkflowMeta};

/// Lifecycle helpers for stages declared with
/// [`Stages::blocking_stage`](super::Stages::blocking_stage).
///
/// Each call blocks the stage's thread until the storage operation finishes.
/// The operations are the ones on [`StageContext`], run to completion on the
/// scheduler's runtime.
pub struct BlockingContext {
    ctx: StageContext,
    handle: Handle,
}

impl BlockingContext {
    pub(crate) fn new(ctx: StageContext, handle: Handle) -> Self {
        Self { ctx, handle }
    }

    pub(crate) fn into_inner(self) -> StageContext {
        self.ctx
    }

    /// The workflow this context runs for.
    pub fn workflow(&self) -> &WorkflowMeta {
        self.ctx.workflow()
    }

    /// See [`StageContext::create_job`].
    pub fn create_job(&mut self, process: &Process, new_job: NewJob) -> Result<Job> {
        self.handle.block_on(self.ctx.create_job(process, new_job))
    }

    /// See [`StageContext::activate_job`].
    pub fn activate_job(&mut self, job: &mut Job) -> Result<()> {
        self.handle.block_on(self.ctx.activate_job(job))
    }

    /// See [`StageContext::done_job`].
    pub fn done_job(&mut self, job: &mut Job) -> Result<()> {
        self.handle.block_on(self.ctx.done_job(job))
    }

    /// See [`StageContext::done_job_without_triggers`].
    pub fn done_job_without_triggers(&mut self, job: &mut Job) -> Result<()> {
        self.handle.block_on(self.ctx.done_job_without_triggers(job))
    }

    /// See [`StageContext::fail_job`].
    pub fn fail_job(&mut self, job: &mut Job) -> Result<()> {
        self.handle.block_on(self.ctx.fail_job(job))
    }

    /// See [`StageContext::fail_job_without_triggers`].
    pub fn fail_job_without_triggers(&mut self, job: &mut Job) -> Result<()> {
        self.handle.block_on(self.ctx.fail_job_without_triggers(job))
    }

    /// See [`StageContext::done_process`].
    pub fn done_process(
        &mut self,
        process: &mut Process,
        job: Option<&mut Job>,
        comment: &str,
    ) -> Result<()> {
        self.handle
            .block_on(self.ctx.done_process(process, job, comment))
    }

    /// See [`StageContext::fail_process`].
    pub fn fail_process(
        &mut self,
        process: &mut Process,
        job: Option<&mut Job>,
        comment: &str,
    ) -> Result<()> {
        self.handle
            .block_on(self.ctx.fail_process(process, job, comment))
    }

    /// See [`StageContext::update_job_data`].
    pub fn update_job_data(&mut self, job: &mut Job, data: JobData) -> Result<()> {
        self.handle.block_on(self.ctx.update_job_data(job, data))
    }

    /// See [`StageContext::update_process_data`].
    pub fn update_process_data(&mut self, process: &mut Process, data: JobData) -> Result<()> {
        self.handle
            .block_on(self.ctx.update_process_data(process, data))
    }

    /// See [`StageContext::job_log`].
    pub fn job_log(&mut self, job: &Job, message: impl Into<String>) -> Result<()> {
        self.handle.block_on(self.ctx.job_log(job, message))
    }

    /// See [`StageContext::process_log`].
    pub fn process_log(&mut self, process: &Process, message: impl Into<String>) -> Result<()> {
        self.handle.block_on(self.ctx.process_log(process, message))
    }

    /// See [`StageContext::parents`].
    pub fn parents(&mut self, job: &Job) -> Result<Vec<Job>> {
        self.handle.block_on(self.ctx.parents(job))
    }

    /// See [`StageContext::children`].
    pub fn children(&mut self, job: &Job) -> Result<Vec<Job>> {
        self.handle.block_on(self.ctx.children(job))
    }

    /// See [`StageContext::get_job`].
    pub fn get_job(&mut self, job_id: JobId) -> Result<Job> {
        self.handle.block_on(self.ctx.get_job(job_id))
    }
}
