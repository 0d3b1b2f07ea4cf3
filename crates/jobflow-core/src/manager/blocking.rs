// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Synchronous front end to [`Manager`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::error::{EngineError, Result};
use crate::model::{ConfigRef, Job, JobData, JobId, Process};
use crate::persistence::Persistence;
use crate::registry::WorkflowRegistry;
use crate::workflow::Workflow;

use super::{JobOutcome, Manager, ManagerConfig, RunSummary, ShutdownHandle, TriggerOutcome};

/// A manager that owns its runtime and runs one job at a time.
///
/// For callers without an async runtime of their own, such as a cron-driven
/// worker. Must not be created or dropped from inside an async context.
pub struct BlockingManager {
    runtime: Runtime,
    manager: Manager,
}

impl BlockingManager {
    /// Build the runtime, connect storage with `connect`, and create the
    /// manager. `concurrency` is forced to 1.
    pub fn build<F, Fut>(config: ManagerConfig, registry: WorkflowRegistry, connect: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Persistence>>>,
    {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("jobflow-blocking")
            .enable_all()
            .build()
            .map_err(|e| EngineError::Runtime(format!("failed to build runtime: {}", e)))?;

        let persistence = runtime.block_on(connect())?;
        let manager = Manager::new(
            persistence,
            registry,
            ManagerConfig {
                concurrency: 1,
                ..config
            },
        );

        Ok(Self { runtime, manager })
    }

    /// The wrapped async manager.
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Handle to stop [`run`](Self::run) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.manager.shutdown_handle()
    }

    /// Run a future on the owned runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Run the scheduler on the calling thread. `timeout` overrides the
    /// configured one.
    pub fn run(&self, timeout: Option<Duration>) -> RunSummary {
        let timeout = timeout.or(self.manager.config().timeout);
        self.runtime.block_on(self.manager.run_for(timeout))
    }

    /// See [`Manager::run_once`].
    pub fn run_once(&self) -> Result<Option<JobOutcome>> {
        self.runtime.block_on(self.manager.run_once())
    }

    /// See [`Manager::create_process`].
    pub fn create_process<W: Workflow>(
        &self,
        config: Option<ConfigRef>,
        stage: Option<&str>,
        stage_data: Option<JobData>,
    ) -> Result<(Process, Job)> {
        self.runtime
            .block_on(self.manager.create_process::<W>(config, stage, stage_data))
    }

    /// See [`Manager::create_process_for`].
    pub fn create_process_for(
        &self,
        identifier: &str,
        config: Option<ConfigRef>,
        stage: Option<&str>,
        stage_data: Option<JobData>,
    ) -> Result<(Process, Job)> {
        self.runtime.block_on(
            self.manager
                .create_process_for(identifier, config, stage, stage_data),
        )
    }

    /// See [`Manager::reset_debounce`].
    pub fn reset_debounce(&self, job_id: JobId) -> Result<Job> {
        self.runtime.block_on(self.manager.reset_debounce(job_id))
    }

    /// See [`Manager::run_job`].
    pub fn run_job(&self, job_id: JobId) -> Result<JobOutcome> {
        self.runtime.block_on(self.manager.run_job(job_id))
    }

    /// See [`Manager::force_done_job`].
    pub fn force_done_job(&self, job_id: JobId) -> Result<Job> {
        self.runtime.block_on(self.manager.force_done_job(job_id))
    }

    /// See [`Manager::force_fail_job`].
    pub fn force_fail_job(&self, job_id: JobId) -> Result<Job> {
        self.runtime.block_on(self.manager.force_fail_job(job_id))
    }

    /// See [`Manager::cancel_job`].
    pub fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        self.runtime.block_on(self.manager.cancel_job(job_id))
    }

    /// See [`Manager::run_triggers`].
    pub fn run_triggers(&self, job_id: JobId) -> Result<TriggerOutcome> {
        self.runtime.block_on(self.manager.run_triggers(job_id))
    }
}
