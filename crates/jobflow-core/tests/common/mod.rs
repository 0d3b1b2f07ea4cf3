// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for jobflow-core integration tests.
//!
//! Provides fixture workflows and helpers that build a manager over an
//! in-memory SQLite database or, when `TEST_DATABASE_URL` is set, PostgreSQL.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobflow_core::{
    BlockingContext, BoxFuture, EngineError, Job, JobData, Manager, ManagerConfig, NewJob,
    Persistence, PostgresPersistence, Process, SqlitePersistence, StageContext, Stages, Workflow,
    WorkflowRegistry,
};

/// Skip the test when no PostgreSQL database is configured.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// ============================================================================
// Fixture workflows
// ============================================================================

/// Root job fans out into independent children that all join on the root.
#[derive(Default)]
pub struct FanOut;

impl FanOut {
    pub const CHILDREN: usize = 3;

    fn prepare<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            for index in 0..Self::CHILDREN {
                ctx.create_job(
                    process,
                    NewJob::new("child")
                        .data(JobData::new().with("index", index as u64))
                        .parent(job)
                        .planned(),
                )
                .await?;
            }
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn child<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.update_job_data(job, JobData::new().with("processed", true))
                .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }
}

impl Workflow for FanOut {
    const IDENTIFIER: &'static str = "fan_out";

    fn stages() -> Stages<Self> {
        Stages::new("prepare")
            .stage("prepare", Self::prepare)
            .stage("child", Self::child)
    }
}

/// Same graph as [`FanOut`], with every stage on the blocking pool.
#[derive(Default)]
pub struct BlockingFanOut;

impl BlockingFanOut {
    fn prepare(
        &self,
        ctx: &mut BlockingContext,
        process: &mut Process,
        job: &mut Job,
    ) -> anyhow::Result<()> {
        for index in 0..FanOut::CHILDREN {
            ctx.create_job(
                process,
                NewJob::new("child")
                    .data(JobData::new().with("index", index as u64))
                    .parent(job)
                    .planned(),
            )?;
        }
        ctx.done_job(job)?;
        Ok(())
    }

    fn child(
        &self,
        ctx: &mut BlockingContext,
        _process: &mut Process,
        job: &mut Job,
    ) -> anyhow::Result<()> {
        // Plain blocking work is fine here.
        std::thread::sleep(Duration::from_millis(5));
        ctx.update_job_data(job, JobData::new().with("processed", true))?;
        ctx.done_job(job)?;
        Ok(())
    }
}

impl Workflow for BlockingFanOut {
    const IDENTIFIER: &'static str = "blocking_fan_out";

    fn stages() -> Stages<Self> {
        Stages::new("prepare")
            .blocking_stage("prepare", Self::prepare)
            .blocking_stage("child", Self::child)
    }
}

/// Fails the process when the collected total is under the minimum.
#[derive(Default)]
pub struct Collection;

impl Collection {
    pub const MINIMUM: f64 = 100.0;
    pub const TOO_LOW: &'static str = "Total amount is too low";

    fn collect<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let total: f64 = job.data.get("total")?.unwrap_or(0.0);
            if total < Self::MINIMUM {
                ctx.fail_process(process, Some(job), Self::TOO_LOW).await?;
                return Ok(());
            }

            ctx.update_process_data(process, JobData::new().with("collected", total))
                .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }
}

impl Workflow for Collection {
    const IDENTIFIER: &'static str = "collection";

    fn stages() -> Stages<Self> {
        Stages::new("collect").stage("collect", Self::collect)
    }
}

/// Writes some data, then errors until the job data says it recovered.
#[derive(Default)]
pub struct Flaky;

impl Flaky {
    pub const CLOSED: &'static str = "Closed by operator request";

    fn call_gateway<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if job.data.get::<bool>("recovered")?.unwrap_or(false) {
                ctx.done_job(job).await?;
                return Ok(());
            }

            ctx.job_log(job, "Calling gateway").await?;
            ctx.update_job_data(job, JobData::new().with("attempted", true))
                .await?;
            anyhow::bail!("gateway timeout")
        })
    }

    fn complete_twice<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.fail_job(job).await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn done_twice<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.done_job(job).await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn close_twice<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.done_process(process, Some(&mut *job), Self::CLOSED).await?;
            ctx.done_process(process, Some(&mut *job), Self::CLOSED).await?;
            Ok(())
        })
    }

    fn fail_twice<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.fail_job(job).await?;
            ctx.fail_job(job).await?;
            Ok(())
        })
    }

    /// Completes the job, then records how a later `fail_job` was refused.
    fn fail_after_done<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.done_job(job).await?;
            let done_at = job.done_at;

            match ctx.fail_job(job).await {
                Err(e @ EngineError::IllegalTransition { .. }) => {
                    ctx.job_log(job, e.to_string()).await?
                }
                other => anyhow::bail!("fail_job on a done job returned {:?}", other),
            }

            let stored = ctx.get_job(job.id).await?;
            anyhow::ensure!(stored.done_at == done_at, "done_at changed");
            Ok(())
        })
    }

    fn explode<'a>(
        &'a self,
        _ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if job.id > 0 {
                panic!("stage exploded");
            }
            Ok(())
        })
    }
}

impl Workflow for Flaky {
    const IDENTIFIER: &'static str = "flaky";

    fn stages() -> Stages<Self> {
        Stages::new("call_gateway")
            .stage("call_gateway", Self::call_gateway)
            .stage("complete_twice", Self::complete_twice)
            .stage("done_twice", Self::done_twice)
            .stage("close_twice", Self::close_twice)
            .stage("fail_twice", Self::fail_twice)
            .stage("fail_after_done", Self::fail_after_done)
            .stage("explode", Self::explode)
    }
}

/// Builds a chain prepare → step → step → leaf; the leaf fails.
#[derive(Default)]
pub struct Chain;

impl Chain {
    fn prepare<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if job.data.get::<bool>("planned")?.unwrap_or(false) {
                return Ok(());
            }

            let first = ctx
                .create_job(process, NewJob::new("step").parent(job))
                .await?;
            let second = ctx
                .create_job(process, NewJob::new("step").parent(&first))
                .await?;
            ctx.create_job(process, NewJob::new("leaf").parent(&second))
                .await?;
            ctx.update_job_data(job, JobData::new().with("planned", true))
                .await?;
            Ok(())
        })
    }

    fn step<'a>(
        &'a self,
        _ctx: &'a mut StageContext,
        _process: &'a mut Process,
        _job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn leaf<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.job_log(job, "Leaf rejected").await?;
            ctx.fail_job(job).await?;
            Ok(())
        })
    }
}

impl Workflow for Chain {
    const IDENTIFIER: &'static str = "chain";

    fn stages() -> Stages<Self> {
        Stages::new("prepare")
            .stage("prepare", Self::prepare)
            .stage("step", Self::step)
            .stage("leaf", Self::leaf)
    }
}

/// An older build of [`Chain`] that only knows its default stage.
#[derive(Default)]
pub struct ChainWithoutLeaf;

impl Workflow for ChainWithoutLeaf {
    const IDENTIFIER: &'static str = "chain";

    fn stages() -> Stages<Self> {
        Stages::new("prepare").blocking_stage("prepare", |_: &Self, _, _, _| Ok(()))
    }
}

/// prepare → step → leaf, where each job completes before the next one runs
/// and the leaf fails.
#[derive(Default)]
pub struct Relay;

impl Relay {
    fn prepare<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.create_job(process, NewJob::new("step").parent(job).planned())
                .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn step<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.create_job(process, NewJob::new("leaf").parent(job).planned())
                .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn leaf<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.fail_job(job).await?;
            Ok(())
        })
    }
}

impl Workflow for Relay {
    const IDENTIFIER: &'static str = "relay";

    fn stages() -> Stages<Self> {
        Stages::new("prepare")
            .stage("prepare", Self::prepare)
            .stage("step", Self::step)
            .stage("leaf", Self::leaf)
    }
}

/// Two branches that a merge job waits on.
///
/// With `linger_ms` in the root's data, each branch keeps its transaction
/// open that long after completing.
#[derive(Default)]
pub struct Join;

impl Join {
    fn prepare<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let branch_data = match job.data.get::<u64>("linger_ms")? {
                Some(ms) => JobData::new().with("linger_ms", ms),
                None => JobData::new(),
            };
            let left = ctx
                .create_job(
                    process,
                    NewJob::new("branch").data(branch_data.clone()).parent(job),
                )
                .await?;
            let right = ctx
                .create_job(process, NewJob::new("branch").data(branch_data).parent(job))
                .await?;
            ctx.create_job(
                process,
                NewJob::new("merge")
                    .parents([left.id, right.id])
                    .planned(),
            )
            .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn finish<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        _process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            ctx.done_job(job).await?;
            if let Some(ms) = job.data.get::<u64>("linger_ms")? {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(())
        })
    }
}

impl Workflow for Join {
    const IDENTIFIER: &'static str = "join";

    fn stages() -> Stages<Self> {
        Stages::new("prepare")
            .stage("prepare", Self::prepare)
            .stage("branch", Self::finish)
            .stage("merge", Self::finish)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Registry with every fixture workflow.
pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry
        .register::<FanOut>()
        .and_then(|r| r.register::<BlockingFanOut>())
        .and_then(|r| r.register::<Collection>())
        .and_then(|r| r.register::<Flaky>())
        .and_then(|r| r.register::<Chain>())
        .and_then(|r| r.register::<Relay>())
        .and_then(|r| r.register::<Join>())
        .expect("fixture workflows are valid");
    registry
}

/// Settings for tests: drain the queue and stop, never hang.
pub fn test_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: Duration::from_millis(10),
        debounce: Duration::from_secs(60),
        concurrency: 1,
        stop_when_empty: true,
        timeout: Some(Duration::from_secs(30)),
    }
}

/// Fresh in-memory SQLite database.
pub async fn sqlite_persistence() -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite persistence"),
    )
}

/// Manager with all fixtures over a fresh in-memory SQLite database.
pub async fn sqlite_manager() -> Manager {
    Manager::new(sqlite_persistence().await, registry(), test_config())
}

/// PostgreSQL persistence from `TEST_DATABASE_URL`, migrated.
pub async fn postgres_persistence() -> Option<Arc<dyn Persistence>> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let persistence = PostgresPersistence::connect(&database_url, 5).await.ok()?;
    Some(Arc::new(persistence))
}

/// Run passes until none is runnable, at most `limit` of them.
pub async fn drain(manager: &Manager, limit: usize) -> usize {
    let mut passes = 0;
    while passes < limit {
        match manager.run_once().await.expect("scheduling pass failed") {
            Some(_) => passes += 1,
            None => break,
        }
    }
    passes
}

/// Messages of a job's log, oldest first.
pub async fn job_messages(persistence: &Arc<dyn Persistence>, job_id: i64) -> Vec<String> {
    persistence
        .list_job_logs(job_id)
        .await
        .expect("list job logs")
        .into_iter()
        .map(|l| l.message)
        .collect()
}

/// Messages of a process' log, oldest first.
pub async fn process_messages(persistence: &Arc<dyn Persistence>, process_id: i64) -> Vec<String> {
    persistence
        .list_process_logs(process_id)
        .await
        .expect("list process logs")
        .into_iter()
        .map(|l| l.message)
        .collect()
}

/// All jobs of a process in creation order.
pub async fn process_jobs(persistence: &Arc<dyn Persistence>, process_id: i64) -> Vec<Job> {
    persistence
        .list_process_jobs(process_id)
        .await
        .expect("list process jobs")
}

/// Re-read a job that must exist.
pub async fn reload_job(persistence: &Arc<dyn Persistence>, job_id: i64) -> Job {
    persistence
        .get_job(job_id)
        .await
        .expect("get job")
        .expect("job exists")
}

/// Re-read a process that must exist.
pub async fn reload_process(persistence: &Arc<dyn Persistence>, process_id: i64) -> Process {
    persistence
        .get_process(process_id)
        .await
        .expect("get process")
        .expect("process exists")
}
