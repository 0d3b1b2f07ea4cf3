// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A workflow is a named set of stages. Each stage is a function that receives
//! the owning [`Process`] and the [`Job`] being run, plus a context through
//! which every state change goes:
//!
//! ```ignore
//! #[derive(Default)]
//! struct Downloads;
//!
//! impl Workflow for Downloads {
//!     const IDENTIFIER: &'static str = "downloads";
//!
//!     fn stages() -> Stages<Self> {
//!         Stages::new("prepare")
//!             .stage("prepare", Self::prepare)
//!             .blocking_stage("download", Self::download)
//!     }
//! }
//! ```
//!
//! Async stages run on the scheduler task and suspend at storage calls.
//! Blocking stages run on tokio's blocking pool and see the same lifecycle
//! helpers through [`BlockingContext`]. Both drive one implementation in
//! [`StageContext`], so the semantics cannot drift apart.

mod blocking;
mod context;

pub use blocking::BlockingContext;
pub use context::StageContext;
pub(crate) use context::{check_process_completion, log_job, run_children};

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::EngineError;
use crate::model::{Job, JobData, JobId, JobStatus, Process};

/// Boxed, sendable future returned by async stage functions.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A workflow definition.
///
/// `IDENTIFIER` is what gets stored on every process, so it must stay stable
/// across deployments.
pub trait Workflow: Sized + Send + Sync + 'static {
    /// Persisted identifier of this workflow.
    const IDENTIFIER: &'static str;

    /// The stages of this workflow and its default stage.
    fn stages() -> Stages<Self>;
}

type AsyncStageFn<W> = Arc<
    dyn for<'a> Fn(
            &'a W,
            &'a mut StageContext,
            &'a mut Process,
            &'a mut Job,
        ) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
>;

type BlockingStageFn<W> = Arc<
    dyn Fn(&W, &mut BlockingContext, &mut Process, &mut Job) -> anyhow::Result<()> + Send + Sync,
>;

pub(crate) enum StageHandler<W> {
    Async(AsyncStageFn<W>),
    Blocking(BlockingStageFn<W>),
}

impl<W> Clone for StageHandler<W> {
    fn clone(&self) -> Self {
        match self {
            Self::Async(f) => Self::Async(Arc::clone(f)),
            Self::Blocking(f) => Self::Blocking(Arc::clone(f)),
        }
    }
}

/// Stage table of a workflow, built once at registration.
pub struct Stages<W> {
    default_stage: String,
    entries: Vec<(String, StageHandler<W>)>,
}

impl<W: Workflow> Stages<W> {
    /// Start a stage table. `default_stage` is the stage new processes start
    /// in and where failure cascades stop.
    pub fn new(default_stage: impl Into<String>) -> Self {
        Self {
            default_stage: default_stage.into(),
            entries: Vec::new(),
        }
    }

    /// Declare an async stage.
    pub fn stage<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: for<'a> Fn(
                &'a W,
                &'a mut StageContext,
                &'a mut Process,
                &'a mut Job,
            ) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.entries
            .push((name.into(), StageHandler::Async(Arc::new(f))));
        self
    }

    /// Declare a stage that runs on the blocking thread pool.
    pub fn blocking_stage<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&W, &mut BlockingContext, &mut Process, &mut Job) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.entries
            .push((name.into(), StageHandler::Blocking(Arc::new(f))));
        self
    }

    /// Check the table and split it into metadata and handlers.
    pub(crate) fn validate(
        self,
        identifier: &str,
    ) -> Result<(WorkflowMeta, Vec<(String, StageHandler<W>)>), EngineError> {
        let invalid = |reason: String| EngineError::InvalidWorkflowType {
            identifier: identifier.to_string(),
            reason,
        };

        if identifier.trim().is_empty() {
            return Err(invalid("identifier must not be empty".to_string()));
        }
        if self.entries.is_empty() {
            return Err(invalid("no stages declared".to_string()));
        }

        let mut seen = HashSet::new();
        for (name, _) in &self.entries {
            if name.trim().is_empty() {
                return Err(invalid("stage names must not be empty".to_string()));
            }
            if !seen.insert(name.as_str()) {
                return Err(invalid(format!("stage '{}' is declared twice", name)));
            }
        }

        if !seen.contains(self.default_stage.as_str()) {
            return Err(invalid(format!(
                "default stage '{}' is not declared",
                self.default_stage
            )));
        }

        let meta = WorkflowMeta {
            identifier: identifier.to_string(),
            default_stage: self.default_stage,
            stages: self.entries.iter().map(|(name, _)| name.clone()).collect(),
        };

        Ok((meta, self.entries))
    }
}

/// Static facts about a registered workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowMeta {
    identifier: String,
    default_stage: String,
    stages: Vec<String>,
}

impl WorkflowMeta {
    /// Persisted identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Stage new processes start in.
    pub fn default_stage(&self) -> &str {
        &self.default_stage
    }

    /// Declared stage names, in declaration order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    /// Whether `stage` is declared.
    pub fn has_stage(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s == stage)
    }
}

/// Arguments for [`StageContext::create_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) stage: String,
    pub(crate) data: JobData,
    pub(crate) parents: Vec<JobId>,
    pub(crate) status: JobStatus,
}

impl NewJob {
    /// A root job in `stage`, Active, with empty data.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            data: JobData::new(),
            parents: Vec::new(),
            status: JobStatus::Active,
        }
    }

    /// Initial job data.
    pub fn data(mut self, data: JobData) -> Self {
        self.data = data;
        self
    }

    /// Add a parent. The job only becomes runnable after every parent succeeds.
    pub fn parent(mut self, parent: &Job) -> Self {
        self.parents.push(parent.id);
        self
    }

    /// Set all parents at once.
    pub fn parents(mut self, parents: impl IntoIterator<Item = JobId>) -> Self {
        self.parents.extend(parents);
        self
    }

    /// Create the job as Planned, to be activated when its parents succeed.
    pub fn planned(mut self) -> Self {
        self.status = JobStatus::Planned;
        self
    }

    /// Explicit initial status. Only Planned and Active are accepted.
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }
}

/// Outcome of invoking a stage: the context handed back plus the stage result.
pub(crate) type StageRun = (StageContext, anyhow::Result<()>);

/// Type-erased stage dispatch for one registered workflow.
pub(crate) trait StageDispatch: Send + Sync {
    fn meta(&self) -> &Arc<WorkflowMeta>;

    /// Run `job.stage`. Errors with `Runtime` when the stage task panicked, in
    /// which case the transaction is gone.
    fn invoke(
        &self,
        ctx: StageContext,
        process: Process,
        job: Job,
    ) -> BoxFuture<'static, Result<StageRun, EngineError>>;
}

pub(crate) struct Registered<W: Workflow> {
    pub(crate) workflow: Arc<W>,
    pub(crate) meta: Arc<WorkflowMeta>,
    pub(crate) handlers: Vec<(String, StageHandler<W>)>,
}

impl<W: Workflow> Registered<W> {
    fn handler(&self, stage: &str) -> Option<StageHandler<W>> {
        self.handlers
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, handler)| handler.clone())
    }
}

impl<W: Workflow> StageDispatch for Registered<W> {
    fn meta(&self) -> &Arc<WorkflowMeta> {
        &self.meta
    }

    fn invoke(
        &self,
        mut ctx: StageContext,
        mut process: Process,
        mut job: Job,
    ) -> BoxFuture<'static, Result<StageRun, EngineError>> {
        let workflow = Arc::clone(&self.workflow);
        let Some(handler) = self.handler(&job.stage) else {
            let stage = job.stage.clone();
            let identifier = self.meta.identifier().to_string();
            return Box::pin(async move {
                Ok((
                    ctx,
                    Err(EngineError::InvalidStage {
                        workflow: identifier,
                        stage,
                    }
                    .into()),
                ))
            });
        };

        Box::pin(async move {
            let task = match handler {
                StageHandler::Async(f) => tokio::spawn(async move {
                    let result = f(&workflow, &mut ctx, &mut process, &mut job).await;
                    (ctx, result)
                }),
                StageHandler::Blocking(f) => {
                    let handle = tokio::runtime::Handle::current();
                    tokio::task::spawn_blocking(move || {
                        let mut blocking = BlockingContext::new(ctx, handle);
                        let result = f(&workflow, &mut blocking, &mut process, &mut job);
                        (blocking.into_inner(), result)
                    })
                }
            };

            task.await
                .map_err(|e| EngineError::Runtime(format!("stage task failed: {}", e)))
        })
    }
}

/// A resolved workflow, ready to run stages.
#[derive(Clone)]
pub struct ResolvedWorkflow {
    inner: Arc<dyn StageDispatch>,
}

impl ResolvedWorkflow {
    pub(crate) fn new(inner: Arc<dyn StageDispatch>) -> Self {
        Self { inner }
    }

    /// Metadata of the workflow.
    pub fn meta(&self) -> &Arc<WorkflowMeta> {
        self.inner.meta()
    }

    /// Persisted identifier.
    pub fn identifier(&self) -> &str {
        self.inner.meta().identifier()
    }

    /// Stage new processes start in.
    pub fn default_stage(&self) -> &str {
        self.inner.meta().default_stage()
    }

    /// Whether `stage` is declared.
    pub fn has_stage(&self, stage: &str) -> bool {
        self.inner.meta().has_stage(stage)
    }

    pub(crate) fn invoke(
        &self,
        ctx: StageContext,
        process: Process,
        job: Job,
    ) -> BoxFuture<'static, Result<StageRun, EngineError>> {
        self.inner.invoke(ctx, process, job)
    }
}

impl std::fmt::Debug for ResolvedWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedWorkflow")
            .field("meta", self.inner.meta())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sketch;

    impl Sketch {
        fn start<'a>(
            &'a self,
            _ctx: &'a mut StageContext,
            _process: &'a mut Process,
            _job: &'a mut Job,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn sync_step(
            &self,
            _ctx: &mut BlockingContext,
            _process: &mut Process,
            _job: &mut Job,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl Workflow for Sketch {
        const IDENTIFIER: &'static str = "sketch";

        fn stages() -> Stages<Self> {
            Stages::new("start")
                .stage("start", Self::start)
                .blocking_stage("sync_step", Self::sync_step)
        }
    }

    #[test]
    fn test_validate_collects_meta() {
        let (meta, handlers) = Sketch::stages().validate(Sketch::IDENTIFIER).unwrap();
        assert_eq!(meta.identifier(), "sketch");
        assert_eq!(meta.default_stage(), "start");
        assert_eq!(meta.stages(), &["start".to_string(), "sync_step".to_string()]);
        assert!(meta.has_stage("sync_step"));
        assert!(!meta.has_stage("missing"));
        assert_eq!(handlers.len(), 2);
    }

    #[test]
    fn test_validate_rejects_missing_default() {
        let stages = Stages::<Sketch>::new("prepare").stage("start", Sketch::start);
        let err = stages.validate("sketch").err().unwrap();
        assert_eq!(err.error_code(), "INVALID_WORKFLOW_TYPE");
        assert!(err.to_string().contains("default stage 'prepare'"));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        let stages = Stages::<Sketch>::new("start")
            .stage("start", Sketch::start)
            .blocking_stage("start", Sketch::sync_step);
        assert!(stages.validate("sketch").is_err());

        assert!(Stages::<Sketch>::new("start").validate("sketch").is_err());

        let stages = Stages::<Sketch>::new("start").stage("start", Sketch::start);
        assert!(stages.validate("  ").is_err());
    }

    #[test]
    fn test_new_job_builder() {
        let job = NewJob::new("download")
            .data(JobData::new().with("url", "https://example.com"))
            .parents([1, 2])
            .planned();
        assert_eq!(job.stage, "download");
        assert_eq!(job.parents, vec![1, 2]);
        assert_eq!(job.status, JobStatus::Planned);
        assert_eq!(NewJob::new("x").status, JobStatus::Active);
    }
}
