// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflows shipped with the worker.
//!
//! `downloads` fans a list of URLs out into independent download jobs and
//! joins them into one summary. `collection` sums the contributions of a fund
//! collection and fails the process when the total stays under the minimum.

use anyhow::Context;
use jobflow_core::{
    BoxFuture, Job, JobData, NewJob, Process, StageContext, Stages, Workflow, WorkflowRegistry,
};
use tracing::debug;

/// Every workflow this binary can run.
pub fn registry() -> anyhow::Result<WorkflowRegistry> {
    let mut registry = WorkflowRegistry::new();
    registry
        .register::<Downloads>()?
        .register::<Collection>()?;
    Ok(registry)
}

// ============================================================================
// downloads
// ============================================================================

/// prepare → one `download` job per URL → `join`.
///
/// First job data: `{"urls": ["https://...", ...]}`.
#[derive(Default)]
pub struct Downloads;

impl Downloads {
    fn prepare<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let urls: Vec<String> = job.data.get("urls")?.unwrap_or_default();
            if urls.is_empty() {
                ctx.done_process(process, Some(job), "Nothing to download")
                    .await?;
                return Ok(());
            }

            let mut downloads = Vec::with_capacity(urls.len());
            for url in urls {
                let download = ctx
                    .create_job(
                        process,
                        NewJob::new("download")
                            .data(JobData::new().with("url", url))
                            .parent(job)
                            .planned(),
                    )
                    .await?;
                downloads.push(download.id);
            }

            ctx.create_job(
                process,
                NewJob::new("join").parents(downloads).planned(),
            )
            .await?;

            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn download<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let url: String = job
                .data
                .get("url")?
                .context("download job has no url")?;

            if !(url.starts_with("https://") || url.starts_with("http://")) {
                ctx.fail_process(
                    process,
                    Some(job),
                    &format!("Cannot download '{}': unsupported scheme", url),
                )
                .await?;
                return Ok(());
            }

            // Transfer is simulated; the size stands in for the fetched body.
            let bytes = transfer_size(&url);
            debug!(%url, bytes, "Downloaded");

            ctx.update_job_data(job, JobData::new().with("bytes", bytes))
                .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn join<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let mut total = 0u64;
            let mut files = 0u64;
            for parent in ctx.parents(job).await? {
                total += parent.data.get::<u64>("bytes")?.unwrap_or(0);
                files += 1;
            }

            ctx.update_process_data(
                process,
                JobData::new()
                    .with("files", files)
                    .with("total_bytes", total),
            )
            .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }
}

impl Workflow for Downloads {
    const IDENTIFIER: &'static str = "downloads";

    fn stages() -> Stages<Self> {
        Stages::new("prepare")
            .stage("prepare", Self::prepare)
            .stage("download", Self::download)
            .stage("join", Self::join)
    }
}

fn transfer_size(url: &str) -> u64 {
    url.len() as u64 * 1024
}

// ============================================================================
// collection
// ============================================================================

/// collect → payout.
///
/// First job data: `{"contributions": [10.0, 25.5], "minimum": 100.0}`.
/// `minimum` defaults to [`Collection::DEFAULT_MINIMUM`].
#[derive(Default)]
pub struct Collection;

impl Collection {
    /// Minimum total when the job data does not set one.
    pub const DEFAULT_MINIMUM: f64 = 100.0;

    fn collect<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let contributions: Vec<f64> = job.data.get("contributions")?.unwrap_or_default();
            let minimum: f64 = job
                .data
                .get("minimum")?
                .unwrap_or(Self::DEFAULT_MINIMUM);
            let total: f64 = contributions.iter().sum();

            ctx.job_log(
                job,
                format!("Collected {} from {} contributions", total, contributions.len()),
            )
            .await?;

            if total < minimum {
                ctx.fail_process(process, Some(job), "Total amount is too low")
                    .await?;
                return Ok(());
            }

            ctx.update_process_data(process, JobData::new().with("total", total))
                .await?;
            ctx.create_job(
                process,
                NewJob::new("payout")
                    .data(JobData::new().with("amount", total))
                    .parent(job)
                    .planned(),
            )
            .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }

    fn payout<'a>(
        &'a self,
        ctx: &'a mut StageContext,
        process: &'a mut Process,
        job: &'a mut Job,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let amount: f64 = job.data.get("amount")?.context("payout job has no amount")?;
            ctx.process_log(process, format!("Payout of {} scheduled", amount))
                .await?;
            ctx.done_job(job).await?;
            Ok(())
        })
    }
}

impl Workflow for Collection {
    const IDENTIFIER: &'static str = "collection";

    fn stages() -> Stages<Self> {
        Stages::new("collect")
            .stage("collect", Self::collect)
            .stage("payout", Self::payout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::{
        JobStatus, Manager, ManagerConfig, ProcessStatus, SqlitePersistence,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn manager() -> Manager {
        let persistence = SqlitePersistence::in_memory().await.unwrap();
        Manager::new(
            Arc::new(persistence),
            registry().unwrap(),
            ManagerConfig {
                poll_interval: Duration::from_millis(10),
                stop_when_empty: true,
                timeout: Some(Duration::from_secs(30)),
                ..ManagerConfig::default()
            },
        )
    }

    #[test]
    fn test_registry_contains_samples() {
        let registry = registry().unwrap();
        assert_eq!(registry.identifiers(), vec!["collection", "downloads"]);
    }

    #[tokio::test]
    async fn test_downloads_join_sums_every_file() {
        let manager = manager().await;
        let urls = ["https://example.com/a.zip", "https://example.com/bb.zip"];
        let data = JobData::from_value(json!({ "urls": urls })).unwrap();

        let (process, _) = manager
            .create_process::<Downloads>(None, None, Some(data))
            .await
            .unwrap();
        let summary = manager.run().await;
        assert_eq!(summary.succeeded, 4);

        let process = manager
            .persistence()
            .get_process(process.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(process.status, ProcessStatus::Done);
        assert_eq!(process.data.get::<u64>("files").unwrap(), Some(2));
        assert_eq!(
            process.data.get::<u64>("total_bytes").unwrap(),
            Some(urls.iter().map(|u| transfer_size(u)).sum::<u64>())
        );
    }

    #[tokio::test]
    async fn test_downloads_rejects_unsupported_scheme() {
        let manager = manager().await;
        let data = JobData::from_value(json!({ "urls": ["ftp://example.com/a.zip"] })).unwrap();

        let (process, root) = manager
            .create_process::<Downloads>(None, None, Some(data))
            .await
            .unwrap();
        manager.run().await;

        let persistence = manager.persistence();
        let process = persistence.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(process.status, ProcessStatus::Failed);

        let download = persistence.job_children(root.id).await.unwrap().remove(0);
        assert_eq!(download.status, JobStatus::Failed);

        let logs = persistence.list_process_logs(process.id).await.unwrap();
        assert!(
            logs.iter()
                .any(|l| l.message == "Cannot download 'ftp://example.com/a.zip': unsupported scheme")
        );
    }

    #[tokio::test]
    async fn test_downloads_without_urls_finishes_immediately() {
        let manager = manager().await;
        let (process, _) = manager
            .create_process::<Downloads>(None, None, None)
            .await
            .unwrap();
        assert_eq!(manager.run().await.succeeded, 1);

        let logs = manager
            .persistence()
            .list_process_logs(process.id)
            .await
            .unwrap();
        assert_eq!(logs.last().unwrap().message, "Nothing to download");
    }

    #[tokio::test]
    async fn test_collection_under_minimum_fails_process() {
        let manager = manager().await;
        let data = JobData::from_value(json!({ "contributions": [10.0, 20.0] })).unwrap();

        let (process, job) = manager
            .create_process::<Collection>(None, None, Some(data))
            .await
            .unwrap();
        manager.run().await;

        let persistence = manager.persistence();
        let process = persistence.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(process.status, ProcessStatus::Failed);
        let job = persistence.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        let logs = persistence.list_process_logs(process.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message == "Total amount is too low"));
    }

    #[tokio::test]
    async fn test_collection_reaching_minimum_pays_out() {
        let manager = manager().await;
        let data =
            JobData::from_value(json!({ "contributions": [40.0, 35.0], "minimum": 75.0 })).unwrap();

        let (process, _) = manager
            .create_process::<Collection>(None, None, Some(data))
            .await
            .unwrap();
        assert_eq!(manager.run().await.succeeded, 2);

        let persistence = manager.persistence();
        let process = persistence.get_process(process.id).await.unwrap().unwrap();
        assert_eq!(process.status, ProcessStatus::Done);
        assert_eq!(process.data.get::<f64>("total").unwrap(), Some(75.0));

        let logs = persistence.list_process_logs(process.id).await.unwrap();
        assert!(logs.iter().any(|l| l.message == "Payout of 75 scheduled"));
    }
}
