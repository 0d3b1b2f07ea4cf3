// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobflow Worker - runs the scheduler and operator commands
//!
//! Every command reads its database settings from the environment (see
//! `jobflow_core::Config::from_env`); a `.env` file is honoured.

mod workflows;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use jobflow_core::{
    BlockingManager, Config, JobData, JobOutcome, Manager, PostgresPersistence, RunSummary,
    SqlitePersistence, connect,
};

/// Durable job scheduler worker.
#[derive(Parser)]
#[command(name = "jobflow-worker", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler with concurrent workers.
    Run {
        /// Number of worker tasks (defaults to JOBFLOW_CONCURRENCY).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Exit once no job is runnable.
        #[arg(long)]
        until_empty: bool,

        /// Exit after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Run the scheduler one job at a time on the main thread.
    RunBlocking {
        /// Exit after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Exit once no job is runnable.
        #[arg(long)]
        until_empty: bool,
    },

    /// Apply database migrations and exit.
    Migrate,

    /// Start a process of a registered workflow.
    Start {
        /// Workflow identifier.
        workflow: String,

        /// Stage of the first job (defaults to the workflow's default stage).
        #[arg(long)]
        stage: Option<String>,

        /// JSON object used as the first job's data.
        #[arg(long)]
        data: Option<String>,
    },

    /// Print a process with its jobs and logs.
    Status {
        /// Process id.
        process_id: i64,
    },

    /// Make a debounced job runnable again.
    ResetDebounce {
        /// Job id.
        job_id: i64,
    },

    /// Run one Active job now, ignoring its debounce.
    RunJob {
        /// Job id.
        job_id: i64,
    },

    /// Force a job to Success without running triggers.
    ForceDone {
        /// Job id.
        job_id: i64,

        /// Also activate ready children and check process completion.
        #[arg(long)]
        triggers: bool,
    },

    /// Force a job to Failed without cascading.
    ForceFail {
        /// Job id.
        job_id: i64,

        /// Also check process completion.
        #[arg(long)]
        triggers: bool,
    },

    /// Cancel a Planned or Active job.
    Cancel {
        /// Job id.
        job_id: i64,
    },
}

fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jobflow=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        backend = if config.is_sqlite() { "sqlite" } else { "postgres" },
        max_connections = config.max_connections,
        concurrency = config.concurrency,
        "Configuration loaded"
    );

    // The blocking manager owns its runtime and must not be built inside one.
    if let Command::RunBlocking {
        timeout,
        until_empty,
    } = cli.command
    {
        return run_blocking(config, timeout, until_empty);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run_command(cli.command, config))
}

fn run_blocking(config: Config, timeout: Option<u64>, until_empty: bool) -> Result<()> {
    let mut manager_config = config.manager_config();
    manager_config.stop_when_empty = until_empty;

    let manager = BlockingManager::build(manager_config, workflows::registry()?, || {
        connect(&config)
    })?;

    let handle = manager.shutdown_handle();
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        else {
            return;
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            info!("Shutting down...");
            handle.shutdown();
        }
    });

    print_summary(manager.run(timeout.map(Duration::from_secs)))
}

async fn run_command(command: Command, config: Config) -> Result<()> {
    if let Command::Migrate = command {
        migrate(&config).await?;
        info!("Migrations completed");
        return Ok(());
    }

    let persistence = connect(&config).await?;
    if !persistence.health_check_db().await? {
        bail!("database health check failed");
    }
    info!("Database connection established");

    let mut manager_config = config.manager_config();
    if let Command::Run {
        concurrency,
        until_empty,
        timeout,
    } = &command
    {
        if let Some(concurrency) = concurrency {
            manager_config.concurrency = (*concurrency).max(1);
        }
        manager_config.stop_when_empty = *until_empty;
        manager_config.timeout = timeout.map(Duration::from_secs);
    }

    let manager = Manager::new(persistence, workflows::registry()?, manager_config);

    match command {
        Command::Run { .. } => {
            let handle = manager.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down...");
                    handle.shutdown();
                }
            });

            print_summary(manager.run().await)
        }
        Command::Start {
            workflow,
            stage,
            data,
        } => {
            let data = match data {
                Some(raw) => Some(JobData::from_value(
                    serde_json::from_str(&raw).context("--data must be valid JSON")?,
                )?),
                None => None,
            };
            let (process, job) = manager
                .create_process_for(&workflow, None, stage.as_deref(), data)
                .await?;
            print_json(&serde_json::json!({ "process": process, "job": job }))
        }
        Command::Status { process_id } => status(&manager, process_id).await,
        Command::ResetDebounce { job_id } => print_json(&manager.reset_debounce(job_id).await?),
        Command::RunJob { job_id } => {
            let outcome = manager.run_job(job_id).await?;
            println!("{}", outcome_label(outcome));
            Ok(())
        }
        Command::ForceDone { job_id, triggers } => {
            let job = manager.force_done_job(job_id).await?;
            if triggers {
                manager.run_triggers(job_id).await?;
            }
            print_json(&job)
        }
        Command::ForceFail { job_id, triggers } => {
            let job = manager.force_fail_job(job_id).await?;
            if triggers {
                manager.run_triggers(job_id).await?;
            }
            print_json(&job)
        }
        Command::Cancel { job_id } => print_json(&manager.cancel_job(job_id).await?),
        Command::Migrate | Command::RunBlocking { .. } => Ok(()),
    }
}

async fn migrate(config: &Config) -> Result<()> {
    info!("Running database migrations...");
    if config.is_sqlite() {
        SqlitePersistence::connect(&config.database_url, config.max_connections).await?;
    } else {
        PostgresPersistence::connect(&config.database_url, config.max_connections).await?;
    }
    Ok(())
}

async fn status(manager: &Manager, process_id: i64) -> Result<()> {
    let persistence = manager.persistence();
    let process = persistence
        .get_process(process_id)
        .await?
        .with_context(|| format!("process {} not found", process_id))?;

    let mut jobs = Vec::new();
    for job in persistence.list_process_jobs(process_id).await? {
        let parents: Vec<i64> = persistence
            .job_parents(job.id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        let logs = persistence.list_job_logs(job.id).await?;
        jobs.push(serde_json::json!({
            "job": job,
            "parents": parents,
            "logs": logs,
        }));
    }

    print_json(&serde_json::json!({
        "process": process,
        "logs": persistence.list_process_logs(process_id).await?,
        "jobs": jobs,
    }))
}

fn outcome_label(outcome: JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Succeeded => "succeeded",
        JobOutcome::Failed => "failed",
        JobOutcome::Debounced => "debounced",
        JobOutcome::Pending => "pending",
    }
}

fn print_summary(summary: RunSummary) -> Result<()> {
    print_json(&serde_json::json!({
        "executed": summary.executed,
        "succeeded": summary.succeeded,
        "failed": summary.failed,
        "debounced": summary.debounced,
    }))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
