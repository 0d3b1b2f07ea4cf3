// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobflow Core - Durable Workflow Execution Engine
//!
//! Drives long-running, multi-step business processes through named stages.
//! A **process** is one run of a **workflow**; its work is split into **jobs**,
//! each of which invokes one stage. Jobs form a DAG: a job only becomes
//! runnable once all of its parents have succeeded.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Callers (worker CLI, services)               │
//! │      create_process · status queries · admin operations      │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Manager                              │
//! │   claim job (row lock) → run stage → debounce/touch → commit │
//! └──────────────────────────────────────────────────────────────┘
//!           │                                     │
//!           ▼                                     ▼
//! ┌────────────────────────┐        ┌─────────────────────────────┐
//! │   WorkflowRegistry     │        │   StageContext              │
//! │ identifier → stages    │        │ create_job · done_job ·     │
//! └────────────────────────┘        │ fail_job · done_process ... │
//!                                   └─────────────────────────────┘
//!                                                 │
//!                                                 ▼
//!                                   ┌─────────────────────────────┐
//!                                   │ Persistence (Postgres/SQLite)│
//!                                   └─────────────────────────────┘
//! ```
//!
//! # Job lifecycle
//!
//! | From | To | Through |
//! |------|----|---------|
//! | Planned | Active | all parents reached Success |
//! | Active | Success | `done_job` |
//! | Active | Failed | `fail_job`, or a failed descendant outside the default stage |
//! | Planned/Active | Canceled | operator `cancel_job` |
//!
//! `done_job` on a Failed job and `fail_job` on a Successful job are
//! [`EngineError::IllegalTransition`]; repeating a transition is a no-op.
//!
//! # Scheduling
//!
//! The manager picks the Active job with the oldest `touched_at` whose
//! `debounced_till` has passed, locks it, and runs its stage. Every pass
//! touches the job, moving it to the back of the queue. A stage that returns
//! an error has its writes rolled back and is retried after the debounce
//! window (one minute by default); it is never failed automatically.
//!
//! # Configuration
//!
//! See [`Config::from_env`] for the environment variables read by workers.

#![deny(missing_docs)]

/// Environment configuration and backend selection.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Scheduler loop, blocking front end and administrative operations.
pub mod manager;

/// Embedded database migrations.
pub mod migrations;

/// Processes, jobs, their data documents and audit logs.
pub mod model;

/// Storage interface with PostgreSQL and SQLite backends.
pub mod persistence;

/// Workflow registration and lookup.
pub mod registry;

/// Workflow definitions and the lifecycle helpers used by stages.
pub mod workflow;

pub use config::{Config, ConfigError, connect};
pub use error::{EngineError, Result};
pub use manager::{
    BlockingManager, JobOutcome, Manager, ManagerConfig, RunSummary, ShutdownHandle,
    TriggerOutcome,
};
pub use model::{
    ConfigRef, Job, JobData, JobId, JobLog, JobStatus, Process, ProcessId, ProcessLog,
    ProcessStatus,
};
pub use persistence::{
    ListProcessesFilter, Persistence, PostgresPersistence, SqlitePersistence, Transaction,
};
pub use registry::WorkflowRegistry;
pub use workflow::{
    BlockingContext, BoxFuture, NewJob, ResolvedWorkflow, StageContext, Stages, Workflow,
    WorkflowMeta,
};
