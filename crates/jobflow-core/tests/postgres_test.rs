// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL backend tests.
//!
//! These share one database with whatever else runs against it, so jobs are
//! driven with `run_job` rather than by draining the queue.

mod common;

use chrono::Utc;
use common::*;
use jobflow_core::{
    ConfigRef, JobData, JobOutcome, JobStatus, ListProcessesFilter, Manager, ProcessStatus,
};
use uuid::Uuid;

async fn manager() -> Option<Manager> {
    let persistence = postgres_persistence().await?;
    Some(Manager::new(persistence, registry(), test_config()))
}

#[tokio::test]
async fn test_postgres_fan_out_lifecycle() {
    skip_if_no_db!();
    let Some(manager) = manager().await else {
        eprintln!("Skipping test: failed to connect to PostgreSQL");
        return;
    };
    let persistence = manager.persistence().clone();

    let (process, root) = manager
        .create_process::<FanOut>(None, None, None)
        .await
        .unwrap();

    assert_eq!(manager.run_job(root.id).await.unwrap(), JobOutcome::Succeeded);
    let children = persistence.job_children(root.id).await.unwrap();
    assert_eq!(children.len(), FanOut::CHILDREN);

    for child in &children {
        assert_eq!(child.status, JobStatus::Active);
        assert_eq!(manager.run_job(child.id).await.unwrap(), JobOutcome::Succeeded);
    }

    let process = reload_process(&persistence, process.id).await;
    assert_eq!(process.status, ProcessStatus::Done);

    let root_done_at = reload_job(&persistence, root.id).await.done_at.unwrap();
    for child in persistence.job_children(root.id).await.unwrap() {
        assert!(child.touched_at >= root_done_at);
    }
}

#[tokio::test]
async fn test_postgres_failed_collection_is_listed_by_config() {
    skip_if_no_db!();
    let Some(manager) = manager().await else {
        eprintln!("Skipping test: failed to connect to PostgreSQL");
        return;
    };
    let persistence = manager.persistence().clone();
    let config = ConfigRef::new("collection_config", Uuid::new_v4());

    let (process, job) = manager
        .create_process::<Collection>(
            Some(config.clone()),
            None,
            Some(JobData::new().with("total", 1.5)),
        )
        .await
        .unwrap();

    assert_eq!(manager.run_job(job.id).await.unwrap(), JobOutcome::Failed);

    let listed = persistence
        .list_processes(
            &ListProcessesFilter {
                config: Some(config),
                status: Some(ProcessStatus::Failed),
                ..Default::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, process.id);

    let messages = process_messages(&persistence, process.id).await;
    assert!(messages.iter().any(|m| m == Collection::TOO_LOW));
}

#[tokio::test]
async fn test_postgres_stage_error_rolls_back_and_debounces() {
    skip_if_no_db!();
    let Some(manager) = manager().await else {
        eprintln!("Skipping test: failed to connect to PostgreSQL");
        return;
    };
    let persistence = manager.persistence().clone();

    let (_process, job) = manager
        .create_process::<Flaky>(None, None, None)
        .await
        .unwrap();

    let before = Utc::now();
    assert_eq!(manager.run_job(job.id).await.unwrap(), JobOutcome::Debounced);

    let job = reload_job(&persistence, job.id).await;
    assert!(job.data.get_value("attempted").is_none());
    assert!(job.debounced_till.unwrap() >= before + chrono::TimeDelta::seconds(60));
}

#[tokio::test]
async fn test_postgres_locked_job_is_skipped_by_claim() {
    skip_if_no_db!();
    let Some(manager) = manager().await else {
        eprintln!("Skipping test: failed to connect to PostgreSQL");
        return;
    };
    let persistence = manager.persistence().clone();

    let (_process, job) = manager
        .create_process::<Chain>(None, None, None)
        .await
        .unwrap();

    let mut holder = persistence.begin().await.unwrap();
    let locked = holder.lock_job(job.id).await.unwrap().unwrap();
    assert_eq!(locked.id, job.id);

    let mut other = persistence.begin().await.unwrap();
    let claimed = other.claim_next_job(Utc::now()).await.unwrap();
    assert!(claimed.is_none_or(|c| c.id != job.id));
    other.rollback().await.unwrap();

    holder.rollback().await.unwrap();

    // Leave nothing runnable behind.
    manager.force_done_job(job.id).await.unwrap();
}

#[tokio::test]
async fn test_postgres_parents_finishing_together_activate_merge() {
    skip_if_no_db!();
    let Some(manager) = manager().await else {
        eprintln!("Skipping test: failed to connect to PostgreSQL");
        return;
    };
    let persistence = manager.persistence().clone();

    let (process, root) = manager
        .create_process::<Join>(None, None, Some(JobData::new().with("linger_ms", 300u64)))
        .await
        .unwrap();
    assert_eq!(manager.run_job(root.id).await.unwrap(), JobOutcome::Succeeded);

    let branches = persistence.job_children(root.id).await.unwrap();
    assert_eq!(branches.len(), 2);

    // Both branches complete while the other's transaction is still open.
    let (left, right) = tokio::join!(
        manager.run_job(branches[0].id),
        manager.run_job(branches[1].id)
    );
    assert_eq!(left.unwrap(), JobOutcome::Succeeded);
    assert_eq!(right.unwrap(), JobOutcome::Succeeded);

    let merge = persistence.job_children(branches[0].id).await.unwrap().remove(0);
    assert_eq!(merge.stage, "merge");
    assert_eq!(merge.status, JobStatus::Active);

    assert_eq!(manager.run_job(merge.id).await.unwrap(), JobOutcome::Succeeded);
    assert_eq!(reload_process(&persistence, process.id).await.status, ProcessStatus::Done);
}
