// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::manager::ManagerConfig;
use crate::persistence::{Persistence, PostgresPersistence, SqlitePersistence};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Connection pool size
    pub max_connections: u32,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Retry delay after a stage error
    pub debounce: Duration,
    /// Concurrent scheduler workers
    pub concurrency: usize,
}

/// Shortest retry delay a deployment may configure.
const MIN_DEBOUNCE_SECS: u64 = 60;

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `JOBFLOW_DATABASE_URL`: `postgres://...` or `sqlite:...` connection string
    ///
    /// Optional (with defaults):
    /// - `JOBFLOW_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `JOBFLOW_POLL_INTERVAL_MS`: idle poll interval (default: 1000)
    /// - `JOBFLOW_DEBOUNCE_SECS`: retry delay after a stage error, at least 60 (default: 60)
    /// - `JOBFLOW_CONCURRENCY`: scheduler workers (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("JOBFLOW_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("JOBFLOW_DATABASE_URL"))?;

        if !(database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
            || database_url.starts_with("sqlite:"))
        {
            return Err(ConfigError::Invalid(
                "JOBFLOW_DATABASE_URL",
                "must start with postgres://, postgresql:// or sqlite:",
            ));
        }

        let max_connections: u32 = std::env::var("JOBFLOW_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "JOBFLOW_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let poll_interval_ms: u64 = std::env::var("JOBFLOW_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("JOBFLOW_POLL_INTERVAL_MS", "must be a number of milliseconds")
            })?;

        let debounce_secs: u64 = std::env::var("JOBFLOW_DEBOUNCE_SECS")
            .unwrap_or_else(|_| MIN_DEBOUNCE_SECS.to_string())
            .parse()
            .ok()
            .filter(|secs| *secs >= MIN_DEBOUNCE_SECS)
            .ok_or(ConfigError::Invalid(
                "JOBFLOW_DEBOUNCE_SECS",
                "must be a number of seconds, at least 60",
            ))?;

        let concurrency: usize = std::env::var("JOBFLOW_CONCURRENCY")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "JOBFLOW_CONCURRENCY",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            max_connections,
            poll_interval: Duration::from_millis(poll_interval_ms),
            debounce: Duration::from_secs(debounce_secs),
            concurrency,
        })
    }

    /// Scheduler settings derived from this configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            poll_interval: self.poll_interval,
            debounce: self.debounce,
            concurrency: self.concurrency,
            ..ManagerConfig::default()
        }
    }

    /// Whether the URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

/// Open the backend named by the URL scheme and run its migrations.
pub async fn connect(config: &Config) -> Result<Arc<dyn Persistence>, EngineError> {
    if config.is_sqlite() {
        let persistence = if config.database_url.contains(":memory:") {
            SqlitePersistence::in_memory().await?
        } else {
            SqlitePersistence::connect(&config.database_url, config.max_connections).await?
        };
        Ok(Arc::new(persistence))
    } else {
        let persistence =
            PostgresPersistence::connect(&config.database_url, config.max_connections).await?;
        Ok(Arc::new(persistence))
    }
}
