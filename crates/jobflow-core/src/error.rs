// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for jobflow-core.
//!
//! Every fallible engine operation returns [`EngineError`]. Stage functions
//! return `anyhow::Result<()>`, and `EngineError` converts into `anyhow::Error`
//! so lifecycle helpers can be called with `?` inside a stage.

use thiserror::Error;

use crate::model::{JobId, ProcessId};

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the workflow engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// `create_job` referenced a stage the workflow does not declare.
    #[error("Workflow '{workflow}' has no stage named '{stage}'")]
    InvalidStage {
        /// Identifier of the workflow.
        workflow: String,
        /// The stage name that was requested.
        stage: String,
    },

    /// The stored workflow identifier is not registered.
    #[error("Workflow '{0}' is not registered")]
    WorkflowNotFound(String),

    /// A workflow definition does not satisfy the registration contract.
    #[error("Workflow '{identifier}' is not a valid workflow type: {reason}")]
    InvalidWorkflowType {
        /// Identifier of the offending workflow.
        identifier: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A job or process status transition that is not allowed.
    #[error("Illegal transition for {entity} {id}: cannot move from '{from}' to '{to}'")]
    IllegalTransition {
        /// "job" or "process".
        entity: &'static str,
        /// Row id of the job or process.
        id: i64,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Job was not found.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// Process was not found.
    #[error("Process {0} not found")]
    ProcessNotFound(ProcessId),

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Async runtime setup or a blocking task failed.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidStage { .. } => "INVALID_STAGE",
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::InvalidWorkflowType { .. } => "INVALID_WORKFLOW_TYPE",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Runtime(_) => "RUNTIME_ERROR",
        }
    }

    /// Whether retrying the same call later can possibly succeed.
    ///
    /// Registration and stage-resolution problems are fixed by deploying code,
    /// not by waiting.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidStage { .. }
                | Self::InvalidWorkflowType { .. }
                | Self::IllegalTransition { .. }
        )
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
