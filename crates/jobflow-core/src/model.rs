// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model: processes, jobs and their audit logs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Row id of a process.
pub type ProcessId = i64;

/// Row id of a job.
pub type JobId = i64;

/// Lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Still has work in flight.
    Active,
    /// Completed successfully.
    Done,
    /// Failed through an explicit `fail_process`.
    Failed,
}

impl ProcessStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Done and Failed are final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(EngineError::validation(
                "status",
                format!("unknown process status '{}'", other),
            )),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for its parents to succeed.
    Planned,
    /// Eligible for scheduling.
    Active,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failed,
    /// Stopped by an operator.
    Canceled,
}

impl JobStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Active => "active",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Success, Failed and Canceled are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Whether this status counts as finished for process completion.
    ///
    /// Only Success and Failed do; a canceled job keeps its process open
    /// until an operator finalizes the process.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "active" => Ok(Self::Active),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(EngineError::validation(
                "status",
                format!("unknown job status '{}'", other),
            )),
        }
    }
}

/// Polymorphic pointer to the external object that configures a process
/// (for example a collection configuration owned by another service).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRef {
    /// Type of the referenced object.
    pub kind: String,
    /// Id of the referenced object, as a string.
    pub id: String,
}

impl ConfigRef {
    /// Create a new config reference.
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

/// Schema-less JSON document attached to jobs and processes.
///
/// Any stage may stash structured data here for later stages. Updates are
/// shallow: top-level keys of the update replace existing keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobData(Map<String, Value>);

impl JobData {
    /// Empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(EngineError::validation(
                "data",
                format!("expected a JSON object, got {}", other),
            )),
        }
    }

    /// Serialize a typed value into a document.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, EngineError> {
        Self::from_value(serde_json::to_value(value)?)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Raw access to a key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Typed access to a key. Returns `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, EngineError> {
        match self.0.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Deserialize the whole document into a typed struct.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    /// Shallow merge: keys from `other` overwrite keys in `self`.
    pub fn merge(&mut self, other: JobData) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    /// Whether the document has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The document as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for JobData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Display for JobData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// One instantiation of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Process {
    /// Row id.
    pub id: ProcessId,
    /// Identifier of the workflow that drives this process.
    pub workflow: String,
    /// External configuration object, if any.
    pub config: Option<ConfigRef>,
    /// Free-form process data.
    pub data: JobData,
    /// Lifecycle status.
    pub status: ProcessStatus,
    /// Set iff the status is terminal.
    pub done_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One invocation of one stage within a process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    /// Row id.
    pub id: JobId,
    /// Owning process.
    pub process_id: ProcessId,
    /// Stage to invoke on the process' workflow.
    pub stage: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Free-form job data.
    pub data: JobData,
    /// Not eligible for scheduling before this time.
    pub debounced_till: Option<DateTime<Utc>>,
    /// When the job reached Success or Failed.
    pub done_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Queue ordering key; advanced on every scheduling pass.
    pub touched_at: DateTime<Utc>,
}

impl Job {
    /// Whether the scheduler may pick this job at `now`, ignoring parents.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.debounced_till.is_none_or(|till| till <= now)
    }
}

/// Audit entry attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct JobLog {
    /// Row id.
    pub id: i64,
    /// Owning job.
    pub job_id: JobId,
    /// Free-text message.
    pub message: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Audit entry attached to a process.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ProcessLog {
    /// Row id.
    pub id: i64,
    /// Owning process.
    pub process_id: ProcessId,
    /// Free-text message.
    pub message: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip_through_storage_strings() {
        for status in [
            JobStatus::Planned,
            JobStatus::Active,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
        assert_eq!("done".parse::<ProcessStatus>().unwrap(), ProcessStatus::Done);
    }

    #[test]
    fn test_terminal_and_finished() {
        assert!(!JobStatus::Planned.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Canceled.is_finished());
        assert!(JobStatus::Failed.is_finished());
        assert!(ProcessStatus::Failed.is_terminal());
    }

    #[test]
    fn test_merge_is_shallow_and_overwrites() {
        let mut data = JobData::from_value(json!({
            "amount": 10,
            "meta": {"a": 1, "b": 2},
            "keep": true
        }))
        .unwrap();

        data.merge(JobData::from_value(json!({"amount": 25, "meta": {"c": 3}})).unwrap());

        assert_eq!(
            data.to_value(),
            json!({"amount": 25, "meta": {"c": 3}, "keep": true})
        );
    }

    #[test]
    fn test_from_value_rejects_non_objects() {
        assert!(JobData::from_value(json!([1, 2])).is_err());
        assert!(JobData::from_value(json!("text")).is_err());
        assert!(JobData::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_typed_access() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Payload {
            url: String,
            retries: u32,
        }

        let data = JobData::new()
            .with("url", "https://example.com/a.zip")
            .with("retries", 3);

        assert_eq!(data.get::<u32>("retries").unwrap(), Some(3));
        assert_eq!(data.get::<u32>("missing").unwrap(), None);
        assert!(data.get::<u32>("url").is_err());
        assert_eq!(
            data.to_typed::<Payload>().unwrap(),
            Payload {
                url: "https://example.com/a.zip".to_string(),
                retries: 3
            }
        );
    }

    #[test]
    fn test_job_is_due() {
        let now = Utc::now();
        let mut job = Job {
            id: 1,
            process_id: 1,
            stage: "prepare".to_string(),
            status: JobStatus::Active,
            data: JobData::new(),
            debounced_till: None,
            done_at: None,
            created_at: now,
            touched_at: now,
        };
        assert!(job.is_due(now));

        job.debounced_till = Some(now + chrono::Duration::seconds(60));
        assert!(!job.is_due(now));
        assert!(job.is_due(now + chrono::Duration::seconds(60)));

        job.debounced_till = None;
        job.status = JobStatus::Planned;
        assert!(!job.is_due(now));
    }
}
