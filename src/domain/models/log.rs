//! Log entry and orchestration state models.
//!
//! Every task transition, output, and compensation attempt is an immutable
//! entry in a per-orchestration append-only log. Workers reconstruct state
//! by replaying entries in offset order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::orchestration::Status;
use crate::domain::models::plan::ExecutionPlan;

/// The kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    TaskOutput,
    TaskInterimOutput,
    TaskAbortedOutput,
    TaskStatus,
    TaskFailure,
    CompensationStored,
    CompensationAttempted,
    CompensationComplete,
    CompensationPartial,
    CompensationFailure,
    CompensationExpired,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskOutput => "task_output",
            Self::TaskInterimOutput => "task_interim_output",
            Self::TaskAbortedOutput => "task_aborted_output",
            Self::TaskStatus => "task_status",
            Self::TaskFailure => "task_failure",
            Self::CompensationStored => "compensation_stored",
            Self::CompensationAttempted => "compensation_attempted",
            Self::CompensationComplete => "compensation_complete",
            Self::CompensationPartial => "compensation_partial",
            Self::CompensationFailure => "compensation_failure",
            Self::CompensationExpired => "compensation_expired",
        }
    }
}

/// An immutable log entry.
///
/// `offset` is assigned by the log at append time, monotone and dense from
/// zero. `id` is unique per log; a second append with the same id is
/// silently ignored. `value` is an opaque payload, JSON by convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub offset: u64,
    pub entry_type: EntryType,
    pub id: String,
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub producer_id: String,
    #[serde(default)]
    pub attempt_num: u32,
}

impl LogEntry {
    /// An entry as handed to the log, before an offset is assigned.
    pub fn new(
        entry_type: EntryType,
        id: impl Into<String>,
        value: Vec<u8>,
        producer_id: impl Into<String>,
        attempt_num: u32,
    ) -> Self {
        Self {
            offset: 0,
            entry_type,
            id: id.into(),
            value,
            timestamp: Utc::now(),
            producer_id: producer_id.into(),
            attempt_num,
        }
    }

    pub fn value_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }
}

/// Payload of a `task_status` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusPayload {
    pub task_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Durable per-orchestration state persisted beside the log for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    #[serde(default)]
    pub tasks_statuses: HashMap<String, Status>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestrationState {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, plan: Option<ExecutionPlan>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            plan,
            tasks_statuses: HashMap::new(),
            status: Status::Processing,
            created_at: now,
            last_updated: now,
            error: None,
        }
    }
}
