//! Compensation models.
//!
//! Revertible services return a compensation payload beside their result;
//! when an orchestration fails or aborts, stored compensations are replayed
//! in reverse execution order. Exhausted or expired attempts become durable
//! `FailedCompensation` records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default wall-clock window a stored compensation remains actionable.
pub const DEFAULT_COMPENSATION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Maximum delivery attempts per compensation candidate.
pub const MAX_COMPENSATION_ATTEMPTS: u32 = 10;

/// The payload a revertible service stores for later rollback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompensationData {
    /// Input to send back to the service to undo its work.
    #[serde(default)]
    pub input: Value,
    /// Opaque service-side context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Time-to-live for this compensation, milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_ttl_ms() -> u64 {
    DEFAULT_COMPENSATION_TTL_MS
}

/// A task whose stored compensation is due for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationCandidate {
    pub task_id: String,
    pub service_id: String,
    pub service_name: String,
    pub compensation: CompensationData,
    /// When the compensation was stored; TTL counts from here.
    pub stored_at: DateTime<Utc>,
}

impl CompensationCandidate {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.stored_at + chrono::Duration::milliseconds(self.compensation.ttl_ms as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Outcome classification of one compensation candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationOutcome {
    Completed,
    Partial,
    Failed,
    Expired,
}

impl CompensationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

/// Operator-facing resolution of a failed compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    Open,
    Resolved,
    Ignored,
}

impl Default for ResolutionState {
    fn default() -> Self {
        Self::Open
    }
}

/// Durable record of a compensation that could not be delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCompensation {
    pub id: String,
    pub project_id: String,
    pub orchestration_id: String,
    pub task_id: String,
    pub service_id: String,
    pub service_name: String,
    pub compensation_data: CompensationData,
    /// `failed` or `expired`.
    pub status: String,
    #[serde(default)]
    pub resolution_state: ResolutionState,
    /// Last failure message observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Operator-entered resolution note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedCompensation {
    pub fn new(
        project_id: impl Into<String>,
        orchestration_id: impl Into<String>,
        candidate: &CompensationCandidate,
        outcome: CompensationOutcome,
        failure: Option<String>,
        attempts_made: u32,
    ) -> Self {
        Self {
            id: format!("fc_{}", Uuid::new_v4().simple()),
            project_id: project_id.into(),
            orchestration_id: orchestration_id.into(),
            task_id: candidate.task_id.clone(),
            service_id: candidate.service_id.clone(),
            service_name: candidate.service_name.clone(),
            compensation_data: candidate.compensation.clone(),
            status: outcome.as_str().to_string(),
            resolution_state: ResolutionState::Open,
            failure,
            resolution: None,
            attempts_made,
            max_attempts: MAX_COMPENSATION_ATTEMPTS,
            timestamp: Utc::now(),
            resolved_at: None,
        }
    }
}
