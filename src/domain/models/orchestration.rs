//! Orchestration domain model.
//!
//! One orchestration is one user action being executed as a plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::models::grounding::GroundingHit;
use crate::domain::models::plan::ExecutionPlan;

/// Status of an orchestration, also used as the per-task status label in
/// log entries and orchestration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Processing,
    /// Transient per-task label while a service is unhealthy or parked.
    Paused,
    Completed,
    Failed,
    NotActionable,
    Cancelled,
    Aborted,
}

impl Default for Status {
    fn default() -> Self {
        Self::Pending
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NotActionable => "not_actionable",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "not_actionable" => Some(Self::NotActionable),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Terminal statuses freeze the orchestration; only error, results,
    /// abort payload, and timestamp may change afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::NotActionable | Self::Cancelled | Self::Aborted
        )
    }

    /// Terminal statuses that trigger compensation.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, Self::Failed | Self::Aborted)
    }
}

/// The action an orchestration executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub content: String,
}

/// A named action parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    pub field: String,
    pub value: Value,
}

impl ActionParam {
    pub fn new(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

/// Default wall-clock budget for one task execution attempt.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 30_000;

/// Default window an unhealthy service may pause a task before the task is
/// permanently failed.
pub const DEFAULT_HEALTH_CHECK_GRACE_PERIOD_MS: u64 = 30 * 60 * 1000;

/// One user action being executed as a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: String,
    pub project_id: String,
    pub action: Action,
    #[serde(default)]
    pub params: Vec<ActionParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ExecutionPlan>,
    /// Serialized `task0` input, the seed values of the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_zero: Option<Value>,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub timestamp: DateTime<Utc>,
    /// Per-attempt task execution budget, milliseconds.
    #[serde(default = "default_task_timeout")]
    pub timeout_ms: u64,
    /// Unhealthy-service pause budget, milliseconds.
    #[serde(default = "default_grace_period")]
    pub health_check_grace_period_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_hit: Option<GroundingHit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_payload: Option<Value>,
}

fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}

fn default_grace_period() -> u64 {
    DEFAULT_HEALTH_CHECK_GRACE_PERIOD_MS
}

impl Orchestration {
    pub fn new(project_id: impl Into<String>, action: Action, params: Vec<ActionParam>) -> Self {
        Self {
            id: format!("o_{}", Uuid::new_v4().simple()),
            project_id: project_id.into(),
            action,
            params,
            plan: None,
            task_zero: None,
            results: Vec::new(),
            status: Status::Pending,
            error: None,
            timestamp: Utc::now(),
            timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            health_check_grace_period_ms: DEFAULT_HEALTH_CHECK_GRACE_PERIOD_MS,
            grounding_hit: None,
            abort_payload: None,
        }
    }

    /// The embedding text for cache probes: `action::field1::field2...`.
    pub fn action_with_fields(&self) -> String {
        let mut parts = vec![self.action.content.clone()];
        parts.extend(self.params.iter().map(|p| p.field.clone()));
        parts.join("::")
    }
}
