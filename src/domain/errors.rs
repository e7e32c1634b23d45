//! Engine errors for the Orra plan engine.

use thiserror::Error;

/// Engine-level errors surfaced by the core.
///
/// Preparation distinguishes retryable from permanent failures; execution
/// distinguishes retryable transport/health trouble from exhausted attempts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Action not actionable: {0}")]
    NotActionable(String),

    #[error("Plan preparation failed: {0}")]
    RetryablePreparation(String),

    #[error("Plan preparation failed permanently: {0}")]
    FailedNotRetryable(String),

    #[error("Task execution failed: {0}")]
    RetryableExecution(String),

    #[error("Execution paused: {0}")]
    PauseRequested(String),

    #[error("Task execution failed permanently: {0}")]
    PermanentExecution(String),

    #[error("Compensation failed for task {task_id}: {reason}")]
    CompensationFailure { task_id: String, reason: String },

    #[error("Compensation expired for task {task_id}")]
    CompensationExpired { task_id: String },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Orchestration not found: {0}")]
    OrchestrationNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reasoning provider error: {0}")]
    Reasoning(String),

    #[error("Embedding provider error: {0}")]
    Embedding(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Whether a preparation attempt may consume a retry slot.
    pub fn is_retryable_preparation(&self) -> bool {
        matches!(self, Self::RetryablePreparation(_))
    }

    /// Whether an execution attempt should be retried by the task worker.
    pub fn is_retryable_execution(&self) -> bool {
        matches!(self, Self::RetryableExecution(_) | Self::PauseRequested(_))
    }

    /// Pause requests park the execution without consuming an attempt.
    pub fn is_pause(&self) -> bool {
        matches!(self, Self::PauseRequested(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}
