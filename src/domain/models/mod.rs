//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure
//! concerns.

pub mod cache;
pub mod compensation;
pub mod config;
pub mod grounding;
pub mod log;
pub mod orchestration;
pub mod plan;
pub mod project;
pub mod service;

pub use cache::{CacheEntry, CacheMapping};
pub use compensation::{
    CompensationCandidate, CompensationData, CompensationOutcome, FailedCompensation,
    ResolutionState, DEFAULT_COMPENSATION_TTL_MS, MAX_COMPENSATION_ATTEMPTS,
};
pub use config::{Config, EmbeddingsConfig, LoggingConfig, ReasoningConfig};
pub use grounding::{GroundingHit, GroundingSpec, GroundingUseCase};
pub use log::{EntryType, LogEntry, OrchestrationState, TaskStatusPayload};
pub use orchestration::{
    Action, ActionParam, Orchestration, Status, DEFAULT_HEALTH_CHECK_GRACE_PERIOD_MS,
    DEFAULT_TASK_TIMEOUT_MS,
};
pub use plan::{
    extract_references, parse_exact_reference, ExecutionPlan, SubTask, FINAL_TASK, TASK_ZERO,
};
pub use project::Project;
pub use service::{services_hash, Schema, Service, ServiceKind, ServiceSchema};
