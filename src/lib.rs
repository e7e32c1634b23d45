//! Orra - LLM-planned, log-driven multi-service orchestration
//!
//! The plan engine accepts high-level actions, decomposes each into a
//! dependency-ordered execution plan over registered services (with a
//! vector-similarity plan cache), and drives the plan to completion or
//! rollback through an append-only log:
//! - Plan preparation pipeline with validation and retry feedback
//! - Durable append-only log + orchestration state machine
//! - Concurrent worker set with retry, health-gated pausing, idempotency
//! - Per-service WebSocket transport with ping/pong health tracking

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export the coordinator for convenience
pub use services::engine::PlanEngine;
