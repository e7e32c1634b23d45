//! Configuration management infrastructure
//!
//! Hierarchical configuration using figment:
//! - programmatic defaults
//! - orra.yaml in the working directory
//! - ORRA_* environment variables (highest priority)

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
