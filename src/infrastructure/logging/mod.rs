//! Logging infrastructure
//!
//! Structured logging using tracing and tracing-subscriber with JSON or
//! pretty formatting per configuration.

pub mod logger;

pub use logger::init_logging;
