//! Infrastructure layer
//!
//! Configuration loading, logging setup, and the WebSocket service
//! transport.

pub mod config;
pub mod logging;
pub mod transport;
