#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

//! Logging for the dmstack harness
//!
//! Installs the global `tracing` subscriber described by a
//! [`dmstack_config::LogConfig`] and provides timed phase spans for
//! long-running steps such as activation and hydration.

pub mod logging;

pub use logging::*;

use thiserror::Error;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Subscriber installation failed
    #[error("Initialization error: {0}")]
    Init(String),

    /// Configuration cannot be turned into a subscriber
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
