#![allow(clippy::doc_markdown)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::return_self_not_must_use)]
#![allow(unsafe_code)]

//! Configuration for the dmstack harness
//!
//! A [`HarnessConfig`] names the fast and slow devices stacks are carved
//! from, how to reach device-mapper, how long condition waits may run,
//! the geometry of each stack type and the logging setup. It is loaded by
//! [`ConfigLoader`] from defaults, `DMSTACK_*` variables and TOML, and
//! checked with [`validate_config`].

pub mod config;
pub mod validate;

pub use config::*;
pub use validate::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed into a `HarnessConfig`
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// A `DMSTACK_*` variable held something unparsable
    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
