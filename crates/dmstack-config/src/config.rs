//! Configuration Loading System
//!
//! Provides configuration loading from multiple sources, later sources
//! taking priority:
//! 1. Default values
//! 2. Environment variables
//! 3. Configuration files

use crate::{ConfigError, Result};
use dmstack_block::{CacheOptions, CloneOptions, PoolOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Load from a file
    File(PathBuf),
    /// Load from environment variables
    Env,
    /// Use default values
    Default,
    /// Load from in-memory string (for testing)
    Memory(String),
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ConfigError::InvalidValue {
                field: "log.level".to_string(),
                message: format!("Invalid log level: {s}"),
            }),
        }
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format
    Pretty,
    /// Compact format
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(ConfigError::InvalidValue {
                field: "log.format".to_string(),
                message: format!("Invalid log format: {s}"),
            }),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Output to stdout
    Stdout,
    /// Output to stderr
    #[default]
    Stderr,
    /// Output to file
    File,
}

impl FromStr for LogOutput {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            _ => Err(ConfigError::InvalidValue {
                field: "log.output".to_string(),
                message: format!("Invalid log output: {s}"),
            }),
        }
    }
}

/// Physical devices the stacks are carved from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Fast device (metadata, destination, cache)
    pub fast: String,
    /// Slow device (source, origin)
    pub slow: String,
    /// Size of the fast device in sectors; queried with `blockdev` when unset
    pub fast_size: Option<u64>,
    /// Size of the slow device in sectors; queried with `blockdev` when unset
    pub slow_size: Option<u64>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            fast: "/dev/vdb".to_string(),
            slow: "/dev/vdc".to_string(),
            fast_size: None,
            slow_size: None,
        }
    }
}

/// Device-mapper control settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    /// Path or name of the `dmsetup` binary
    pub dmsetup: String,
    /// Directory device nodes appear in
    pub dev_dir: String,
    /// Prefix for generated device names
    pub name_prefix: String,
    /// Minimum lifetime of a support device scope in milliseconds
    pub min_scope_ms: u64,
}

impl Default for DmConfig {
    fn default() -> Self {
        Self {
            dmsetup: "dmsetup".to_string(),
            dev_dir: "/dev/mapper".to_string(),
            name_prefix: "dmstack".to_string(),
            min_scope_ms: 0,
        }
    }
}

impl DmConfig {
    pub const fn min_scope(&self) -> Duration {
        Duration::from_millis(self.min_scope_ms)
    }
}

/// Condition wait settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Status poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Deadline in seconds
    pub timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            timeout_secs: 300,
        }
    }
}

impl WaitConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log output
    pub output: LogOutput,
    /// File path for file output
    pub file_path: Option<PathBuf>,
}

/// Top-level harness configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Physical devices
    pub devices: DevicesConfig,
    /// Device-mapper control
    pub dm: DmConfig,
    /// Condition waits
    pub wait: WaitConfig,
    /// Clone stack geometry
    pub clone: CloneOptions,
    /// Cache stack geometry
    pub cache: CacheOptions,
    /// Thin-pool stack geometry
    pub pool: PoolOptions,
    /// Logging configuration
    pub log: LogConfig,
}

impl HarnessConfig {
    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

/// Configuration loader
#[derive(Debug)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Environment prefix used by the `dmstack` binary
    pub const DEFAULT_ENV_PREFIX: &'static str = "DMSTACK";

    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: None,
        }
    }

    /// Add a file source
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    pub fn with_str(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(toml.into()));
        self
    }

    /// Add environment variable source with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load configuration from all sources
    pub fn load(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(Self::expand_path(path))?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix)?;
                    }
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
            }
        }

        Ok(Self::finish(config))
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml: &str) -> Result<HarnessConfig> {
        Self::parse(toml).map(Self::finish)
    }

    fn parse(toml: &str) -> Result<HarnessConfig> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn finish(mut config: HarnessConfig) -> HarnessConfig {
        if let Some(ref path) = config.log.file_path {
            config.log.file_path = Some(Self::expand_path(path));
        }
        config
    }

    fn env<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>> {
        let name = format!("{prefix}_{key}");
        match std::env::var(&name) {
            Ok(val) => val
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::EnvVar(format!("Invalid value for {name}: {val}"))),
            Err(_) => Ok(None),
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: HarnessConfig, prefix: &str) -> Result<HarnessConfig> {
        if let Some(val) = Self::env(prefix, "DEVICES_FAST")? {
            config.devices.fast = val;
        }
        if let Some(val) = Self::env(prefix, "DEVICES_SLOW")? {
            config.devices.slow = val;
        }
        if let Some(val) = Self::env(prefix, "DEVICES_FAST_SIZE")? {
            config.devices.fast_size = Some(val);
        }
        if let Some(val) = Self::env(prefix, "DEVICES_SLOW_SIZE")? {
            config.devices.slow_size = Some(val);
        }

        if let Some(val) = Self::env(prefix, "DM_DMSETUP")? {
            config.dm.dmsetup = val;
        }
        if let Some(val) = Self::env(prefix, "DM_NAME_PREFIX")? {
            config.dm.name_prefix = val;
        }

        if let Some(val) = Self::env(prefix, "WAIT_POLL_INTERVAL_MS")? {
            config.wait.poll_interval_ms = val;
        }
        if let Some(val) = Self::env(prefix, "WAIT_TIMEOUT_SECS")? {
            config.wait.timeout_secs = val;
        }

        if let Some(val) = Self::env(prefix, "CLONE_REGION_SIZE")? {
            config.clone.region_size = val;
        }

        if let Some(val) = Self::env(prefix, "LOG_LEVEL")? {
            config.log.level = val;
        }
        if let Some(val) = Self::env(prefix, "LOG_FORMAT")? {
            config.log.format = val;
        }
        if let Some(val) = Self::env(prefix, "LOG_OUTPUT")? {
            config.log.output = val;
        }
        if let Some(val) = Self::env::<PathBuf>(prefix, "LOG_FILE_PATH")? {
            config.log.file_path = Some(val);
        }

        Ok(config)
    }

    /// Expand a leading `~` to the home directory
    pub fn expand_path(path: &Path) -> PathBuf {
        match path.strip_prefix("~") {
            Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
            Err(_) => path.to_path_buf(),
        }
    }
}
