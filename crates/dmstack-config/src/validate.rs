//! Configuration validation
//!
//! Errors make a configuration unusable. Warnings flag values the kernel
//! is likely to reject at activation time.

use crate::config::{DevicesConfig, HarnessConfig, LogConfig, LogOutput, WaitConfig};
use dmstack_block::stacks::check_dev_size;
use dmstack_block::units::div_up;
use dmstack_block::{CacheOptions, CloneOptions, PoolOptions};
use std::fmt;

const CLONE_MIN_REGION: u64 = 8;
const CLONE_MAX_REGION: u64 = 1 << 21;

/// Result of configuration validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Problems that prevent the configuration from being used
    pub errors: Vec<ValidationError>,
    /// Non-blocking issues
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if there are no validation errors
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Merges another validation result into this one
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.field, self.message)
    }
}

/// Validation warning details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    /// How to resolve it, if known
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(
        field: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WARNING] {}: {}", self.field, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (Suggestion: {s})")?;
        }
        Ok(())
    }
}

/// Error code classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required field is missing or empty
    Required,
    /// A value is outside the acceptable range
    OutOfRange,
    /// A value has an invalid format
    InvalidFormat,
    /// Configuration values are in conflict with each other
    Conflict,
}

/// Main configuration validator
#[derive(Debug, Default)]
pub struct Validator {
    /// Also warn about settings that are legal but unusual
    strict_mode: bool,
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self { strict_mode: false }
    }

    #[must_use]
    pub const fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Validates a complete `HarnessConfig`
    #[must_use]
    pub fn validate(&self, config: &HarnessConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.merge(self.validate_devices(&config.devices));
        result.merge(self.validate_dm_prefix(&config.dm.name_prefix));
        result.merge(self.validate_wait(&config.wait));
        result.merge(self.validate_clone(&config.clone));
        result.merge(self.validate_cache(&config.cache));
        result.merge(self.validate_pool(&config.pool));
        result.merge(self.validate_log(&config.log));

        for rule in [&CapacityRule as &dyn ValidationRule, &ConsistencyRule] {
            for error in rule.validate(config) {
                result.add_error(error);
            }
        }
        result
    }

    #[must_use]
    pub fn validate_devices(&self, config: &DevicesConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        for (field, path) in [("devices.fast", &config.fast), ("devices.slow", &config.slow)] {
            if path.trim().is_empty() {
                result.add_error(ValidationError::new(field, "Device path is empty", ErrorCode::Required));
            } else if !path.starts_with('/') {
                result.add_error(ValidationError::new(
                    field,
                    format!("Device path must be absolute: {path}"),
                    ErrorCode::InvalidFormat,
                ));
            }
        }
        if config.fast == config.slow {
            result.add_error(ValidationError::new(
                "devices",
                format!("Fast and slow device are the same: {}", config.fast),
                ErrorCode::Conflict,
            ));
        }
        result
    }

    /// Device names are `<prefix>-<pid>-<n>-<role>`
    #[must_use]
    pub fn validate_dm_prefix(&self, prefix: &str) -> ValidationResult {
        let mut result = ValidationResult::new();
        if prefix.is_empty() {
            result.add_error(ValidationError::new(
                "dm.name_prefix",
                "Name prefix is empty",
                ErrorCode::Required,
            ));
        } else if prefix.contains(|c: char| c.is_whitespace() || c == '/') {
            result.add_error(ValidationError::new(
                "dm.name_prefix",
                format!("Name prefix '{prefix}' contains whitespace or '/'"),
                ErrorCode::InvalidFormat,
            ));
        } else if prefix.len() > 64 {
            result.add_warning(ValidationWarning::with_suggestion(
                "dm.name_prefix",
                format!("Name prefix is {} characters long", prefix.len()),
                "Device-mapper names are limited to 127 characters",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_wait(&self, config: &WaitConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        if config.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "wait.poll_interval_ms",
                "Poll interval must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.timeout_secs == 0 {
            result.add_error(ValidationError::new(
                "wait.timeout_secs",
                "Timeout must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.poll_interval() > config.timeout() {
            result.add_warning(ValidationWarning::new(
                "wait.poll_interval_ms",
                "Poll interval exceeds the timeout; conditions are checked once",
            ));
        }
        if self.strict_mode && config.timeout_secs > 3600 {
            result.add_warning(ValidationWarning::new(
                "wait.timeout_secs",
                format!("Timeout of {}s is over an hour", config.timeout_secs),
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_clone(&self, config: &CloneOptions) -> ValidationResult {
        let mut result = ValidationResult::new();
        if config.size == 0 {
            result.add_error(ValidationError::new("clone.size", "Size must be greater than 0", ErrorCode::OutOfRange));
        }
        if config.metadata_size == 0 {
            result.add_error(ValidationError::new(
                "clone.metadata_size",
                "Metadata size must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.region_size == 0 {
            result.add_error(ValidationError::new(
                "clone.region_size",
                "Region size must be greater than 0",
                ErrorCode::OutOfRange,
            ));
            return result;
        }

        if !config.region_size.is_power_of_two()
            || !(CLONE_MIN_REGION..=CLONE_MAX_REGION).contains(&config.region_size)
        {
            result.add_warning(ValidationWarning::with_suggestion(
                "clone.region_size",
                format!("Region size {} will be rejected by the kernel", config.region_size),
                "Use a power of two between 8 and 2097152 sectors",
            ));
        }

        let needed = 64 + div_up(div_up(config.size, config.region_size), 4096);
        if config.metadata_size < needed {
            result.add_warning(ValidationWarning::with_suggestion(
                "clone.metadata_size",
                format!(
                    "Metadata size {} is below the {needed} sectors the region bitmap needs",
                    config.metadata_size
                ),
                "Increase metadata_size or region_size",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_cache(&self, config: &CacheOptions) -> ValidationResult {
        let mut result = ValidationResult::new();
        if config.block_size == 0 || config.block_size % 64 != 0 {
            result.add_warning(ValidationWarning::new(
                "cache.block_size",
                format!("Cache block size {} is not a multiple of 64 sectors", config.block_size),
            ));
        }
        if config.cache_size < config.block_size {
            result.add_error(ValidationError::new(
                "cache.cache_size",
                "Cache volume is smaller than one cache block",
                ErrorCode::OutOfRange,
            ));
        }
        if config.origin_size == 0 {
            result.add_error(ValidationError::new(
                "cache.origin_size",
                "Origin size must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_pool(&self, config: &PoolOptions) -> ValidationResult {
        let mut result = ValidationResult::new();
        if config.block_size == 0 || config.block_size % 128 != 0 {
            result.add_warning(ValidationWarning::new(
                "pool.block_size",
                format!("Pool block size {} is not a multiple of 128 sectors", config.block_size),
            ));
        }
        if config.data_size == 0 {
            result.add_error(ValidationError::new(
                "pool.data_size",
                "Data size must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if self.strict_mode && !config.zero {
            result.add_warning(ValidationWarning::new(
                "pool.zero",
                "Block zeroing is disabled; new thin devices may expose stale data",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_log(&self, config: &LogConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        if let Some(ref path) = config.file_path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                if !parent.exists() {
                    result.add_warning(ValidationWarning::with_suggestion(
                        "log.file_path",
                        format!("Parent directory does not exist: {}", parent.display()),
                        "It will be created when logging starts",
                    ));
                }
            }
        }
        result
    }
}

/// A whole-config check
pub trait ValidationRule {
    fn validate(&self, config: &HarnessConfig) -> Vec<ValidationError>;
    fn name(&self) -> &'static str;
}

/// Known device sizes must hold the clone stack
pub struct CapacityRule;

impl ValidationRule for CapacityRule {
    fn validate(&self, config: &HarnessConfig) -> Vec<ValidationError> {
        let (Some(fast_size), Some(slow_size)) = (config.devices.fast_size, config.devices.slow_size)
        else {
            return Vec::new();
        };
        let fast = dmstack_block::BlockDevice::new(&config.devices.fast, fast_size);
        let slow = dmstack_block::BlockDevice::new(&config.devices.slow, slow_size);
        match check_dev_size(&fast, &slow, config.clone.size, config.clone.metadata_size) {
            Ok(()) => Vec::new(),
            Err(e) => vec![ValidationError::new("devices", e.to_string(), ErrorCode::Conflict)],
        }
    }

    fn name(&self) -> &'static str {
        "CapacityRule"
    }
}

/// Cross-section conflicts
pub struct ConsistencyRule;

impl ValidationRule for ConsistencyRule {
    fn validate(&self, config: &HarnessConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if config.log.output == LogOutput::File && config.log.file_path.is_none() {
            errors.push(ValidationError::new(
                "log.file_path",
                "Log output is 'file' but file_path is not set",
                ErrorCode::Conflict,
            ));
        }
        errors
    }

    fn name(&self) -> &'static str {
        "ConsistencyRule"
    }
}

/// Validate with the default validator
#[must_use]
pub fn validate_config(config: &HarnessConfig) -> ValidationResult {
    Validator::new().validate(config)
}
