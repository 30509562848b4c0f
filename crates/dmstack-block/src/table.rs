//! Device-mapper tables
//!
//! A [`Table`] is an ordered list of [`Target`] lines. Typed builders
//! implementing [`TargetParams`] produce argument lists in the order the
//! kernel documents for each target.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DescriptorError;

/// Typed target parameters
pub trait TargetParams {
    /// Kernel target type name
    fn target_type(&self) -> &'static str;

    /// Positional arguments following the target type
    fn param_args(&self) -> Vec<String>;

    /// Arguments joined into a single parameter string
    fn param_str(&self) -> String {
        self.param_args().join(" ")
    }
}

/// Argument count bounds for a known target type
fn arity(target_type: &str) -> Option<(usize, Option<usize>)> {
    match target_type {
        "linear" => Some((2, Some(2))),
        "thin" => Some((2, Some(3))),
        "clone" => Some((4, None)),
        "cache" => Some((7, None)),
        "thin-pool" => Some((4, None)),
        "error" | "zero" => Some((0, Some(0))),
        _ => None,
    }
}

/// One line of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    target_type: String,
    length: u64,
    args: Vec<String>,
}

impl Target {
    /// Create a validated target
    pub fn new(
        target_type: impl Into<String>,
        length: u64,
        args: Vec<String>,
    ) -> Result<Self, DescriptorError> {
        let target_type = target_type.into();
        if target_type.is_empty() {
            return Err(DescriptorError::EmptyTargetType);
        }
        if length == 0 {
            return Err(DescriptorError::ZeroLength { target_type });
        }

        if let Some((min, max)) = arity(&target_type) {
            let found = args.len();
            if found < min || max.is_some_and(|m| found > m) {
                let expected = match max {
                    Some(m) if m == min => min.to_string(),
                    Some(m) => format!("{min}..={m}"),
                    None => format!("at least {min}"),
                };
                return Err(DescriptorError::Arity {
                    target_type,
                    expected,
                    found,
                });
            }
        }

        if let Some(bad) = args
            .iter()
            .find(|a| a.is_empty() || a.chars().any(char::is_whitespace))
        {
            return Err(DescriptorError::InvalidArgument {
                target_type,
                arg: bad.clone(),
            });
        }

        Ok(Self {
            target_type,
            length,
            args,
        })
    }

    /// Create a target from typed parameters
    pub fn from_params<P: TargetParams>(length: u64, params: &P) -> Result<Self, DescriptorError> {
        Self::new(params.target_type(), length, params.param_args())
    }

    /// An `error` target of `length` sectors
    pub fn error(length: u64) -> Result<Self, DescriptorError> {
        Self::new("error", length, Vec::new())
    }

    /// Kernel target type name
    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    /// Length in sectors
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Positional arguments
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// An ordered list of targets covering a contiguous sector range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    targets: Vec<Target>,
}

impl Table {
    /// Single-target table
    pub fn new(target: Target) -> Self {
        Self {
            targets: vec![target],
        }
    }

    /// Multi-target table; start offsets accumulate in order
    pub fn from_targets(targets: Vec<Target>) -> Result<Self, DescriptorError> {
        if targets.is_empty() {
            return Err(DescriptorError::EmptyTable);
        }
        Ok(Self { targets })
    }

    /// Targets in order
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Total length in sectors
    pub fn size(&self) -> u64 {
        self.targets.iter().map(Target::length).sum()
    }

    /// Type of the first target
    pub fn target_type(&self) -> &str {
        self.targets[0].target_type()
    }

    /// Rendered lines with their start offsets
    pub fn lines(&self) -> Vec<String> {
        let mut start = 0;
        self.targets
            .iter()
            .map(|t| {
                let mut line = format!("{} {} {}", start, t.length, t.target_type);
                for arg in &t.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                start += t.length;
                line
            })
            .collect()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lines().join("\n"))
    }
}

/// `linear <dev> <offset>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearTarget {
    pub device: String,
    pub offset: u64,
}

impl LinearTarget {
    pub fn new(device: impl Into<String>, offset: u64) -> Self {
        Self {
            device: device.into(),
            offset,
        }
    }
}

impl TargetParams for LinearTarget {
    fn target_type(&self) -> &'static str {
        "linear"
    }

    fn param_args(&self) -> Vec<String> {
        vec![self.device.clone(), self.offset.to_string()]
    }
}

/// `clone <md> <dest> <source> <region_size> <#features> <features>* [<#core> <core args>*]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneTarget {
    pub metadata_dev: String,
    pub dest_dev: String,
    pub source_dev: String,
    pub region_size: u64,
    pub hydration: bool,
    pub discard_passdown: bool,
    pub core_args: Vec<(String, String)>,
}

impl CloneTarget {
    pub fn new(
        metadata_dev: impl Into<String>,
        dest_dev: impl Into<String>,
        source_dev: impl Into<String>,
        region_size: u64,
    ) -> Self {
        Self {
            metadata_dev: metadata_dev.into(),
            dest_dev: dest_dev.into(),
            source_dev: source_dev.into(),
            region_size,
            hydration: true,
            discard_passdown: true,
            core_args: Vec::new(),
        }
    }

    /// Start with background hydration disabled
    pub fn hydration(mut self, enabled: bool) -> Self {
        self.hydration = enabled;
        self
    }

    /// Pass discards down to the source device
    pub fn discard_passdown(mut self, enabled: bool) -> Self {
        self.discard_passdown = enabled;
        self
    }

    /// Add a core tunable such as `hydration_threshold`
    pub fn core_arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.core_args.push((key.into(), value.to_string()));
        self
    }
}

impl TargetParams for CloneTarget {
    fn target_type(&self) -> &'static str {
        "clone"
    }

    fn param_args(&self) -> Vec<String> {
        let mut features = Vec::new();
        if !self.hydration {
            features.push("no_hydration");
        }
        if !self.discard_passdown {
            features.push("no_discard_passdown");
        }

        let mut args = vec![
            self.metadata_dev.clone(),
            self.dest_dev.clone(),
            self.source_dev.clone(),
            self.region_size.to_string(),
            features.len().to_string(),
        ];
        args.extend(features.into_iter().map(String::from));

        if !self.core_args.is_empty() {
            args.push((self.core_args.len() * 2).to_string());
            for (k, v) in &self.core_args {
                args.push(k.clone());
                args.push(v.clone());
            }
        }
        args
    }
}

/// Cache write policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheIoMode {
    #[default]
    Writeback,
    Writethrough,
    Passthrough,
}

impl fmt::Display for CacheIoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheIoMode::Writeback => write!(f, "writeback"),
            CacheIoMode::Writethrough => write!(f, "writethrough"),
            CacheIoMode::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Cache replacement policy and its tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub name: String,
    #[serde(default)]
    pub args: Vec<(String, String)>,
}

impl CachePolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.args.push((key.into(), value.to_string()));
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new("smq")
    }
}

/// `cache <md> <cache> <origin> <block_size> <#features> <features>* <policy> <#policy args> <policy args>*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub metadata_dev: String,
    pub cache_dev: String,
    pub origin_dev: String,
    pub block_size: u64,
    pub io_mode: CacheIoMode,
    pub metadata2: bool,
    pub policy: CachePolicy,
}

impl CacheTarget {
    pub fn new(
        metadata_dev: impl Into<String>,
        cache_dev: impl Into<String>,
        origin_dev: impl Into<String>,
        block_size: u64,
    ) -> Self {
        Self {
            metadata_dev: metadata_dev.into(),
            cache_dev: cache_dev.into(),
            origin_dev: origin_dev.into(),
            block_size,
            io_mode: CacheIoMode::default(),
            metadata2: false,
            policy: CachePolicy::default(),
        }
    }

    pub fn io_mode(mut self, mode: CacheIoMode) -> Self {
        self.io_mode = mode;
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use the version 2 metadata format
    pub fn metadata2(mut self) -> Self {
        self.metadata2 = true;
        self
    }
}

impl TargetParams for CacheTarget {
    fn target_type(&self) -> &'static str {
        "cache"
    }

    fn param_args(&self) -> Vec<String> {
        let mut features = vec![self.io_mode.to_string()];
        if self.metadata2 {
            features.push("metadata2".to_string());
        }

        let mut args = vec![
            self.metadata_dev.clone(),
            self.cache_dev.clone(),
            self.origin_dev.clone(),
            self.block_size.to_string(),
            features.len().to_string(),
        ];
        args.extend(features);
        args.push(self.policy.name.clone());
        args.push((self.policy.args.len() * 2).to_string());
        for (k, v) in &self.policy.args {
            args.push(k.clone());
            args.push(v.clone());
        }
        args
    }
}

/// `thin-pool <md> <data> <block_size> <low_water_mark> <#features> <features>*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinPoolTarget {
    pub metadata_dev: String,
    pub data_dev: String,
    pub block_size: u64,
    pub low_water_mark: u64,
    pub zero: bool,
    pub discard: bool,
    pub discard_passdown: bool,
    pub read_only: bool,
    pub error_if_no_space: bool,
}

impl ThinPoolTarget {
    pub fn new(
        metadata_dev: impl Into<String>,
        data_dev: impl Into<String>,
        block_size: u64,
        low_water_mark: u64,
    ) -> Self {
        Self {
            metadata_dev: metadata_dev.into(),
            data_dev: data_dev.into(),
            block_size,
            low_water_mark,
            zero: true,
            discard: true,
            discard_passdown: true,
            read_only: false,
            error_if_no_space: false,
        }
    }
}

impl TargetParams for ThinPoolTarget {
    fn target_type(&self) -> &'static str {
        "thin-pool"
    }

    fn param_args(&self) -> Vec<String> {
        let mut features = Vec::new();
        if !self.zero {
            features.push("skip_block_zeroing");
        }
        if !self.discard {
            features.push("ignore_discard");
        }
        if !self.discard_passdown {
            features.push("no_discard_passdown");
        }
        if self.read_only {
            features.push("read_only");
        }
        if self.error_if_no_space {
            features.push("error_if_no_space");
        }

        let mut args = vec![
            self.metadata_dev.clone(),
            self.data_dev.clone(),
            self.block_size.to_string(),
            self.low_water_mark.to_string(),
            features.len().to_string(),
        ];
        args.extend(features.into_iter().map(String::from));
        args
    }
}

/// `thin <pool dev> <dev id> [<external origin>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinTarget {
    pub pool_dev: String,
    pub dev_id: u32,
    pub external_origin: Option<String>,
}

impl ThinTarget {
    pub fn new(pool_dev: impl Into<String>, dev_id: u32) -> Self {
        Self {
            pool_dev: pool_dev.into(),
            dev_id,
            external_origin: None,
        }
    }

    pub fn external_origin(mut self, origin: impl Into<String>) -> Self {
        self.external_origin = Some(origin.into());
        self
    }
}

impl TargetParams for ThinTarget {
    fn target_type(&self) -> &'static str {
        "thin"
    }

    fn param_args(&self) -> Vec<String> {
        let mut args = vec![self.pool_dev.clone(), self.dev_id.to_string()];
        if let Some(origin) = &self.external_origin {
            args.push(origin.clone());
        }
        args
    }
}
