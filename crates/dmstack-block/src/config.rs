//! Stack options
//!
//! Geometry and feature settings for the clone, cache and thin-pool
//! layouts. All sizes are in sectors.

use serde::{Deserialize, Serialize};

use crate::table::{CacheIoMode, CachePolicy};
use crate::units::{gig, k, meg};

/// Clone stack options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneOptions {
    /// Size of the destination and source volumes
    pub size: u64,
    /// Size of the metadata volume
    pub metadata_size: u64,
    /// Hydration granularity
    pub region_size: u64,
    /// Zero the metadata header before first use
    pub format: bool,
    /// Pass discards down to the source
    pub discard_passdown: bool,
    /// Start background hydration immediately
    pub hydration: bool,
    /// Extra core tunables, e.g. `hydration_threshold`
    pub core_args: Vec<(String, String)>,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            size: gig(1),
            metadata_size: meg(4),
            region_size: k(4),
            format: true,
            discard_passdown: true,
            hydration: true,
            core_args: Vec::new(),
        }
    }
}

impl CloneOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn metadata_size(mut self, size: u64) -> Self {
        self.metadata_size = size;
        self
    }

    pub fn region_size(mut self, size: u64) -> Self {
        self.region_size = size;
        self
    }

    /// Reuse existing metadata instead of zeroing it
    pub fn no_format(mut self) -> Self {
        self.format = false;
        self
    }

    pub fn no_discard_passdown(mut self) -> Self {
        self.discard_passdown = false;
        self
    }

    /// Activate with hydration stopped
    pub fn no_hydration(mut self) -> Self {
        self.hydration = false;
        self
    }

    pub fn core_arg(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.core_args.push((key.into(), value.to_string()));
        self
    }
}

/// Cache stack options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    pub metadata_size: u64,
    pub cache_size: u64,
    pub origin_size: u64,
    pub block_size: u64,
    pub io_mode: CacheIoMode,
    pub policy: CachePolicy,
    /// Use the version 2 metadata format
    pub metadata2: bool,
    pub format: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            metadata_size: meg(4),
            cache_size: meg(512),
            origin_size: gig(1),
            block_size: k(32),
            io_mode: CacheIoMode::Writeback,
            policy: CachePolicy::default(),
            metadata2: false,
            format: true,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn origin_size(mut self, size: u64) -> Self {
        self.origin_size = size;
        self
    }

    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    pub fn io_mode(mut self, mode: CacheIoMode) -> Self {
        self.io_mode = mode;
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn no_format(mut self) -> Self {
        self.format = false;
        self
    }
}

/// Thin-pool stack options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub metadata_size: u64,
    pub data_size: u64,
    pub block_size: u64,
    pub low_water_mark: u64,
    /// Zero newly provisioned blocks
    pub zero: bool,
    /// Process discards
    pub discard: bool,
    pub discard_passdown: bool,
    pub read_only: bool,
    pub error_if_no_space: bool,
    pub format: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            metadata_size: meg(4),
            data_size: gig(1),
            block_size: k(64),
            low_water_mark: 0,
            zero: true,
            discard: true,
            discard_passdown: true,
            read_only: false,
            error_if_no_space: false,
            format: true,
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_size(mut self, size: u64) -> Self {
        self.data_size = size;
        self
    }

    pub fn metadata_size(mut self, size: u64) -> Self {
        self.metadata_size = size;
        self
    }

    pub fn block_size(mut self, size: u64) -> Self {
        self.block_size = size;
        self
    }

    /// Skip zeroing of newly provisioned blocks
    pub fn no_zero(mut self) -> Self {
        self.zero = false;
        self
    }

    pub fn error_if_no_space(mut self) -> Self {
        self.error_if_no_space = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn no_format(mut self) -> Self {
        self.format = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_defaults() {
        let opts = CloneOptions::default();
        assert_eq!(opts.size, 2_097_152);
        assert_eq!(opts.metadata_size, 8192);
        assert_eq!(opts.region_size, 8);
        assert!(opts.format && opts.hydration && opts.discard_passdown);
        assert!(opts.core_args.is_empty());
    }

    #[test]
    fn test_clone_builder() {
        let opts = CloneOptions::new()
            .size(meg(64))
            .region_size(k(64))
            .no_hydration()
            .core_arg("hydration_batch_size", 4);
        assert_eq!(opts.size, 131_072);
        assert_eq!(opts.region_size, 128);
        assert!(!opts.hydration);
        assert_eq!(opts.core_args, vec![("hydration_batch_size".into(), "4".into())]);
    }

    #[test]
    fn test_options_partial_deserialize() {
        let opts: CloneOptions = serde_json::from_str(r#"{"region_size": 16}"#).unwrap();
        assert_eq!(opts.region_size, 16);
        assert_eq!(opts.size, gig(1));

        let pool: PoolOptions = serde_json::from_str(r#"{"read_only": true}"#).unwrap();
        assert!(pool.read_only);
        assert_eq!(pool.block_size, 128);
    }
}
