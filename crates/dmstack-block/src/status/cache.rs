//! `cache` target status
//!
//! ```text
//! <md block size> <#used md blocks>/<#total md blocks>
//! <cache block size> <#used cache blocks>/<#total cache blocks>
//! <#read hits> <#read misses> <#write hits> <#write misses>
//! <#demotions> <#promotions> <#dirty> <#features> <features>*
//! <#core args> <core args>* <policy name> <#policy args> <policy args>*
//! <cache metadata mode> <needs_check>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

use super::TargetStatus;
use super::cursor::{MetadataMode, StatusCursor, write_counted_list, write_counted_pairs};

const NEEDS_CHECK: [(&str, bool); 2] = [("-", false), ("needs_check", true)];

/// Decoded cache status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    /// Metadata block size in sectors
    pub md_block_size: u64,
    /// Metadata blocks in use
    pub md_used: u64,
    /// Metadata blocks on the device
    pub md_total: u64,
    /// Cache block size in sectors
    pub block_size: u64,
    /// Cache blocks holding data
    pub cache_used: u64,
    /// Cache blocks on the fast device
    pub cache_total: u64,
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    /// Blocks moved out of the cache
    pub demotions: u64,
    /// Blocks moved into the cache
    pub promotions: u64,
    /// Cache blocks not yet written back to the origin
    pub dirty: u64,
    /// Feature arguments such as `writeback`
    pub features: Vec<String>,
    /// Core tunables as key/value pairs
    pub core_args: Vec<(String, String)>,
    /// Replacement policy name
    pub policy: String,
    pub policy_args: Vec<(String, String)>,
    pub mode: MetadataMode,
    /// Metadata must be repaired before the next activation
    pub needs_check: bool,
}

impl CacheStatus {
    /// No dirty blocks remain to be written back
    pub fn is_clean(&self) -> bool {
        self.dirty == 0
    }

    pub fn metadata_usage(&self) -> f64 {
        if self.md_total == 0 {
            0.0
        } else {
            self.md_used as f64 / self.md_total as f64
        }
    }
}

impl TargetStatus for CacheStatus {
    const TARGET_TYPE: &'static str = "cache";

    fn decode(c: &mut StatusCursor<'_>) -> Result<Self, ParseError> {
        let md_block_size = c.take_int("md_block_size")?;
        let (md_used, md_total) = c.take_ratio("metadata usage")?;
        let block_size = c.take_int("cache block size")?;
        let (cache_used, cache_total) = c.take_ratio("cache usage")?;
        let read_hits = c.take_int("read hits")?;
        let read_misses = c.take_int("read misses")?;
        let write_hits = c.take_int("write hits")?;
        let write_misses = c.take_int("write misses")?;
        let demotions = c.take_int("demotions")?;
        let promotions = c.take_int("promotions")?;
        let dirty = c.take_int("dirty")?;
        let features = c.take_counted_list("features")?;
        let core_args = c.take_counted_pairs("core args")?;
        let policy = c.take_token("policy name")?.to_string();
        let policy_args = c.take_counted_pairs("policy args")?;
        let mode = c.take_mode("metadata mode")?;
        let needs_check = c.take_choice("needs_check", &NEEDS_CHECK, "'-' or needs_check")?;

        Ok(Self {
            md_block_size,
            md_used,
            md_total,
            block_size,
            cache_used,
            cache_total,
            read_hits,
            read_misses,
            write_hits,
            write_misses,
            demotions,
            promotions,
            dirty,
            features,
            core_args,
            policy,
            policy_args,
            mode,
            needs_check,
        })
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {} {}/{} {} {} {} {} {} {} {} ",
            self.md_block_size,
            self.md_used,
            self.md_total,
            self.block_size,
            self.cache_used,
            self.cache_total,
            self.read_hits,
            self.read_misses,
            self.write_hits,
            self.write_misses,
            self.demotions,
            self.promotions,
            self.dirty
        )?;
        write_counted_list(f, &self.features)?;
        write!(f, " ")?;
        write_counted_pairs(f, &self.core_args)?;
        write!(f, " {} ", self.policy)?;
        write_counted_pairs(f, &self.policy_args)?;
        write!(
            f,
            " {} {}",
            self.mode,
            if self.needs_check { "needs_check" } else { "-" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::decode;

    const SAMPLE: &str = "8 72/4096 512 100/2048 1 2 3 4 5 6 7 1 writeback \
                          2 migration_threshold 2048 smq 0 rw -";

    #[test]
    fn test_decode_cache() {
        let status = decode::<CacheStatus>(SAMPLE).unwrap().into_working().unwrap();
        assert_eq!(status.md_block_size, 8);
        assert_eq!((status.cache_used, status.cache_total), (100, 2048));
        assert_eq!(status.read_hits, 1);
        assert_eq!(status.promotions, 6);
        assert_eq!(status.dirty, 7);
        assert_eq!(status.features, vec!["writeback"]);
        assert_eq!(status.policy, "smq");
        assert!(status.policy_args.is_empty());
        assert_eq!(status.mode, MetadataMode::ReadWrite);
        assert!(!status.needs_check);
        assert!(!status.is_clean());
    }

    #[test]
    fn test_display_round_trip() {
        let status = decode::<CacheStatus>(SAMPLE).unwrap();
        let rendered = status.to_string();
        assert_eq!(decode::<CacheStatus>(&rendered).unwrap(), status);
    }

    #[test]
    fn test_needs_check_flag() {
        let line = SAMPLE.replace("rw -", "ro needs_check");
        let status = decode::<CacheStatus>(&line).unwrap().into_working().unwrap();
        assert!(status.needs_check);
        assert_eq!(status.mode, MetadataMode::ReadOnly);

        let bad = SAMPLE.replace("rw -", "rw maybe");
        assert!(matches!(
            decode::<CacheStatus>(&bad),
            Err(ParseError::UnexpectedToken { field: "needs_check", .. })
        ));
    }
}
