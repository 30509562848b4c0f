//! `clone` target status
//!
//! ```text
//! <md block size> <#used md blocks>/<#total md blocks> <region size>
//! <#hydrated regions>/<#total regions> <#hydrating regions>
//! <#features> <features>* <#core args> <core args>* <clone metadata mode>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

use super::TargetStatus;
use super::cursor::{MetadataMode, StatusCursor, write_counted_list, write_counted_pairs};

/// Decoded clone status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneStatus {
    /// Metadata block size in sectors
    pub md_block_size: u64,
    /// Metadata blocks in use
    pub md_used: u64,
    /// Metadata blocks on the device
    pub md_total: u64,
    /// Region size in sectors
    pub region_size: u64,
    /// Regions copied from the source
    pub nr_hydrated: u64,
    /// Regions in the target
    pub nr_regions: u64,
    /// Regions being copied right now
    pub nr_hydrating: u64,
    /// Feature arguments in table order
    pub features: Vec<String>,
    /// Tunables as key/value pairs
    pub core_args: Vec<(String, String)>,
    pub mode: MetadataMode,
}

impl CloneStatus {
    /// Every region has been copied from the source
    pub fn is_hydrated(&self) -> bool {
        self.nr_hydrated == self.nr_regions
    }

    /// Fraction of metadata blocks in use
    pub fn metadata_usage(&self) -> f64 {
        if self.md_total == 0 {
            0.0
        } else {
            self.md_used as f64 / self.md_total as f64
        }
    }

    /// Fraction of regions hydrated
    pub fn hydration_progress(&self) -> f64 {
        if self.nr_regions == 0 {
            1.0
        } else {
            self.nr_hydrated as f64 / self.nr_regions as f64
        }
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    pub fn core_arg(&self, key: &str) -> Option<&str> {
        self.core_args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl TargetStatus for CloneStatus {
    const TARGET_TYPE: &'static str = "clone";

    fn decode(c: &mut StatusCursor<'_>) -> Result<Self, ParseError> {
        let md_block_size = c.take_int("md_block_size")?;
        let (md_used, md_total) = c.take_ratio("metadata usage")?;
        let region_size = c.take_int("region_size")?;
        let (nr_hydrated, nr_regions) = c.take_ratio("hydration")?;
        let nr_hydrating = c.take_int("nr_hydrating")?;
        let features = c.take_counted_list("features")?;
        let core_args = c.take_counted_pairs("core args")?;
        let mode = c.take_mode("metadata mode")?;

        Ok(Self {
            md_block_size,
            md_used,
            md_total,
            region_size,
            nr_hydrated,
            nr_regions,
            nr_hydrating,
            features,
            core_args,
            mode,
        })
    }
}

impl fmt::Display for CloneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {} {}/{} {} ",
            self.md_block_size,
            self.md_used,
            self.md_total,
            self.region_size,
            self.nr_hydrated,
            self.nr_regions,
            self.nr_hydrating
        )?;
        write_counted_list(f, &self.features)?;
        write!(f, " ")?;
        write_counted_pairs(f, &self.core_args)?;
        write!(f, " {}", self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{DeviceStatus, decode};

    const SAMPLE: &str = "64 10/100 4096 5/20 2 1 discard_passdown 2 migration_threshold 1024 rw";

    #[test]
    fn test_decode_sample() {
        let status = decode::<CloneStatus>(SAMPLE).unwrap().into_working().unwrap();
        assert_eq!(status.md_block_size, 64);
        assert_eq!((status.md_used, status.md_total), (10, 100));
        assert_eq!(status.region_size, 4096);
        assert_eq!((status.nr_hydrated, status.nr_regions), (5, 20));
        assert_eq!(status.nr_hydrating, 2);
        assert_eq!(status.features, vec!["discard_passdown"]);
        assert_eq!(status.core_arg("migration_threshold"), Some("1024"));
        assert_eq!(status.mode, MetadataMode::ReadWrite);
        assert!(!status.is_hydrated());
        assert!((status.metadata_usage() - 0.1).abs() < f64::EPSILON);
        assert!(status.has_feature("discard_passdown"));
    }

    #[test]
    fn test_display_reproduces_input() {
        let status = decode::<CloneStatus>(SAMPLE).unwrap();
        assert_eq!(status.to_string(), SAMPLE);
    }

    #[test]
    fn test_odd_core_args() {
        let err = decode::<CloneStatus>("64 10/100 4096 5/20 2 0 3 a b c rw").unwrap_err();
        assert!(matches!(err, ParseError::OddPairCount { count: 3, .. }));
    }

    #[test]
    fn test_truncated_before_mode() {
        let err = decode::<CloneStatus>("64 10/100 4096 5/20 2 0 0").unwrap_err();
        assert_eq!(
            err,
            ParseError::Truncated {
                field: "metadata mode",
                remaining: String::new()
            }
        );
    }

    #[test]
    fn test_unknown_mode_and_trailing() {
        assert!(matches!(
            decode::<CloneStatus>("64 10/100 4096 5/20 2 0 0 wr"),
            Err(ParseError::UnknownMode { .. })
        ));
        assert!(matches!(
            decode::<CloneStatus>("64 10/100 4096 5/20 2 0 0 rw extra"),
            Err(ParseError::TrailingTokens { .. })
        ));
    }

    #[test]
    fn test_failed_mode_is_not_sentinel() {
        let status = decode::<CloneStatus>("64 10/100 8 20/20 0 0 0 Fail").unwrap();
        let DeviceStatus::Working(status) = status else {
            panic!("expected record");
        };
        assert_eq!(status.mode, MetadataMode::Failed);
        assert!(status.is_hydrated());
    }
}
