//! `thin-pool` target status
//!
//! ```text
//! <transaction id> <used md blocks>/<total md blocks>
//! <used data blocks>/<total data blocks> <held metadata root>
//! ro|rw|out_of_data_space [no_]discard_passdown [error|queue]_if_no_space
//! needs_check|- metadata_low_watermark
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

use super::TargetStatus;
use super::cursor::StatusCursor;

/// Pool operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    ReadWrite,
    ReadOnly,
    OutOfDataSpace,
    Failed,
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolMode::ReadWrite => write!(f, "rw"),
            PoolMode::ReadOnly => write!(f, "ro"),
            PoolMode::OutOfDataSpace => write!(f, "out_of_data_space"),
            PoolMode::Failed => write!(f, "Fail"),
        }
    }
}

/// Behaviour when the data device fills up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoSpacePolicy {
    Queue,
    Error,
}

impl fmt::Display for NoSpacePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoSpacePolicy::Queue => write!(f, "queue_if_no_space"),
            NoSpacePolicy::Error => write!(f, "error_if_no_space"),
        }
    }
}

const MODES: [(&str, PoolMode); 4] = [
    ("rw", PoolMode::ReadWrite),
    ("ro", PoolMode::ReadOnly),
    ("out_of_data_space", PoolMode::OutOfDataSpace),
    ("Fail", PoolMode::Failed),
];

const DISCARD: [(&str, bool); 2] = [("discard_passdown", true), ("no_discard_passdown", false)];

const NO_SPACE: [(&str, NoSpacePolicy); 2] = [
    ("queue_if_no_space", NoSpacePolicy::Queue),
    ("error_if_no_space", NoSpacePolicy::Error),
];

const NEEDS_CHECK: [(&str, bool); 2] = [("-", false), ("needs_check", true)];

/// Decoded thin-pool status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinPoolStatus {
    /// Userspace transaction id stored in the metadata
    pub transaction_id: u64,
    /// Metadata blocks in use
    pub md_used: u64,
    /// Metadata blocks on the device
    pub md_total: u64,
    /// Data blocks provisioned to thin devices
    pub data_used: u64,
    /// Data blocks in the pool
    pub data_total: u64,
    /// Metadata snapshot root, if one is reserved
    pub held_root: Option<u64>,
    pub mode: PoolMode,
    /// Discards reach the data device
    pub discard_passdown: bool,
    /// Behaviour once the data device is full
    pub no_space_policy: NoSpacePolicy,
    /// Metadata must be repaired before the next activation
    pub needs_check: bool,
    /// Free metadata blocks below which an event fires
    pub metadata_low_watermark: u64,
}

impl ThinPoolStatus {
    pub fn data_usage(&self) -> f64 {
        if self.data_total == 0 {
            0.0
        } else {
            self.data_used as f64 / self.data_total as f64
        }
    }

    pub fn metadata_usage(&self) -> f64 {
        if self.md_total == 0 {
            0.0
        } else {
            self.md_used as f64 / self.md_total as f64
        }
    }
}

impl TargetStatus for ThinPoolStatus {
    const TARGET_TYPE: &'static str = "thin-pool";

    fn decode(c: &mut StatusCursor<'_>) -> Result<Self, ParseError> {
        let transaction_id = c.take_int("transaction id")?;
        let (md_used, md_total) = c.take_ratio("metadata usage")?;
        let (data_used, data_total) = c.take_ratio("data usage")?;
        let held_root = c.take_optional_int("held root")?;
        let mode = c.take_choice("pool mode", &MODES, "rw, ro, out_of_data_space or Fail")?;
        let discard_passdown =
            c.take_choice("discard", &DISCARD, "discard_passdown or no_discard_passdown")?;
        let no_space_policy = c.take_choice(
            "no space policy",
            &NO_SPACE,
            "queue_if_no_space or error_if_no_space",
        )?;
        let needs_check = c.take_choice("needs_check", &NEEDS_CHECK, "'-' or needs_check")?;
        let metadata_low_watermark = c.take_int("metadata low watermark")?;

        Ok(Self {
            transaction_id,
            md_used,
            md_total,
            data_used,
            data_total,
            held_root,
            mode,
            discard_passdown,
            no_space_policy,
            needs_check,
            metadata_low_watermark,
        })
    }
}

impl fmt::Display for ThinPoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {}/{} ",
            self.transaction_id, self.md_used, self.md_total, self.data_used, self.data_total
        )?;
        match self.held_root {
            Some(root) => write!(f, "{root}")?,
            None => write!(f, "-")?,
        }
        write!(
            f,
            " {} {} {} {} {}",
            self.mode,
            if self.discard_passdown {
                "discard_passdown"
            } else {
                "no_discard_passdown"
            },
            self.no_space_policy,
            if self.needs_check { "needs_check" } else { "-" },
            self.metadata_low_watermark
        )
    }
}
