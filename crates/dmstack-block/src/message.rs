//! Target messages
//!
//! Runtime control of a live target: `message <device> 0 <text>`.

use std::fmt;

use tracing::debug;

use crate::device::{Device, DeviceState};
use crate::error::{DmError, DmResult};

impl Device {
    /// Send `message` to sector 0 of the device and return the reply
    ///
    /// A refusal is reported as [`DmError::MessageRejected`]; nothing is
    /// retried.
    pub fn send(&self, message: impl fmt::Display) -> DmResult<String> {
        let message = message.to_string();
        self.require("message", &[DeviceState::Active, DeviceState::Suspended])?;
        debug!(device = %self.name(), message = %message, "sending message");

        self.control()
            .message(self.name(), 0, &message)
            .map_err(|e| DmError::MessageRejected {
                device: self.name().to_string(),
                message,
                reason: e.to_string(),
            })
    }
}

/// Clone target messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMessage {
    EnableHydration,
    DisableHydration,
    /// Regions in flight before background hydration backs off
    HydrationThreshold(u64),
    /// Regions copied per batch
    HydrationBatchSize(u64),
}

impl fmt::Display for CloneMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnableHydration => write!(f, "enable_hydration"),
            Self::DisableHydration => write!(f, "disable_hydration"),
            Self::HydrationThreshold(n) => write!(f, "hydration_threshold {n}"),
            Self::HydrationBatchSize(n) => write!(f, "hydration_batch_size {n}"),
        }
    }
}

/// Thin-pool messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMessage {
    CreateThin(u32),
    CreateSnap { id: u32, origin: u32 },
    Delete(u32),
    SetTransactionId { old: u64, new: u64 },
    ReserveMetadataSnap,
    ReleaseMetadataSnap,
}

impl fmt::Display for PoolMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateThin(id) => write!(f, "create_thin {id}"),
            Self::CreateSnap { id, origin } => write!(f, "create_snap {id} {origin}"),
            Self::Delete(id) => write!(f, "delete {id}"),
            Self::SetTransactionId { old, new } => write!(f, "set_transaction_id {old} {new}"),
            Self::ReserveMetadataSnap => write!(f, "reserve_metadata_snap"),
            Self::ReleaseMetadataSnap => write!(f, "release_metadata_snap"),
        }
    }
}

/// Cache core or policy tunable: `<key> <value>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMessage {
    pub key: String,
    pub value: String,
}

impl CacheMessage {
    pub fn new(key: impl Into<String>, value: impl ToString) -> Self {
        Self {
            key: key.into(),
            value: value.to_string(),
        }
    }

    pub fn migration_threshold(sectors: u64) -> Self {
        Self::new("migration_threshold", sectors)
    }
}

impl fmt::Display for CacheMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.value)
    }
}
