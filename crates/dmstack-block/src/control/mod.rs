//! Kernel control plane
//!
//! [`ControlPlane`] is the narrow interface through which devices are
//! created, reloaded, queried and removed. [`DmSetup`] drives the real
//! kernel; [`SimControlPlane`] models it in process.

mod dmsetup;
mod sim;

use std::fmt;

use crate::error::ControlError;
use crate::table::Table;

pub use dmsetup::DmSetup;
pub use sim::{SimControlPlane, SimEvent};

/// Device-mapper control operations
///
/// All calls block until the kernel has acted.
pub trait ControlPlane: Send + Sync + fmt::Debug {
    /// Create and resume a device, returning its node path
    fn create(&self, name: &str, table: &Table) -> Result<String, ControlError>;

    /// Remove a device
    fn remove(&self, name: &str) -> Result<(), ControlError>;

    /// Suspend I/O
    fn suspend(&self, name: &str) -> Result<(), ControlError>;

    /// Resume I/O, swapping in any loaded table
    fn resume(&self, name: &str) -> Result<(), ControlError>;

    /// Load an inactive table, to become live on the next resume
    fn load(&self, name: &str, table: &Table) -> Result<(), ControlError>;

    /// Current status output
    fn status(&self, name: &str) -> Result<String, ControlError>;

    /// Send a target message, returning any reply text
    fn message(&self, name: &str, sector: u64, message: &str) -> Result<String, ControlError>;
}
