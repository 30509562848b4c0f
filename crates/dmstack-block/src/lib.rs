//! Device-mapper stack test harness
//!
//! This crate drives the kernel's device-mapper through `dmsetup` to build
//! multi-level device stacks, decode their status lines and wait on status
//! conditions, with teardown guaranteed on every exit path.
//!
//! # Features
//!
//! - Extent allocation of linear support volumes on physical devices
//! - Validated table construction for linear, clone, cache, thin-pool and thin
//! - Typed status decoding with `Fail`/`Error` sentinels
//! - Scoped activation: reverse-order removal even when the body fails
//! - Polling condition waits with a deadline
//! - An in-process control plane for running stacks without root
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  CloneStack / CacheStack /   │
//! │  PoolStack  (Stack<Layout>)  │
//! └──────┬───────────────┬───────┘
//!        │ tables        │ status / messages
//! ┌──────▼──────┐  ┌─────▼───────────┐
//! │ DeviceSet   │  │ ConditionWaiter │
//! │ - Device    │  │ - StatusCursor  │
//! └──────┬──────┘  └─────────────────┘
//!        │ ControlPlane
//!  ┌─────┴─────────────┐
//!  │                   │
//! ┌▼────────┐   ┌──────▼──────────┐
//! │ DmSetup │   │ SimControlPlane │
//! └─────────┘   └─────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod extent;
pub mod message;
pub mod process;
pub mod stack;
pub mod stacks;
pub mod status;
pub mod table;
pub mod trace;
pub mod units;
pub mod wait;

pub use config::{CacheOptions, CloneOptions, PoolOptions};
pub use control::{ControlPlane, DmSetup, SimControlPlane, SimEvent};
pub use device::{Device, DeviceSet, DeviceState, with_dev, with_devs};
pub use error::{ActivationFailure, DmError, DmResult};
pub use extent::{BlockDevice, Extent, ExtentAllocator};
pub use message::{CacheMessage, CloneMessage, PoolMessage};
pub use process::{CommandSpec, ProcessRunner, SystemRunner};
pub use stack::{ActiveStack, MetadataLayout, Stack, StackLayout, SupportDevices};
pub use stacks::{CacheLayout, CacheStack, CloneLayout, CloneStack, PoolLayout, PoolStack};
pub use status::{CacheStatus, CloneStatus, DeviceStatus, FailureKind, TargetStatus, ThinPoolStatus};
pub use table::{Table, Target, TargetParams};
pub use wait::ConditionWaiter;
