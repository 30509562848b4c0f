//! Device stacks
//!
//! A stack is a set of support volumes (linear slices of physical devices)
//! with one top-level target built on them. [`StackLayout`] describes the
//! shape; [`Stack`] activates it with strict ordering: support devices come
//! up first and go down last, and each level is torn down on every exit path.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::control::ControlPlane;
use crate::device::{Device, DeviceSet, device_name, finish_scope};
use crate::error::{DmError, DmResult};
use crate::process::{ProcessRunner, zero_fill};
use crate::status::{DeviceStatus, TargetStatus};
use crate::table::Table;
use crate::wait::ConditionWaiter;

/// Sectors zeroed at the start of a metadata volume when formatting
pub const METADATA_HEADER_SECTORS: u64 = 8;

/// Shape of a stack
pub trait StackLayout {
    /// Short name used in device names and logs
    fn kind(&self) -> &'static str;

    /// Support volume tables in activation order, keyed by role
    fn support_tables(&self) -> DmResult<Vec<(&'static str, Table)>>;

    /// Role of the volume whose header is zeroed before use, if formatting
    fn format_role(&self) -> Option<&'static str>;

    /// Top-level table over the active support devices
    fn top_level_table(&self, support: &SupportDevices) -> DmResult<Table>;
}

/// A layout whose `md` volume is the terminal extent of its device
///
/// The reservation lives behind a lock so it can change while the stack is
/// active.
pub trait MetadataLayout: StackLayout {
    /// Current size of the `md` volume in sectors
    fn metadata_size(&self) -> u64;

    /// Grow or shrink the `md` reservation
    fn resize_metadata(&self, new_size: u64) -> DmResult<()>;

    /// Linear table of the `md` volume at its current size
    fn metadata_table(&self) -> DmResult<Table>;
}

/// Active support volumes of a stack
#[derive(Debug)]
pub struct SupportDevices {
    set: DeviceSet,
    roles: Vec<&'static str>,
}

impl SupportDevices {
    /// Device playing `role`
    pub fn get(&self, role: &str) -> DmResult<&Device> {
        self.roles
            .iter()
            .position(|r| *r == role)
            .map(|i| &self.set.devices()[i])
            .ok_or_else(|| DmError::UnknownRole(role.to_string()))
    }

    /// Node path of the device playing `role`
    pub fn path(&self, role: &str) -> DmResult<String> {
        self.get(role).map(|d| d.path().to_string())
    }

    pub fn roles(&self) -> &[&'static str] {
        &self.roles
    }

    /// Devices in activation order
    pub fn devices(&self) -> &[Device] {
        self.set.devices()
    }
}

/// A fully active stack
#[derive(Debug, Clone, Copy)]
pub struct ActiveStack<'a> {
    pub support: &'a SupportDevices,
    pub top: &'a Device,
}

/// Activates a [`StackLayout`]
#[derive(Debug)]
pub struct Stack<L> {
    layout: L,
    control: Arc<dyn ControlPlane>,
    runner: Arc<dyn ProcessRunner>,
    waiter: ConditionWaiter,
    name_prefix: String,
    min_scope: Duration,
}

impl<L: StackLayout> Stack<L> {
    pub fn new(layout: L, control: Arc<dyn ControlPlane>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            layout,
            control,
            runner,
            waiter: ConditionWaiter::default(),
            name_prefix: "dmstack".to_string(),
            min_scope: Duration::ZERO,
        }
    }

    /// Waiter used by the stack's wait helpers
    pub fn with_waiter(mut self, waiter: ConditionWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    /// Prefix for generated device names
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Keep support devices up for at least `duration`
    ///
    /// Gives udev time to settle before devices are removed.
    pub fn with_min_scope(mut self, duration: Duration) -> Self {
        self.min_scope = duration;
        self
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn waiter(&self) -> &ConditionWaiter {
        &self.waiter
    }

    pub fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    /// Wait until `device` reports a working status satisfying `condition`
    ///
    /// A target that reports `Fail` or `Error` ends the wait with
    /// [`DmError::TargetFailed`].
    pub fn wait_for<T, P>(&self, device: &Device, mut condition: P) -> DmResult<T>
    where
        T: TargetStatus,
        P: FnMut(&T) -> bool,
    {
        let status = self.waiter.wait::<T, _>(device, |s| match s {
            DeviceStatus::Working(status) => condition(status),
            DeviceStatus::Failed(_) => true,
        })?;
        match status {
            DeviceStatus::Working(status) => Ok(status),
            DeviceStatus::Failed(kind) => Err(DmError::TargetFailed {
                device: device.name().to_string(),
                kind,
            }),
        }
    }

    /// Bring up the support volumes around `body`
    pub fn activate_support_devs<T>(
        &self,
        body: impl FnOnce(&SupportDevices) -> DmResult<T>,
    ) -> DmResult<T> {
        let started = Instant::now();
        let tables = self.layout.support_tables()?;

        let mut set = DeviceSet::new(self.control.clone());
        let mut roles = Vec::with_capacity(tables.len());
        for (role, table) in tables {
            set.activate(device_name(&self.name_prefix, role), table)?;
            roles.push(role);
        }
        let support = SupportDevices { set, roles };
        info!(stack = self.layout.kind(), devices = support.roles.len(), "support devices active");

        if let Some(role) = self.layout.format_role() {
            let md = support.get(role)?;
            zero_fill(self.runner.as_ref(), md.path(), METADATA_HEADER_SECTORS)?;
            debug!(stack = self.layout.kind(), role, "formatted metadata");
        }

        let result = body(&support);

        let elapsed = started.elapsed();
        if elapsed < self.min_scope {
            thread::sleep(self.min_scope - elapsed);
        }
        finish_scope(support.set, result)
    }

    /// Bring up the top-level device over `support` around `body`
    pub fn activate_top_level<T>(
        &self,
        support: &SupportDevices,
        body: impl FnOnce(&Device) -> DmResult<T>,
    ) -> DmResult<T> {
        let table = self.layout.top_level_table(support)?;
        let mut set = DeviceSet::new(self.control.clone());
        set.activate(device_name(&self.name_prefix, self.layout.kind()), table)?;
        let result = body(&set.devices()[0]);
        finish_scope(set, result)
    }

    /// Bring up the whole stack around `body`
    pub fn activate<T>(&self, body: impl FnOnce(ActiveStack<'_>) -> DmResult<T>) -> DmResult<T> {
        self.activate_support_devs(|support| {
            self.activate_top_level(support, |top| body(ActiveStack { support, top }))
        })
    }
}

impl<L: MetadataLayout> Stack<L> {
    /// Resize the metadata volume of a live stack
    ///
    /// The top-level device stays suspended while `md` is reloaded, and picks
    /// up the new size when it resumes. The reservation is restored if the
    /// reload fails.
    pub fn resize_metadata(&self, active: ActiveStack<'_>, new_size: u64) -> DmResult<()> {
        let md = active.support.get("md")?;
        let old_size = self.layout.metadata_size();
        self.layout.resize_metadata(new_size)?;

        let result = self.layout.metadata_table().and_then(|table| {
            active.top.pause(|| md.pause(|| md.load(table)))
        });
        match result {
            Ok(()) => {
                info!(stack = self.layout.kind(), old_size, new_size, "resized metadata");
                Ok(())
            }
            Err(e) => {
                if let Err(restore) = self.layout.resize_metadata(old_size) {
                    warn!(stack = self.layout.kind(), error = %restore, "failed to restore metadata reservation");
                }
                Err(e)
            }
        }
    }
}
