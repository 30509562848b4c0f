//! Device handles
//!
//! A [`Device`] is bound to one kernel mapping for as long as the scope that
//! activated it. [`DeviceSet`] owns an ordered group of devices and removes
//! them in reverse order when torn down or dropped, so dependent devices
//! always go before the devices they sit on.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::control::ControlPlane;
use crate::error::{ActivationFailure, ControlErrorKind, DmError, DmResult};
use crate::status::{DeviceStatus, TargetStatus, decode_line};
use crate::table::Table;

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Not present in the kernel
    Inactive,
    /// Create in flight
    Activating,
    /// Live and passing I/O
    Active,
    /// Live with I/O paused
    Suspended,
    /// Remove in flight
    Deactivating,
}

impl DeviceState {
    /// Present in the kernel
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Suspended)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Activating => write!(f, "activating"),
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Deactivating => write!(f, "deactivating"),
        }
    }
}

/// Unique device name `<prefix>-<pid>-<n>-<role>`
pub fn device_name(prefix: &str, role: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}-{}-{n}-{role}", std::process::id())
}

/// Handle on an activated device
#[derive(Debug)]
pub struct Device {
    name: String,
    path: String,
    table: Mutex<Table>,
    pending: Mutex<Option<Table>>,
    state: Mutex<DeviceState>,
    control: Arc<dyn ControlPlane>,
}

impl Device {
    /// Create `name` from `table`
    pub fn activate(
        control: Arc<dyn ControlPlane>,
        name: impl Into<String>,
        table: Table,
    ) -> DmResult<Self> {
        let mut device = Self::new(control, name, table);
        device.create()?;
        Ok(device)
    }

    /// Handle for a device not yet present in the kernel
    pub(crate) fn new(control: Arc<dyn ControlPlane>, name: impl Into<String>, table: Table) -> Self {
        Self {
            name: name.into(),
            path: String::new(),
            table: Mutex::new(table),
            pending: Mutex::new(None),
            state: Mutex::new(DeviceState::Inactive),
            control,
        }
    }

    /// Create the kernel mapping for an inactive handle
    ///
    /// The handle is `Activating` while the create is in flight and drops
    /// back to `Inactive` if the kernel refuses the table.
    pub(crate) fn create(&mut self) -> DmResult<()> {
        self.require("activate", &[DeviceState::Inactive])?;
        self.set_state(DeviceState::Activating);

        let table = self.table();
        info!(device = %self.name, target = table.target_type(), size = table.size(), "activating");
        debug!(device = %self.name, table = %table, "table");

        match self.control.create(&self.name, &table) {
            Ok(path) => {
                self.path = path;
                self.set_state(DeviceState::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(DeviceState::Inactive);
                let kind = match e.kind {
                    ControlErrorKind::Incompatible => ActivationFailure::Incompatible,
                    _ => ActivationFailure::Rejected,
                };
                Err(DmError::Activation {
                    device: self.name.clone(),
                    kind,
                    reason: e.reason,
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device node path
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// Live table
    pub fn table(&self) -> Table {
        self.table.lock().clone()
    }

    /// Size in sectors
    pub fn size(&self) -> u64 {
        self.table.lock().size()
    }

    pub(crate) fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    pub(crate) fn require(
        &self,
        operation: &'static str,
        allowed: &[DeviceState],
    ) -> DmResult<DeviceState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            let expected = allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or ");
            Err(DmError::InvalidState {
                device: self.name.clone(),
                operation,
                expected,
                found: state.to_string(),
            })
        }
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    /// Raw status output
    pub fn status_line(&self) -> DmResult<String> {
        self.require("status", &[DeviceState::Active, DeviceState::Suspended])?;
        self.control
            .status(&self.name)
            .map_err(|e| DmError::control("status", &self.name, e))
    }

    /// Fresh status decoded as `T`
    pub fn status<T: TargetStatus>(&self) -> DmResult<DeviceStatus<T>> {
        let line = self.status_line()?;
        Ok(decode_line(&line)?)
    }

    /// Pause I/O
    pub fn suspend(&self) -> DmResult<()> {
        self.require("suspend", &[DeviceState::Active])?;
        self.control
            .suspend(&self.name)
            .map_err(|e| DmError::control("suspend", &self.name, e))?;
        self.set_state(DeviceState::Suspended);
        debug!(device = %self.name, "suspended");
        Ok(())
    }

    /// Resume I/O; a previously loaded table becomes live
    pub fn resume(&self) -> DmResult<()> {
        self.require("resume", &[DeviceState::Suspended])?;
        self.control
            .resume(&self.name)
            .map_err(|e| DmError::control("resume", &self.name, e))?;
        if let Some(table) = self.pending.lock().take() {
            *self.table.lock() = table;
        }
        self.set_state(DeviceState::Active);
        debug!(device = %self.name, "resumed");
        Ok(())
    }

    /// Stage a new table for the next resume
    pub fn load(&self, table: Table) -> DmResult<()> {
        self.require("load", &[DeviceState::Active, DeviceState::Suspended])?;
        self.control.load(&self.name, &table).map_err(|e| {
            let kind = match e.kind {
                ControlErrorKind::Incompatible => ActivationFailure::Incompatible,
                _ => ActivationFailure::Rejected,
            };
            DmError::Activation {
                device: self.name.clone(),
                kind,
                reason: e.reason,
            }
        })?;
        *self.pending.lock() = Some(table);
        Ok(())
    }

    /// Run `body` with the device suspended
    ///
    /// The device is resumed whether `body` succeeds, fails or panics. A
    /// body error takes precedence over a resume error.
    pub fn pause<T>(&self, body: impl FnOnce() -> DmResult<T>) -> DmResult<T> {
        self.suspend()?;
        let guard = ResumeGuard { device: self };
        let result = body();
        match (result, guard.resume()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(resume_err)) => {
                warn!(device = %self.name, error = %resume_err, "resume failed after error");
                Err(e)
            }
        }
    }

    /// Replace the live table: suspend, load, resume
    pub fn reload(&self, table: Table) -> DmResult<()> {
        info!(device = %self.name, size = table.size(), "reloading");
        self.pause(|| self.load(table))
    }

    /// Remove from the kernel
    pub fn deactivate(&self) -> DmResult<()> {
        let previous = self.require("deactivate", &[DeviceState::Active, DeviceState::Suspended])?;
        self.set_state(DeviceState::Deactivating);
        match self.control.remove(&self.name) {
            Ok(()) => {
                self.set_state(DeviceState::Inactive);
                info!(device = %self.name, "removed");
                Ok(())
            }
            Err(e) => {
                self.set_state(previous);
                Err(DmError::control("remove", &self.name, e))
            }
        }
    }
}

struct ResumeGuard<'a> {
    device: &'a Device,
}

impl ResumeGuard<'_> {
    fn resume(self) -> DmResult<()> {
        let result = self.device.resume();
        std::mem::forget(self);
        result
    }
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        if self.device.state() == DeviceState::Suspended {
            if let Err(e) = self.device.resume() {
                warn!(device = %self.device.name, error = %e, "resume during unwind failed");
            }
        }
    }
}

/// Ordered owner of activated devices
///
/// Devices are removed last-in first-out by [`DeviceSet::teardown`] or on
/// drop. Devices a caller already deactivated are skipped.
#[derive(Debug)]
pub struct DeviceSet {
    control: Arc<dyn ControlPlane>,
    devices: Vec<Device>,
}

impl DeviceSet {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            devices: Vec::new(),
        }
    }

    /// Activate `table` as `name` and take ownership of it
    pub fn activate(&mut self, name: impl Into<String>, table: Table) -> DmResult<&Device> {
        let device = Device::activate(self.control.clone(), name, table)?;
        self.devices.push(device);
        Ok(&self.devices[self.devices.len() - 1])
    }

    /// Devices in activation order
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Remove every device, newest first
    ///
    /// Keeps going past failures and returns the first one.
    pub fn teardown(mut self) -> DmResult<()> {
        self.teardown_inner()
    }

    fn teardown_inner(&mut self) -> DmResult<()> {
        let mut first_err = None;
        while let Some(device) = self.devices.pop() {
            if !device.state().is_live() {
                continue;
            }
            if let Err(e) = device.deactivate() {
                warn!(device = %device.name(), error = %e, "teardown failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for DeviceSet {
    fn drop(&mut self) {
        if let Err(e) = self.teardown_inner() {
            warn!(error = %e, "device set teardown incomplete");
        }
    }
}

/// Combine a scope's result with its teardown result
pub(crate) fn finish_scope<T>(set: DeviceSet, result: DmResult<T>) -> DmResult<T> {
    match (result, set.teardown()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown_err)) => {
            warn!(error = %teardown_err, "teardown failed after scope error");
            Err(e)
        }
    }
}

/// Activate `tables` in order, run `body`, then remove them in reverse
///
/// If activation `k` fails, devices `0..k` are removed before the
/// activation error is returned.
pub fn with_devs<T>(
    control: &Arc<dyn ControlPlane>,
    tables: Vec<Table>,
    body: impl FnOnce(&[Device]) -> DmResult<T>,
) -> DmResult<T> {
    let mut set = DeviceSet::new(control.clone());
    for table in tables {
        set.activate(device_name("dmstack", table.target_type()), table)?;
    }
    let result = body(set.devices());
    finish_scope(set, result)
}

/// Single-device form of [`with_devs`]
pub fn with_dev<T>(
    control: &Arc<dyn ControlPlane>,
    table: Table,
    body: impl FnOnce(&Device) -> DmResult<T>,
) -> DmResult<T> {
    with_devs(control, vec![table], |devices| body(&devices[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{SimControlPlane, SimEvent};
    use crate::table::{LinearTarget, Target};

    fn setup() -> (Arc<SimControlPlane>, Arc<dyn ControlPlane>) {
        let sim = Arc::new(SimControlPlane::new());
        sim.add_device("/dev/fast", 1 << 20);
        let control: Arc<dyn ControlPlane> = sim.clone();
        (sim, control)
    }

    fn linear(offset: u64, len: u64) -> Table {
        Table::new(Target::from_params(len, &LinearTarget::new("/dev/fast", offset)).unwrap())
    }

    #[test]
    fn test_device_name_unique() {
        let a = device_name("dmstack", "md");
        let b = device_name("dmstack", "md");
        assert_ne!(a, b);
        assert!(a.starts_with("dmstack-"));
        assert!(a.ends_with("-md"));
    }

    #[test]
    fn test_create_state_transitions() {
        let (sim, control) = setup();
        let mut dev = Device::new(control.clone(), "d", linear(0, 8));
        assert_eq!(dev.state(), DeviceState::Inactive);
        assert!(matches!(dev.status_line(), Err(DmError::InvalidState { .. })));

        dev.create().unwrap();
        assert_eq!(dev.state(), DeviceState::Active);
        assert_eq!(dev.path(), "/dev/mapper/d");
        match dev.create().unwrap_err() {
            DmError::InvalidState { expected, found, .. } => {
                assert_eq!(expected, "inactive");
                assert_eq!(found, "active");
            }
            other => panic!("unexpected error: {other}"),
        }

        let table = Table::new(Target::from_params(8, &LinearTarget::new("/dev/missing", 0)).unwrap());
        let mut refused = Device::new(control, "refused", table);
        let err = refused.create().unwrap_err();
        assert_eq!(err.activation_failure(), Some(ActivationFailure::Rejected));
        assert_eq!(refused.state(), DeviceState::Inactive);
        assert_eq!(sim.device_names(), vec!["d".to_string()]);
    }

    #[test]
    fn test_lifecycle() {
        let (sim, control) = setup();
        let dev = Device::activate(control, "d", linear(0, 8)).unwrap();
        assert_eq!(dev.state(), DeviceState::Active);
        assert_eq!(dev.path(), "/dev/mapper/d");

        dev.suspend().unwrap();
        assert_eq!(sim.is_suspended("d"), Some(true));
        assert!(matches!(dev.suspend(), Err(DmError::InvalidState { .. })));
        dev.resume().unwrap();

        dev.deactivate().unwrap();
        assert_eq!(dev.state(), DeviceState::Inactive);
        assert!(matches!(dev.status_line(), Err(DmError::InvalidState { .. })));
        assert!(matches!(dev.deactivate(), Err(DmError::InvalidState { .. })));
    }

    #[test]
    fn test_reload_swaps_table() {
        let (sim, control) = setup();
        with_dev(&control, linear(0, 8), |dev| {
            dev.reload(linear(8, 16))?;
            assert_eq!(dev.size(), 16);
            assert_eq!(sim.table(dev.name()).unwrap(), linear(8, 16));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_failed_reload_leaves_device_resumed() {
        let (sim, control) = setup();
        with_dev(&control, linear(0, 8), |dev| {
            sim.reject_next_load("bad table");
            let err = dev.reload(linear(8, 16)).unwrap_err();
            assert!(matches!(err, DmError::Activation { .. }));
            assert_eq!(dev.state(), DeviceState::Active);
            assert_eq!(sim.is_suspended(dev.name()), Some(false));
            assert_eq!(dev.size(), 8);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_pause_resumes_on_panic() {
        let (sim, control) = setup();
        let dev = Device::activate(control, "p", linear(0, 8)).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: DmResult<()> = dev.pause(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(dev.state(), DeviceState::Active);
        assert_eq!(sim.is_suspended("p"), Some(false));
        dev.deactivate().unwrap();
    }

    #[test]
    fn test_reverse_teardown_on_error() {
        let (sim, control) = setup();
        let tables = vec![linear(0, 8), linear(8, 8), linear(16, 8)];
        let mut names = Vec::new();

        let result: DmResult<()> = with_devs(&control, tables, |devs| {
            names = devs.iter().map(|d| d.name().to_string()).collect();
            Err(DmError::UnknownRole("always fails".into()))
        });
        assert!(matches!(result, Err(DmError::UnknownRole(_))));

        let removals: Vec<_> = sim
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Remove(n) => Some(n),
                _ => None,
            })
            .collect();
        names.reverse();
        assert_eq!(removals, names);
        assert!(sim.device_names().is_empty());
    }

    #[test]
    fn test_partial_activation_cleans_up() {
        let (sim, control) = setup();
        let tables = vec![linear(0, 8), linear(8, 8), linear(1 << 20, 8)];
        let err = with_devs(&control, tables, |_| Ok(())).unwrap_err();
        assert_eq!(err.activation_failure(), Some(ActivationFailure::Rejected));
        assert!(sim.device_names().is_empty());
        assert_eq!(
            sim.events()
                .iter()
                .filter(|e| matches!(e, SimEvent::Remove(_)))
                .count(),
            2
        );
    }

    #[test]
    fn test_set_skips_deactivated() {
        let (sim, control) = setup();
        let mut set = DeviceSet::new(control);
        set.activate("a", linear(0, 8)).unwrap();
        set.activate("b", linear(8, 8)).unwrap();
        set.devices()[1].deactivate().unwrap();
        set.teardown().unwrap();
        assert!(sim.device_names().is_empty());
    }

    #[test]
    fn test_set_drop_on_panic() {
        let (sim, control) = setup();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut set = DeviceSet::new(control);
            set.activate("x", linear(0, 8)).unwrap();
            set.activate("y", linear(8, 8)).unwrap();
            panic!("inside scope");
        }));
        assert!(result.is_err());
        assert!(sim.device_names().is_empty());
        let removals: Vec<_> = sim
            .events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::Remove(_)))
            .collect();
        assert_eq!(
            removals,
            vec![SimEvent::Remove("y".into()), SimEvent::Remove("x".into())]
        );
    }
}
