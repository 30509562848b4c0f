//! Condition waits
//!
//! Kernel targets change state in the background (hydration, writeback).
//! [`ConditionWaiter`] polls a device's status until a predicate holds or a
//! deadline passes. Polling is synchronous and blocks the calling thread;
//! there is no event subscription.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{DmError, DmResult};
use crate::status::{DeviceStatus, TargetStatus, decode_line};

/// Default delay between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for a wait
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Polls status until a predicate holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionWaiter {
    interval: Duration,
    timeout: Duration,
}

impl Default for ConditionWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ConditionWaiter {
    /// Waiter with the default poll interval
    pub fn new(timeout: Duration) -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout,
        }
    }

    /// Delay between polls
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll `device` until `predicate` holds for a freshly decoded status
    ///
    /// The predicate is checked before each sleep, so a condition that
    /// already holds returns without sleeping. Sleeps never overshoot the
    /// deadline. Decode errors abort the wait.
    pub fn wait<T, P>(&self, device: &Device, mut predicate: P) -> DmResult<DeviceStatus<T>>
    where
        T: TargetStatus,
        P: FnMut(&DeviceStatus<T>) -> bool,
    {
        let deadline = Instant::now() + self.timeout;
        let mut polls = 0u64;

        loop {
            let line = device.status_line()?;
            let status = decode_line::<T>(&line)?;
            polls += 1;

            if predicate(&status) {
                debug!(device = %device.name(), polls, "condition met");
                return Ok(status);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(device = %device.name(), polls, timeout = ?self.timeout, "condition wait timed out");
                return Err(DmError::DeadlineExceeded {
                    device: device.name().to_string(),
                    timeout: self.timeout,
                    last_status: Some(line),
                });
            }
            thread::sleep(self.interval.min(remaining));
        }
    }
}

/// [`ConditionWaiter::wait`] with the default poll interval
pub fn wait_until<T, P>(device: &Device, timeout: Duration, predicate: P) -> DmResult<DeviceStatus<T>>
where
    T: TargetStatus,
    P: FnMut(&DeviceStatus<T>) -> bool,
{
    ConditionWaiter::new(timeout).wait(device, predicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlPlane, SimControlPlane};
    use crate::device::with_devs;
    use crate::status::CloneStatus;
    use crate::table::{CloneTarget, LinearTarget, Table, Target};
    use std::sync::Arc;

    fn linear(dev: &str, offset: u64, len: u64) -> Table {
        Table::new(Target::from_params(len, &LinearTarget::new(dev, offset)).unwrap())
    }

    fn with_clone<T>(sim: &Arc<SimControlPlane>, body: impl FnOnce(&Device) -> DmResult<T>) -> T {
        sim.add_device("/dev/fast", 1 << 16);
        sim.add_device("/dev/slow", 1 << 16);
        let control: Arc<dyn ControlPlane> = sim.clone();
        let support = vec![
            linear("/dev/fast", 0, 1024),
            linear("/dev/fast", 1024, 4096),
            linear("/dev/slow", 0, 4096),
        ];
        with_devs(&control, support, |devs| {
            let table = Table::new(Target::from_params(
                4096,
                &CloneTarget::new(devs[0].path(), devs[1].path(), devs[2].path(), 8)
                    .hydration(false),
            )?);
            crate::device::with_dev(&control, table, body)
        })
        .unwrap()
    }

    #[test]
    fn test_immediate_condition_does_not_sleep() {
        let sim = Arc::new(SimControlPlane::new());
        let elapsed = with_clone(&sim, |clone| {
            let waiter = ConditionWaiter::new(Duration::from_secs(30))
                .with_interval(Duration::from_secs(10));
            let start = Instant::now();
            waiter.wait::<CloneStatus, _>(clone, |_| true)?;
            Ok(start.elapsed())
        });
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn test_deadline_carries_last_status() {
        let sim = Arc::new(SimControlPlane::new());
        let err = with_clone(&sim, |clone| {
            let waiter = ConditionWaiter::new(Duration::from_millis(50))
                .with_interval(Duration::from_millis(10));
            let start = Instant::now();
            let err = waiter
                .wait::<CloneStatus, _>(clone, |s| s.working().is_some_and(|c| c.is_hydrated()))
                .unwrap_err();
            assert!(start.elapsed() >= Duration::from_millis(50));
            assert!(start.elapsed() < Duration::from_secs(5));
            Ok(err)
        });

        match &err {
            DmError::DeadlineExceeded { last_status, .. } => {
                let last = last_status.as_deref().unwrap();
                assert!(last.contains(" clone "));
                assert!(last.contains("0/512"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_error_aborts() {
        let sim = Arc::new(SimControlPlane::new());
        sim.add_device("/dev/fast", 64);
        let control: Arc<dyn ControlPlane> = sim.clone();
        let err = crate::device::with_dev(&control, linear("/dev/fast", 0, 8), |dev| {
            wait_until::<CloneStatus, _>(dev, Duration::from_secs(30), |_| false).map(drop)
        })
        .unwrap_err();
        assert!(matches!(err, DmError::Parse(_)));
    }
}
