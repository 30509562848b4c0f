//! Clone stack
//!
//! `md` and `dest` are carved from the fast device, `source` from the slow
//! one. The top-level `clone` target copies `source` into `dest` region by
//! region in the background.

use parking_lot::Mutex;
use tracing::info;

use crate::config::CloneOptions;
use crate::device::Device;
use crate::error::{AllocationError, DescriptorError, DmResult};
use crate::extent::{BlockDevice, ExtentAllocator};
use crate::message::CloneMessage;
use crate::stack::{MetadataLayout, Stack, StackLayout, SupportDevices};
use crate::status::CloneStatus;
use crate::table::{CloneTarget, Table, Target};
use crate::units::div_up;

/// Support volumes and geometry of a clone stack
#[derive(Debug)]
pub struct CloneLayout {
    options: CloneOptions,
    fast: Mutex<ExtentAllocator>,
    slow: ExtentAllocator,
}

impl CloneLayout {
    pub fn new(fast_dev: BlockDevice, slow_dev: BlockDevice, options: CloneOptions) -> DmResult<Self> {
        DescriptorError::check_block_size("clone", options.region_size)?;

        // md goes last so it can be resized in place
        let mut fast = ExtentAllocator::with_device(fast_dev);
        fast.add_volume("dest", options.size)?;
        fast.add_volume("md", options.metadata_size)?;

        let mut slow = ExtentAllocator::with_device(slow_dev);
        slow.add_volume("source", options.size)?;

        Ok(Self {
            options,
            fast: Mutex::new(fast),
            slow,
        })
    }

    /// Geometry the layout was built with
    ///
    /// `metadata_size` is the initial reservation; see
    /// [`MetadataLayout::metadata_size`] for the current one.
    pub fn options(&self) -> &CloneOptions {
        &self.options
    }

    /// Number of regions in the clone target
    pub fn nr_regions(&self) -> u64 {
        div_up(self.options.size, self.options.region_size)
    }

    /// Clone target over `md`, `dest` and `source`
    pub fn clone_table(&self, md: &str, dest: &str, source: &str) -> DmResult<Table> {
        let mut params = CloneTarget::new(md, dest, source, self.options.region_size)
            .hydration(self.options.hydration)
            .discard_passdown(self.options.discard_passdown);
        for (k, v) in &self.options.core_args {
            params = params.core_arg(k.clone(), v);
        }
        Ok(Table::new(Target::from_params(self.options.size, &params)?))
    }
}

impl StackLayout for CloneLayout {
    fn kind(&self) -> &'static str {
        "clone"
    }

    fn support_tables(&self) -> DmResult<Vec<(&'static str, Table)>> {
        Ok(vec![
            ("md", self.metadata_table()?),
            ("dest", self.fast.lock().table_for("dest")?),
            ("source", self.slow.table_for("source")?),
        ])
    }

    fn format_role(&self) -> Option<&'static str> {
        self.options.format.then_some("md")
    }

    fn top_level_table(&self, support: &SupportDevices) -> DmResult<Table> {
        self.clone_table(
            &support.path("md")?,
            &support.path("dest")?,
            &support.path("source")?,
        )
    }
}

impl MetadataLayout for CloneLayout {
    fn metadata_size(&self) -> u64 {
        self.fast.lock().extent("md").map_or(0, |e| e.length)
    }

    fn resize_metadata(&self, new_size: u64) -> DmResult<()> {
        Ok(self.fast.lock().resize("md", new_size)?)
    }

    fn metadata_table(&self) -> DmResult<Table> {
        self.fast.lock().table_for("md")
    }
}

/// Check that the fast and slow devices can hold a clone stack
pub fn check_dev_size(
    fast: &BlockDevice,
    slow: &BlockDevice,
    size: u64,
    metadata_size: u64,
) -> Result<(), AllocationError> {
    let needed = metadata_size + size;
    if fast.size < needed {
        return Err(AllocationError::InsufficientSpace {
            name: fast.path.clone(),
            requested: needed,
            available: fast.size,
        });
    }
    if slow.size < size {
        return Err(AllocationError::InsufficientSpace {
            name: slow.path.clone(),
            requested: size,
            available: slow.size,
        });
    }
    Ok(())
}

/// Clone stack
pub type CloneStack = Stack<CloneLayout>;

impl Stack<CloneLayout> {
    pub fn enable_hydration(&self, clone: &Device) -> DmResult<String> {
        clone.send(CloneMessage::EnableHydration)
    }

    pub fn disable_hydration(&self, clone: &Device) -> DmResult<String> {
        clone.send(CloneMessage::DisableHydration)
    }

    pub fn set_hydration_threshold(&self, clone: &Device, regions: u64) -> DmResult<String> {
        clone.send(CloneMessage::HydrationThreshold(regions))
    }

    pub fn set_hydration_batch_size(&self, clone: &Device, regions: u64) -> DmResult<String> {
        clone.send(CloneMessage::HydrationBatchSize(regions))
    }

    /// Block until every region has been hydrated
    pub fn wait_until_hydrated(&self, clone: &Device) -> DmResult<CloneStatus> {
        let status = self.wait_for(clone, CloneStatus::is_hydrated)?;
        info!(device = %clone.name(), regions = status.nr_regions, "hydrated");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::control::SimControlPlane;
    use crate::error::{ActivationFailure, DmError};
    use crate::status::FailureKind;
    use crate::units::{k, meg};
    use crate::wait::ConditionWaiter;

    fn devices() -> (BlockDevice, BlockDevice) {
        (
            BlockDevice::new("/dev/fast", 1 << 22),
            BlockDevice::new("/dev/slow", 1 << 22),
        )
    }

    fn stack(options: CloneOptions) -> (Arc<SimControlPlane>, CloneStack) {
        let sim = Arc::new(SimControlPlane::new());
        sim.add_device("/dev/fast", 1 << 22);
        sim.add_device("/dev/slow", 1 << 22);
        let (fast, slow) = devices();
        let layout = CloneLayout::new(fast, slow, options).unwrap();
        let stack = Stack::new(layout, sim.clone(), sim.clone())
            .with_name_prefix("clone-test")
            .with_waiter(
                ConditionWaiter::new(Duration::from_secs(5)).with_interval(Duration::from_millis(1)),
            );
        (sim, stack)
    }

    #[test]
    fn test_support_tables() {
        let (fast, slow) = devices();
        let layout = CloneLayout::new(fast, slow, CloneOptions::new().size(meg(64))).unwrap();
        let tables = layout.support_tables().unwrap();
        let rendered: Vec<(&str, String)> =
            tables.iter().map(|(r, t)| (*r, t.to_string())).collect();
        assert_eq!(
            rendered,
            vec![
                ("md", "0 8192 linear /dev/fast 131072".to_string()),
                ("dest", "0 131072 linear /dev/fast 0".to_string()),
                ("source", "0 131072 linear /dev/slow 0".to_string()),
            ]
        );
        assert_eq!(layout.nr_regions(), 16384);
        assert_eq!(layout.format_role(), Some("md"));
    }

    #[test]
    fn test_clone_table_args() {
        let (fast, slow) = devices();
        let options = CloneOptions::new()
            .size(meg(64))
            .no_hydration()
            .core_arg("hydration_threshold", 16);
        let layout = CloneLayout::new(fast, slow, options).unwrap();
        let table = layout.clone_table("/dev/mapper/md", "/dev/mapper/d", "/dev/mapper/s").unwrap();
        assert_eq!(
            table.to_string(),
            "0 131072 clone /dev/mapper/md /dev/mapper/d /dev/mapper/s 8 1 no_hydration 2 hydration_threshold 16"
        );
    }

    #[test]
    fn test_layout_too_large() {
        let fast = BlockDevice::new("/dev/fast", meg(8));
        let slow = BlockDevice::new("/dev/slow", meg(8));
        let err = CloneLayout::new(fast, slow, CloneOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            DmError::Allocation(AllocationError::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_check_dev_size() {
        let fast = BlockDevice::new("/dev/fast", 1000);
        let slow = BlockDevice::new("/dev/slow", 500);
        assert!(check_dev_size(&fast, &slow, 500, 100).is_ok());
        assert_eq!(
            check_dev_size(&fast, &slow, 950, 100).unwrap_err(),
            AllocationError::InsufficientSpace {
                name: "/dev/fast".to_string(),
                requested: 1050,
                available: 1000,
            }
        );
        assert!(matches!(
            check_dev_size(&fast, &slow, 600, 100),
            Err(AllocationError::InsufficientSpace { requested: 600, .. })
        ));
    }

    #[test]
    fn test_resize_metadata() {
        let (fast, slow) = devices();
        let layout = CloneLayout::new(fast, slow, CloneOptions::new().size(meg(64))).unwrap();
        layout.resize_metadata(meg(8)).unwrap();
        assert_eq!(layout.metadata_size(), meg(8));
        assert_eq!(layout.options().metadata_size, meg(4));
        assert_eq!(
            layout.metadata_table().unwrap().to_string(),
            "0 16384 linear /dev/fast 131072"
        );
    }

    #[test]
    fn test_zero_region_size_rejected() {
        let (fast, slow) = devices();
        let err = CloneLayout::new(fast, slow, CloneOptions::new().size(meg(64)).region_size(0)).unwrap_err();
        assert!(matches!(
            err,
            DmError::Descriptor(DescriptorError::ZeroBlockSize { ref target_type }) if target_type == "clone"
        ));
    }

    #[test]
    fn test_resize_metadata_while_active() {
        let (sim, stack) = stack(CloneOptions::new().size(meg(64)).no_hydration());
        stack
            .activate(|active| {
                let before = active.top.status::<CloneStatus>()?.into_working().unwrap();
                stack.resize_metadata(active, meg(8))?;
                let after = active.top.status::<CloneStatus>()?.into_working().unwrap();
                assert_eq!(after.md_total, before.md_total * 2);
                assert_eq!(active.support.get("md")?.size(), meg(8));
                assert_eq!(active.top.state(), crate::device::DeviceState::Active);
                Ok(())
            })
            .unwrap();
        assert!(sim.device_names().is_empty());
    }

    #[test]
    fn test_resize_metadata_past_device_end() {
        let (_sim, stack) = stack(CloneOptions::new().size(meg(64)));
        stack
            .activate(|active| {
                let err = stack.resize_metadata(active, 1 << 23).unwrap_err();
                assert!(matches!(
                    err,
                    DmError::Allocation(AllocationError::InsufficientSpace { .. })
                ));
                assert_eq!(stack.layout().metadata_size(), meg(4));
                assert_eq!(active.top.state(), crate::device::DeviceState::Active);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_wait_until_hydrated() {
        let (sim, stack) = stack(CloneOptions::new().size(meg(64)).region_size(k(4)).no_hydration());
        sim.set_hydration_step(1 << 20);

        let status = stack
            .activate(|active| {
                let before = active.top.status::<CloneStatus>()?.into_working();
                assert_eq!(before.map(|s| s.nr_hydrated), Some(0));
                stack.enable_hydration(active.top)?;
                stack.wait_until_hydrated(active.top)
            })
            .unwrap();
        assert!(status.is_hydrated());
        assert_eq!(status.nr_regions, 16384);
        assert!(sim.device_names().is_empty());
    }

    #[test]
    fn test_wait_until_hydrated_failed_target() {
        let (sim, stack) = stack(CloneOptions::new().size(meg(64)).no_hydration());
        let err = stack
            .activate(|active| {
                sim.fail_device(active.top.name(), FailureKind::Fail);
                stack.wait_until_hydrated(active.top)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            DmError::TargetFailed {
                kind: FailureKind::Fail,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_region_size_tears_down_support() {
        let (sim, stack) = stack(CloneOptions::new().size(meg(64)).region_size(12));
        let err = stack.activate(|_| Ok(())).unwrap_err();
        assert_eq!(err.activation_failure(), Some(ActivationFailure::Rejected));
        assert!(sim.device_names().is_empty());
    }
}
