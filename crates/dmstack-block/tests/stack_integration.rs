//! Stack Integration Tests
//!
//! Full clone, cache and thin-pool stacks brought up against the in-process
//! control plane, checking ordering and cleanup across levels.

use std::sync::Arc;
use std::time::Duration;

use dmstack_block::control::{SimControlPlane, SimEvent};
use dmstack_block::error::AllocationError;
use dmstack_block::status::decode;
use dmstack_block::units::{k, meg};
use dmstack_block::{
    ActivationFailure, BlockDevice, CacheLayout, CacheOptions, CloneLayout, CloneOptions,
    CloneStatus, ConditionWaiter, Device, DeviceStatus, DmError, ExtentAllocator, MetadataLayout,
    PoolLayout, PoolOptions, Stack,
};

const FAST: u64 = 1 << 22;
const SLOW: u64 = 1 << 23;

fn sim() -> Arc<SimControlPlane> {
    let sim = Arc::new(SimControlPlane::new());
    sim.add_device("/dev/fast", FAST);
    sim.add_device("/dev/slow", SLOW);
    sim
}

fn waiter() -> ConditionWaiter {
    ConditionWaiter::new(Duration::from_secs(10)).with_interval(Duration::from_millis(1))
}

fn clone_stack(sim: &Arc<SimControlPlane>, options: CloneOptions) -> Stack<CloneLayout> {
    let layout = CloneLayout::new(
        BlockDevice::new("/dev/fast", FAST),
        BlockDevice::new("/dev/slow", SLOW),
        options,
    )
    .unwrap();
    Stack::new(layout, sim.clone(), sim.clone()).with_waiter(waiter())
}

fn clone_status(clone: &Device) -> CloneStatus {
    clone.status::<CloneStatus>().unwrap().into_working().unwrap()
}

fn removal_order(events: &[SimEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SimEvent::Remove(name) => name.rsplit('-').next().map(String::from),
            _ => None,
        })
        .collect()
}

#[test]
fn test_allocation_scenario() {
    let mut alloc = ExtentAllocator::with_device(BlockDevice::new("/dev/fast", 2000));
    alloc.add_volume("md", 100).unwrap();
    alloc.add_volume("data", 1000).unwrap();
    assert_eq!(alloc.free_space(), 900);

    alloc.add_volume("extra", 900).unwrap();
    assert_eq!(alloc.free_space(), 0);
    assert!(matches!(
        alloc.add_volume("more", 1),
        Err(AllocationError::InsufficientSpace { .. })
    ));
}

#[test]
fn test_clone_status_scenario() {
    let status = decode::<CloneStatus>(
        "64 10/100 4096 5/20 2 1 discard_passdown 2 migration_threshold 1024 rw",
    )
    .unwrap()
    .into_working()
    .unwrap();
    assert_eq!(status.md_block_size, 64);
    assert_eq!((status.md_used, status.md_total), (10, 100));
    assert_eq!(status.region_size, 4096);
    assert_eq!((status.nr_hydrated, status.nr_regions), (5, 20));
    assert_eq!(status.nr_hydrating, 2);
    assert_eq!(status.features, vec!["discard_passdown".to_string()]);
    assert_eq!(
        status.core_args,
        vec![("migration_threshold".to_string(), "1024".to_string())]
    );
}

#[test]
fn test_non_power_of_two_region_tears_down_support() {
    let sim = sim();
    let stack = clone_stack(&sim, CloneOptions::new().size(meg(64)).region_size(24));

    let mut body_ran = false;
    let err = stack
        .activate(|_| {
            body_ran = true;
            Ok(())
        })
        .unwrap_err();

    assert!(!body_ran);
    assert!(matches!(
        err,
        DmError::Activation {
            kind: ActivationFailure::Rejected,
            ..
        }
    ));
    assert!(sim.device_names().is_empty());
    assert_eq!(removal_order(&sim.events()), vec!["source", "dest", "md"]);
}

#[test]
fn test_reverse_teardown_with_failing_body() {
    let sim = sim();
    let stack = clone_stack(&sim, CloneOptions::new().size(meg(64)));

    let err = stack
        .activate(|active| {
            assert_eq!(active.support.devices().len(), 3);
            Err::<(), _>(DmError::UnknownRole("always fails".to_string()))
        })
        .unwrap_err();

    assert!(matches!(err, DmError::UnknownRole(_)));
    assert_eq!(
        removal_order(&sim.events()),
        vec!["clone", "source", "dest", "md"]
    );
}

#[test]
fn test_reopen_with_different_region_size_is_incompatible() {
    let sim = sim();
    clone_stack(&sim, CloneOptions::new().size(meg(64)))
        .activate(|_| Ok(()))
        .unwrap();

    let err = clone_stack(
        &sim,
        CloneOptions::new().size(meg(64)).region_size(k(8)).no_format(),
    )
    .activate(|_| Ok(()))
    .unwrap_err();
    assert_eq!(err.activation_failure(), Some(ActivationFailure::Incompatible));
    assert!(sim.device_names().is_empty());

    // formatting again discards the old geometry
    clone_stack(&sim, CloneOptions::new().size(meg(64)).region_size(k(8)))
        .activate(|_| Ok(()))
        .unwrap();
}

#[test]
fn test_hydration_observed_through_waiter() {
    let sim = sim();
    sim.set_hydration_step(4096);
    let stack = clone_stack(&sim, CloneOptions::new().size(meg(64)).no_hydration());

    stack
        .activate(|active| {
            let status = active.top.status::<CloneStatus>()?;
            assert!(matches!(status, DeviceStatus::Working(ref s) if s.nr_hydrated == 0));

            stack.enable_hydration(active.top)?;
            let done = stack.wait_until_hydrated(active.top)?;
            assert_eq!(done.nr_hydrated, done.nr_regions);
            assert_eq!(done.nr_hydrating, 0);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_hydration_deadline_carries_status() {
    let sim = sim();
    let stack = Stack::new(
        CloneLayout::new(
            BlockDevice::new("/dev/fast", FAST),
            BlockDevice::new("/dev/slow", SLOW),
            CloneOptions::new().size(meg(64)).no_hydration(),
        )
        .unwrap(),
        sim.clone(),
        sim.clone(),
    )
    .with_waiter(ConditionWaiter::new(Duration::from_millis(20)).with_interval(Duration::from_millis(5)));

    let err = stack
        .activate(|active| stack.wait_until_hydrated(active.top))
        .unwrap_err();
    let last = err.last_status().unwrap();
    assert!(last.contains(" clone "), "{last}");
    assert!(last.contains("no_hydration"), "{last}");
    assert!(sim.device_names().is_empty());
}

#[test]
fn test_reload_clone_metadata_after_resize() {
    let sim = sim();
    let stack = clone_stack(&sim, CloneOptions::new().size(meg(64)).no_hydration());

    stack
        .activate(|active| {
            let md = active.support.get("md")?;
            assert_eq!(md.size(), meg(4));
            let before = clone_status(active.top).md_total;

            stack.resize_metadata(active, meg(8))?;
            assert_eq!(md.size(), meg(8));
            assert_eq!(stack.layout().metadata_size(), meg(8));
            assert_eq!(clone_status(active.top).md_total, before * 2);
            Ok(())
        })
        .unwrap();

    let events = sim.events();
    let reload: Vec<&SimEvent> = events
        .iter()
        .filter(|e| matches!(e, SimEvent::Suspend(_) | SimEvent::Resume(_) | SimEvent::Load(_)))
        .collect();
    assert_eq!(reload.len(), 5);
    assert!(matches!(reload[0], SimEvent::Suspend(n) if n.ends_with("-clone")));
    assert!(matches!(reload[2], SimEvent::Load(n) if n.ends_with("-md")));
    assert!(matches!(reload[4], SimEvent::Resume(n) if n.ends_with("-clone")));
    assert!(sim.device_names().is_empty());
}

#[test]
fn test_cache_writeback_completes() {
    let sim = sim();
    let layout = CacheLayout::new(
        BlockDevice::new("/dev/fast", FAST),
        BlockDevice::new("/dev/slow", SLOW),
        CacheOptions::new().cache_size(meg(64)).origin_size(meg(512)),
    )
    .unwrap();
    let stack = Stack::new(layout, sim.clone(), sim.clone()).with_waiter(waiter());

    stack
        .activate(|active| {
            sim.set_cache_dirty(active.top.name(), 1000).unwrap();
            let status = stack.wait_for_all_clean(active.top)?;
            assert_eq!(status.dirty, 0);
            assert_eq!(status.policy, "smq");
            Ok(())
        })
        .unwrap();
    assert_eq!(
        removal_order(&sim.events()),
        vec!["cache", "origin", "ssd", "md"]
    );
}

#[test]
fn test_thin_inside_pool_scope() {
    let sim = sim();
    let layout = PoolLayout::new(
        BlockDevice::new("/dev/fast", FAST),
        PoolOptions::new().data_size(meg(512)),
    )
    .unwrap();
    let stack = Stack::new(layout, sim.clone(), sim.clone());

    stack
        .activate(|active| {
            stack.with_new_thin(active.top, meg(256), 0, |thin| {
                assert_eq!(thin.size(), meg(256));
                assert_eq!(sim.device_names().len(), 4);
                Ok(())
            })
        })
        .unwrap();
    assert_eq!(
        removal_order(&sim.events()),
        vec!["thin0", "pool", "data", "md"]
    );
}
