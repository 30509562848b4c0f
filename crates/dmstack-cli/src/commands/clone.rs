//! clone command - bring up a clone stack and optionally hydrate it

use std::sync::Arc;

use anyhow::Result;
use dmstack_block::process::dev_size;
use dmstack_block::units::format_sectors;
use dmstack_block::{
    BlockDevice, CloneLayout, CloneStatus, ConditionWaiter, ControlPlane, DmSetup, ProcessRunner,
    SimControlPlane, Stack, SystemRunner,
};
use dmstack_config::HarnessConfig;
use dmstack_telemetry::PhaseBuilder;
use tracing::info;

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    pub initial: String,
    pub hydrated: Option<CloneStatus>,
}

pub fn execute(config: &HarnessConfig, simulate: bool, hydrate: bool) -> Result<()> {
    let report = run(config, simulate, hydrate)?;
    println!("{}", report.initial);
    if let Some(status) = report.hydrated {
        println!(
            "hydrated {}/{} regions of {}",
            status.nr_hydrated,
            status.nr_regions,
            format_sectors(status.region_size)
        );
    }
    Ok(())
}

pub fn run(config: &HarnessConfig, simulate: bool, hydrate: bool) -> Result<CloneReport> {
    let options = config.clone.clone();
    let devices = &config.devices;

    let (control, runner): (Arc<dyn ControlPlane>, Arc<dyn ProcessRunner>) = if simulate {
        let sim = Arc::new(SimControlPlane::new());
        sim.add_device(
            &devices.fast,
            devices.fast_size.unwrap_or(options.size + options.metadata_size),
        );
        sim.add_device(&devices.slow, devices.slow_size.unwrap_or(options.size));
        // finish within a handful of polls
        sim.set_hydration_step(options.size.div_ceil(options.region_size.max(1)).div_ceil(8));
        let control: Arc<dyn ControlPlane> = sim.clone();
        let runner: Arc<dyn ProcessRunner> = sim;
        (control, runner)
    } else {
        let dmsetup = DmSetup::new()
            .program(&config.dm.dmsetup)
            .dev_dir(&config.dm.dev_dir);
        let control: Arc<dyn ControlPlane> = Arc::new(dmsetup);
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner);
        (control, runner)
    };

    let fast_size = match devices.fast_size {
        Some(size) => size,
        None => dev_size(runner.as_ref(), &devices.fast)?,
    };
    let slow_size = match devices.slow_size {
        Some(size) => size,
        None => dev_size(runner.as_ref(), &devices.slow)?,
    };

    let layout = CloneLayout::new(
        BlockDevice::new(&devices.fast, fast_size),
        BlockDevice::new(&devices.slow, slow_size),
        options.clone(),
    )?;
    let regions = layout.nr_regions();
    let waiter = ConditionWaiter::new(config.wait.timeout()).with_interval(config.wait.poll_interval());
    let stack = Stack::new(layout, control, runner)
        .with_waiter(waiter)
        .with_name_prefix(config.dm.name_prefix.clone())
        .with_min_scope(config.dm.min_scope());

    let _phase = PhaseBuilder::new("clone")
        .field("size", format_sectors(options.size))
        .field("simulate", simulate)
        .enter();

    let report = stack.activate(|active| {
        let initial = active.top.status_line()?;
        info!(device = %active.top.name(), status = %initial, "clone active");

        let hydrated = if hydrate {
            if !options.hydration {
                stack.enable_hydration(active.top)?;
            }
            let _phase = PhaseBuilder::new("hydrate").field("regions", regions).enter();
            Some(stack.wait_until_hydrated(active.top)?)
        } else {
            None
        };
        Ok(CloneReport { initial, hydrated })
    })?;
    Ok(report)
}
