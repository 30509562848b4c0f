//! table command - print the tables a stack would load
//!
//! Nothing is activated. Support devices are shown under the names they
//! would get, minus the per-process suffix.

use anyhow::Result;
use dmstack_block::{BlockDevice, CacheLayout, CloneLayout, PoolLayout, StackLayout, Table};
use dmstack_config::HarnessConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StackKind {
    Clone,
    Cache,
    Pool,
}

pub fn execute(config: &HarnessConfig, kind: StackKind) -> Result<()> {
    print!("{}", render(config, kind)?);
    Ok(())
}

pub fn render(config: &HarnessConfig, kind: StackKind) -> Result<String> {
    let path = |role: &str| format!("{}/{}-{role}", config.dm.dev_dir, config.dm.name_prefix);
    let devices = &config.devices;

    let (name, support, top): (&str, Vec<(&str, Table)>, Table) = match kind {
        StackKind::Clone => {
            let o = &config.clone;
            let layout = CloneLayout::new(
                BlockDevice::new(&devices.fast, devices.fast_size.unwrap_or(o.size + o.metadata_size)),
                BlockDevice::new(&devices.slow, devices.slow_size.unwrap_or(o.size)),
                o.clone(),
            )?;
            let top = layout.clone_table(&path("md"), &path("dest"), &path("source"))?;
            (layout.kind(), layout.support_tables()?, top)
        }
        StackKind::Cache => {
            let o = &config.cache;
            let layout = CacheLayout::new(
                BlockDevice::new(&devices.fast, devices.fast_size.unwrap_or(o.metadata_size + o.cache_size)),
                BlockDevice::new(&devices.slow, devices.slow_size.unwrap_or(o.origin_size)),
                o.clone(),
            )?;
            let top = layout.cache_table(&path("md"), &path("ssd"), &path("origin"))?;
            (layout.kind(), layout.support_tables()?, top)
        }
        StackKind::Pool => {
            let o = &config.pool;
            let layout = PoolLayout::new(
                BlockDevice::new(&devices.fast, devices.fast_size.unwrap_or(o.metadata_size + o.data_size)),
                o.clone(),
            )?;
            let top = layout.pool_table(&path("md"), &path("data"))?;
            (layout.kind(), layout.support_tables()?, top)
        }
    };

    let mut out = String::new();
    for (role, table) in support.iter().map(|(r, t)| (*r, t)).chain([(name, &top)]) {
        out.push_str(&format!("# {}\n{table}\n", path(role)));
    }
    Ok(out)
}
