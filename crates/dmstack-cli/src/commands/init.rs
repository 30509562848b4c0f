//! init command - write a default configuration

use std::path::Path;

use anyhow::{Result, bail};
use dmstack_config::HarnessConfig;

pub fn execute(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, HarnessConfig::default().to_toml()?)?;
    println!("Wrote {}", path.display());
    Ok(())
}
