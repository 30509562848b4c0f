//! CLI command implementations

pub mod clone;
pub mod decode;
pub mod init;
pub mod table;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};
use dmstack_config::{ConfigLoader, HarnessConfig};

/// Load `path` with `DMSTACK_*` overrides applied
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    ConfigLoader::new()
        .with_file(path)
        .load()
        .with_context(|| format!("loading {}", path.display()))
}
