//! validate command - report configuration problems

use anyhow::{Result, bail};
use dmstack_config::{HarnessConfig, Validator};

pub fn execute(config: &HarnessConfig, strict: bool) -> Result<()> {
    let result = Validator::new().with_strict_mode(strict).validate(config);

    for warning in &result.warnings {
        println!("{warning}");
    }
    for error in &result.errors {
        println!("{error}");
    }

    if !result.is_valid() {
        bail!("configuration has {} error(s)", result.errors.len());
    }
    println!(
        "Configuration OK ({} warning(s))",
        result.warnings.len()
    );
    Ok(())
}
