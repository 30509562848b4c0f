//! decode command - turn a status line into a typed record

use std::fmt::Display;

use anyhow::Result;
use dmstack_block::status::{StatusLine, decode, decode_line};
use dmstack_block::{CacheStatus, CloneStatus, DeviceStatus, TargetStatus, ThinPoolStatus};
use serde::Serialize;

/// Target types with a status decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusTarget {
    Clone,
    Cache,
    ThinPool,
}

pub fn execute(target: StatusTarget, status: &str, json: bool) -> Result<()> {
    println!("{}", render(target, status, json)?);
    Ok(())
}

/// Decode `status` and format it for display
pub fn render(target: StatusTarget, status: &str, json: bool) -> Result<String> {
    match target {
        StatusTarget::Clone => render_as::<CloneStatus>(status, json),
        StatusTarget::Cache => render_as::<CacheStatus>(status, json),
        StatusTarget::ThinPool => render_as::<ThinPoolStatus>(status, json),
    }
}

fn render_as<T>(status: &str, json: bool) -> Result<String>
where
    T: TargetStatus + Serialize + Display + std::fmt::Debug,
{
    // accept either bare params or `<start> <length> <type> <params>`
    let is_line = StatusLine::parse(status).is_ok_and(|line| line.target_type == T::TARGET_TYPE);
    let decoded: DeviceStatus<T> = if is_line {
        decode_line(status)?
    } else {
        decode(status.trim())?
    };

    if json {
        return Ok(serde_json::to_string_pretty(&decoded)?);
    }
    Ok(match decoded {
        DeviceStatus::Working(record) => format!("{record:#?}"),
        DeviceStatus::Failed(kind) => format!("{} target reported {kind}", T::TARGET_TYPE),
    })
}
