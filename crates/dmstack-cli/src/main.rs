//! dmstack CLI - bring up and observe device-mapper stacks

use anyhow::Result;
use clap::Parser;
use dmstack_cli::commands::{self, load_config};
use dmstack_cli::{Cli, Commands};
use dmstack_config::{LogConfig, LogLevel};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = cli.command.config_path().map(load_config).transpose()?;

    // quiet by default unless a config file says otherwise
    let mut log = loaded.as_ref().map_or_else(
        || LogConfig {
            level: LogLevel::Warn,
            ..LogConfig::default()
        },
        |c| c.log.clone(),
    );
    match cli.verbose {
        0 => {}
        1 => log.level = LogLevel::Info,
        2 => log.level = LogLevel::Debug,
        _ => log.level = LogLevel::Trace,
    }
    dmstack_telemetry::init_logging(&log)?;

    let config = loaded.unwrap_or_default();
    match cli.command {
        Commands::Init { path, force } => commands::init::execute(&path, force),
        Commands::Validate { strict, .. } => commands::validate::execute(&config, strict),
        Commands::Decode { target, status, json } => {
            commands::decode::execute(target, &status, json)
        }
        Commands::Table { stack, .. } => commands::table::execute(&config, stack),
        Commands::Clone {
            simulate, hydrate, ..
        } => commands::clone::execute(&config, simulate, hydrate),
    }
}
