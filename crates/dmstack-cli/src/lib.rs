//! dmstack-cli library exports
//!
//! Argument definitions live here so they can be tested without spawning
//! the binary.

pub mod commands;

use std::path::{Path, PathBuf};

use clap::Parser;

#[derive(Parser)]
#[command(name = "dmstack")]
#[command(author, version, about = "Bring up and observe device-mapper stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path
        #[arg(default_value = "dmstack.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load a configuration and report problems
    Validate {
        #[arg(short, long)]
        config: PathBuf,
        /// Also report unusual but legal settings
        #[arg(long)]
        strict: bool,
    },
    /// Decode a target status line
    Decode {
        #[arg(value_enum)]
        target: commands::decode::StatusTarget,
        /// Status parameters, or a full `dmsetup status` line
        status: String,
        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the tables a stack would load
    Table {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, value_enum, default_value = "clone")]
        stack: commands::table::StackKind,
    },
    /// Bring up a clone stack, report its status and tear it down
    Clone {
        #[arg(short, long)]
        config: PathBuf,
        /// Run against the in-process simulated kernel
        #[arg(long)]
        simulate: bool,
        /// Wait for hydration to finish before tearing down
        #[arg(long)]
        hydrate: bool,
    },
}

impl Commands {
    /// Configuration file the command reads, if any
    pub fn config_path(&self) -> Option<&Path> {
        match self {
            Self::Validate { config, .. } | Self::Table { config, .. } | Self::Clone { config, .. } => {
                Some(config)
            }
            Self::Init { .. } | Self::Decode { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clone() {
        let cli = Cli::try_parse_from(["dmstack", "-vv", "clone", "-c", "h.toml", "--simulate"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Clone {
                ref config,
                simulate,
                hydrate,
            } => {
                assert_eq!(config, Path::new("h.toml"));
                assert!(simulate);
                assert!(!hydrate);
            }
            _ => panic!("expected clone"),
        }
        assert_eq!(cli.command.config_path(), Some(Path::new("h.toml")));
    }

    #[test]
    fn test_parse_decode() {
        let cli = Cli::try_parse_from(["dmstack", "decode", "thin-pool", "0 1/2 3/4 - rw", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Decode {
                target: commands::decode::StatusTarget::ThinPool,
                json: true,
                ..
            }
        ));
        assert!(cli.command.config_path().is_none());
    }

    #[test]
    fn test_init_default_path() {
        let cli = Cli::try_parse_from(["dmstack", "init"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { ref path, force: false } if path == Path::new("dmstack.toml")));
    }

    #[test]
    fn test_validate_requires_config() {
        assert!(Cli::try_parse_from(["dmstack", "validate"]).is_err());
        assert!(Cli::try_parse_from(["dmstack", "decode", "mirror", "x"]).is_err());
    }
}
