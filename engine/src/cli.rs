//! CLI interface for Bulwark
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for inspecting and managing
//! plugins and signer trust.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Bulwark plugin host
///
/// Verifies, isolates and loads plugins, and manages which signers are
/// trusted.
#[derive(Parser, Debug)]
#[command(name = "bulwark")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Manage trusted signer thumbprints
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
}

/// Plugin management actions
#[derive(Subcommand, Debug)]
pub enum PluginAction {
    /// List plugins in the install directory
    List,

    /// Load every installed plugin and report the result per plugin
    LoadAll,

    /// Verify a plugin directory's entry binary without loading it
    Verify {
        /// Plugin directory containing plugin.json
        dir: PathBuf,
    },

    /// Copy a plugin into the install directory and load it
    Install {
        /// Source plugin directory
        source: PathBuf,
    },
}

/// Trust management actions
#[derive(Subcommand, Debug)]
pub enum TrustAction {
    /// Show trusted and official thumbprints
    List,

    /// Trust a signer thumbprint
    Add {
        /// Certificate thumbprint (hex)
        thumbprint: String,

        /// Add to the official allow-list instead of the trusted one
        #[arg(long)]
        official: bool,
    },

    /// Stop trusting a signer thumbprint
    Remove {
        /// Certificate thumbprint (hex)
        thumbprint: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_trust_add_official() {
        let cli = Cli::try_parse_from(["bulwark", "--json", "trust", "add", "AB12", "--official"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Command::Trust {
                action: TrustAction::Add { thumbprint, official },
            } => {
                assert_eq!(thumbprint, "AB12");
                assert!(official);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_plugins_verify() {
        let cli = Cli::try_parse_from(["bulwark", "plugins", "verify", "./dps-meter"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Plugins {
                action: PluginAction::Verify { .. }
            }
        ));
    }

    #[test]
    fn test_load_all_is_kebab_case() {
        assert!(Cli::try_parse_from(["bulwark", "plugins", "load-all"]).is_ok());
    }
}
