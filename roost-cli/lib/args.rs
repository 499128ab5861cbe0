//! Command line arguments for the `roostd` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use roost_core::config::DEFAULT_CONFIG_PATH;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Arguments for the roostd command.
#[derive(Debug, Parser)]
#[command(name = "roostd", author, version, about = "Node control daemon for the roost hosting platform")]
pub struct RoostdArgs {
    /// Path to the node configuration document
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Subcommand to run instead of the daemon
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Management subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch this node's configuration from the panel and write it to disk
    Configure {
        /// Base URL of the panel
        #[arg(short = 'p', long = "panel-url")]
        panel_url: String,

        /// Application API token used to fetch the node configuration
        #[arg(short = 't', long = "token")]
        token: String,

        /// Identifier of the node to configure this daemon as
        #[arg(short = 'n', long = "node")]
        node: String,

        /// Overwrite an existing configuration file
        #[arg(long, default_value_t = false)]
        r#override: bool,

        /// Skip TLS certificate verification against the panel
        #[arg(long = "allow-insecure", default_value_t = false)]
        allow_insecure: bool,
    },

    /// Print a diagnostics report with credentials redacted
    Diagnostics,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_arguments_are_well_formed() {
        RoostdArgs::command().debug_assert();
    }

    #[test]
    fn test_configure_parses() {
        let args = RoostdArgs::parse_from([
            "roostd",
            "configure",
            "--panel-url",
            "https://panel.example.com",
            "--token",
            "ptla_abc",
            "--node",
            "3",
            "--override",
        ]);

        match args.command {
            Some(Command::Configure {
                panel_url,
                node,
                r#override,
                ..
            }) => {
                assert_eq!(panel_url, "https://panel.example.com");
                assert_eq!(node, "3");
                assert!(r#override);
            }
            _ => panic!("expected the configure subcommand"),
        }
    }

    #[test]
    fn test_default_config_path() {
        let args = RoostdArgs::parse_from(["roostd"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(args.command.is_none());
    }
}
