//! Command-line argument definitions for the `machine` binary.

use clap::{Parser, Subcommand};

/// Command-line interface for the machine controller.
#[derive(Parser, Debug)]
#[command(name = "machine", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Structured subcommands.
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum CliCommand {
    /// Inspects driver plugins.
    Driver {
        /// The driver action to perform.
        #[command(subcommand)]
        action: DriverAction,
    },
}

/// Driver plugin actions.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum DriverAction {
    /// Prints the executable that serves a driver.
    Path {
        /// Driver name, for example `virtualbox`.
        name: String,
    },
    /// Launches a driver plugin, dials its address and prints its descriptor.
    Probe {
        /// Driver name, for example `virtualbox`.
        name: String,
        /// Machine name used to tag forwarded plugin output.
        #[arg(long)]
        machine_name: Option<String>,
    },
}
