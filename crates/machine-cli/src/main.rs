//! Entry point for the `machine` binary.
//!
//! Delegates to [`machine_cli::run`]. When the plugin handshake variables are
//! present the same binary serves a core driver instead of parsing commands.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    // Unlocked handles: plugin worker threads log to stderr while `run`
    // holds these writers.
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    machine_cli::run(std::env::args_os(), &mut stdout, &mut stderr)
}
