//! Destinations for forwarded plugin output.

use std::fmt;

use tracing::{debug, info};

/// Tracing target for plugin stdout lines.
pub const STDOUT_TARGET: &str = "machine_plugin::output::stdout";

/// Tracing target for plugin stderr lines.
pub const STDERR_TARGET: &str = "machine_plugin::output::stderr";

/// Receives plugin output lines after the handshake.
pub trait LogSink: Send + Sync {
    /// A stdout line from the plugin serving `machine`.
    fn plugin_stdout(&self, machine: &str, line: &str);

    /// A stderr line from the plugin serving `machine`.
    fn plugin_stderr(&self, machine: &str, line: &str);
}

impl fmt::Debug for dyn LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

/// Forwards plugin output into `tracing`: stdout at info, stderr at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn plugin_stdout(&self, machine: &str, line: &str) {
        info!(target: STDOUT_TARGET, machine, "({machine}) {line}");
    }

    fn plugin_stderr(&self, machine: &str, line: &str) {
        debug!(target: STDERR_TARGET, machine, "({machine}) DBG | {line}");
    }
}
