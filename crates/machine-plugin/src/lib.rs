//! Driver plugin subprocess protocol for the machine controller.
//!
//! The controller delegates per-backend work to plugin binaries that run out
//! of process. This crate covers the local transport between the two:
//!
//! - [`BinaryLocator`] maps a driver name to an executable. Core drivers are
//!   served by the controller's own binary; others are `<prefix><driver>`
//!   binaries on `PATH`.
//! - [`LocalBinaryExecutor`] spawns the plugin with the handshake environment
//!   and hands back its stdout and stderr.
//! - [`LineStream`] drains a pipe on a worker thread into a channel of lines.
//! - [`Plugin`] reads the address from the first stdout line, then forwards
//!   later stdout lines at info and stderr lines at debug until stopped.
//! - [`PluginSession`] runs a plugin on a background thread.
//! - The [`guest`] module is the plugin-side half of the handshake.
//!
//! Shutdown is cooperative: closing a session drops the child's stdin and
//! closes its output pipes. A kill grace period can be configured for
//! plugins that ignore pipe closure.

mod cancel;
pub mod error;
pub mod guest;
pub mod locator;
mod pipe;
pub mod process;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stream;

#[cfg(test)]
mod tests;

pub use self::cancel::ShutdownToken;
pub use self::error::{PluginError, StartStage};
pub use self::guest::{GuestEnvironment, GuestListener, announce_address};
pub use self::locator::{BinaryLocator, CoreDrivers};
pub use self::process::{BinaryExecutor, LineSource, LocalBinaryExecutor, PluginStreams};
pub use self::protocol::{
    DEFAULT_BINARY_PREFIX, DriverDescriptor, PLUGIN_ENV_DRIVER_NAME, PLUGIN_ENV_KEY,
    PLUGIN_ENV_VALUE,
};
pub use self::server::{
    DEFAULT_ADDRESS_TIMEOUT, DriverPlugin, LogSink, Plugin, PluginServer, PluginStreamer,
    SessionState, TracingLogSink,
};
pub use self::session::{PluginSession, SessionOptions};
pub use self::stream::LineStream;
