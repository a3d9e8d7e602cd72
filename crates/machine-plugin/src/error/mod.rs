//! Domain errors raised while locating, launching and talking to driver
//! plugins.
//!
//! All errors use a `thiserror`-derived enum with structured context so
//! callers can inspect the failure programmatically. Every fatal variant
//! carries the driver name. I/O errors are wrapped in `Arc` to satisfy the
//! `result_large_err` Clippy lint.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Step of plugin start-up that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStage {
    /// The child's standard input pipe was not captured.
    StdinPipe,
    /// The child's standard output pipe was not captured.
    StdoutPipe,
    /// The child's standard error pipe was not captured.
    StderrPipe,
    /// The operating system refused to create the process.
    Spawn,
}

impl fmt::Display for StartStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StdinPipe => write!(f, "stdin pipe"),
            Self::StdoutPipe => write!(f, "stdout pipe"),
            Self::StderrPipe => write!(f, "stderr pipe"),
            Self::Spawn => write!(f, "spawn"),
        }
    }
}

/// Errors arising from driver plugin operations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No executable could be found for the driver.
    #[error("driver \"{driver}\" not found; is its plugin binary accessible on PATH?")]
    BinaryNotFound {
        /// Driver name that was looked up.
        driver: String,
    },

    /// The plugin process could not be started.
    #[error("failed to start plugin for driver \"{driver}\" ({stage}): {source}")]
    StartFailed {
        /// Driver name.
        driver: String,
        /// Start-up step that failed.
        stage: StartStage,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The plugin did not announce a usable address on its first stdout line.
    #[error("reading plugin address for driver \"{driver}\" failed: {message}")]
    Handshake {
        /// Driver name.
        driver: String,
        /// Description of the failure.
        message: String,
        /// Optional underlying read error.
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The address was not announced within the configured bound.
    #[error("failed to dial the plugin server for driver \"{driver}\" in {timeout_ms} ms")]
    AddressTimeout {
        /// Driver name.
        driver: String,
        /// Configured bound in milliseconds.
        timeout_ms: u64,
    },

    /// The session ended without ever announcing an address.
    #[error("plugin for driver \"{driver}\" stopped before announcing an address")]
    AddressUnavailable {
        /// Driver name.
        driver: String,
    },

    /// Closing the plugin's pipes failed.
    #[error("error closing local plugin binary for driver \"{driver}\": {source}")]
    Close {
        /// Driver name.
        driver: String,
        /// First close failure encountered.
        #[source]
        source: Arc<io::Error>,
    },

    /// An operation was invoked in a lifecycle state that does not allow it.
    #[error("cannot {operation} plugin for driver \"{driver}\" while it is {state}")]
    InvalidState {
        /// Driver name.
        driver: String,
        /// Operation that was attempted.
        operation: &'static str,
        /// Lifecycle state at the time of the call.
        state: String,
    },

    /// A background worker thread could not be created.
    #[error("failed to spawn {worker} worker for driver \"{driver}\": {source}")]
    SpawnWorker {
        /// Driver name.
        driver: String,
        /// Worker role.
        worker: &'static str,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A background worker thread panicked.
    #[error("{worker} worker for driver \"{driver}\" panicked")]
    WorkerPanicked {
        /// Driver name.
        driver: String,
        /// Worker role.
        worker: &'static str,
    },

    /// The process was started as a plugin without the controller's token.
    #[error("this binary is a driver plugin and cannot be invoked directly")]
    NotLaunchedByController,

    /// The controller did not say which driver to serve.
    #[error("plugin launched without a driver name in {variable}")]
    MissingDriverName {
        /// Environment variable expected to carry the name.
        variable: &'static str,
    },

    /// I/O failure on the plugin side of the protocol.
    #[error("plugin I/O error for driver \"{driver}\": {source}")]
    Guest {
        /// Driver name.
        driver: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl PluginError {
    /// Returns `true` for failures a caller may retry without tearing down
    /// the session.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::AddressTimeout { .. })
    }

    pub(crate) fn start_failed(driver: &str, stage: StartStage, source: io::Error) -> Self {
        Self::StartFailed {
            driver: driver.to_owned(),
            stage,
            source: Arc::new(source),
        }
    }

    pub(crate) fn close(driver: &str, source: io::Error) -> Self {
        Self::Close {
            driver: driver.to_owned(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn spawn_worker(driver: &str, worker: &'static str, source: io::Error) -> Self {
        Self::SpawnWorker {
            driver: driver.to_owned(),
            worker,
            source: Arc::new(source),
        }
    }

    pub(crate) fn guest(driver: &str, source: io::Error) -> Self {
        Self::Guest {
            driver: driver.to_owned(),
            source: Arc::new(source),
        }
    }
}
