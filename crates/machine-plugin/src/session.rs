//! Background plugin sessions.
//!
//! [`PluginSession`] resolves a driver, builds its [`Plugin`] and runs
//! [`PluginServer::serve`] on a dedicated thread so callers only deal with
//! the address and shutdown.

use std::ffi::OsString;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::PluginError;
use crate::locator::BinaryLocator;
use crate::process::{BinaryExecutor, LocalBinaryExecutor};
use crate::server::{DEFAULT_ADDRESS_TIMEOUT, LogSink, Plugin, PluginServer, SERVER_TARGET};

/// Settings applied to a launched plugin.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Tag for forwarded output. Defaults to the driver name.
    pub machine_name: Option<String>,
    /// Bound on [`PluginSession::address`].
    pub address_timeout: Duration,
    /// Forced-termination grace period; `None` keeps shutdown cooperative.
    pub kill_grace: Option<Duration>,
    /// Extra arguments passed to the plugin binary.
    pub args: Vec<OsString>,
    /// Destination for forwarded output. Defaults to `tracing`.
    pub sink: Option<Arc<dyn LogSink>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            machine_name: None,
            address_timeout: DEFAULT_ADDRESS_TIMEOUT,
            kill_grace: None,
            args: Vec::new(),
            sink: None,
        }
    }
}

/// A plugin served on a background thread.
#[derive(Debug)]
pub struct PluginSession<E: BinaryExecutor + 'static> {
    plugin: Arc<Plugin<E>>,
    worker: Option<JoinHandle<Result<(), PluginError>>>,
}

impl PluginSession<LocalBinaryExecutor> {
    /// Resolves `driver` and starts serving its plugin binary.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::BinaryNotFound`] when the driver cannot be
    /// resolved and [`PluginError::SpawnWorker`] when the serve thread
    /// cannot start. Start and handshake failures surface through
    /// [`PluginSession::address`] and [`PluginSession::join`].
    pub fn launch(
        locator: &BinaryLocator,
        driver: &str,
        options: &SessionOptions,
    ) -> Result<Self, PluginError> {
        let binary = locator.resolve(driver)?;
        let executor = LocalBinaryExecutor::new(driver, binary)
            .with_args(options.args.iter().cloned())
            .with_kill_grace(options.kill_grace);
        let mut plugin = Plugin::new(executor).with_address_timeout(options.address_timeout);
        if let Some(name) = &options.machine_name {
            plugin = plugin.with_machine_name(name.clone());
        }
        if let Some(sink) = &options.sink {
            plugin = plugin.with_log_sink(Arc::clone(sink));
        }
        Self::start(plugin)
    }
}

impl<E: BinaryExecutor + 'static> PluginSession<E> {
    /// Serves `plugin` on a new thread.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SpawnWorker`] when the thread cannot start.
    pub fn start(plugin: Plugin<E>) -> Result<Self, PluginError> {
        let shared = Arc::new(plugin);
        let serving = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("plugin-serve-{}", shared.driver()))
            .spawn(move || serving.serve())
            .map_err(|err| PluginError::spawn_worker(shared.driver(), "serve", err))?;
        Ok(Self {
            plugin: shared,
            worker: Some(worker),
        })
    }

    /// The served plugin.
    #[must_use]
    pub fn plugin(&self) -> &Plugin<E> {
        &self.plugin
    }

    /// Waits a bounded time for the plugin's address.
    ///
    /// # Errors
    ///
    /// See [`PluginServer::address`].
    pub fn address(&self) -> Result<String, PluginError> {
        self.plugin.address()
    }

    /// Signals the session to stop without waiting.
    ///
    /// # Errors
    ///
    /// See [`PluginServer::close`].
    pub fn close(&self) -> Result<(), PluginError> {
        self.plugin.close()
    }

    /// Stops the session and returns the result of serving it.
    ///
    /// # Errors
    ///
    /// Returns the serve failure, or [`PluginError::WorkerPanicked`] when the
    /// serve thread panicked.
    pub fn join(mut self) -> Result<(), PluginError> {
        self.plugin.close()?;
        self.wait_worker()
    }

    /// Waits for the plugin to finish on its own and returns the result.
    ///
    /// # Errors
    ///
    /// As for [`PluginSession::join`].
    pub fn wait(mut self) -> Result<(), PluginError> {
        self.wait_worker()
    }

    fn wait_worker(&mut self) -> Result<(), PluginError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.join().map_err(|_| PluginError::WorkerPanicked {
            driver: self.plugin.driver().to_owned(),
            worker: "serve",
        })?
    }
}

impl<E: BinaryExecutor + 'static> Drop for PluginSession<E> {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        debug!(
            target: SERVER_TARGET,
            driver = %self.plugin.driver(),
            "closing unjoined plugin session"
        );
        if let Err(err) = self.plugin.close() {
            warn!(
                target: SERVER_TARGET,
                driver = %self.plugin.driver(),
                error = %err,
                "failed to close plugin session on drop"
            );
        }
    }
}
