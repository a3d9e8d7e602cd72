//! The plugin side of the handshake.
//!
//! A plugin process verifies it was launched by the controller with
//! [`GuestEnvironment`], starts a listener, and announces the listener's
//! address as its first stdout line with [`announce_address`].
//! [`GuestListener`] is a minimal listener that answers every connection
//! with a one-line JSON [`DriverDescriptor`].

use std::collections::HashMap;
use std::env;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::protocol::{
    DriverDescriptor, PLUGIN_ENV_DRIVER_NAME, PLUGIN_ENV_KEY, PLUGIN_ENV_VALUE,
};

/// Tracing target for the plugin side of the protocol.
const GUEST_TARGET: &str = "machine_plugin::guest";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Handshake variables as seen by a plugin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestEnvironment {
    token: Option<String>,
    driver: Option<String>,
}

impl GuestEnvironment {
    /// Reads the handshake variables from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            token: env::var(PLUGIN_ENV_KEY).ok(),
            driver: env::var(PLUGIN_ENV_DRIVER_NAME).ok(),
        }
    }

    /// Reads the handshake variables from an explicit map.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        Self {
            token: vars.get(PLUGIN_ENV_KEY).cloned(),
            driver: vars.get(PLUGIN_ENV_DRIVER_NAME).cloned(),
        }
    }

    /// Returns `true` when any handshake token is present, valid or not.
    #[must_use]
    pub const fn is_plugin_invocation(&self) -> bool {
        self.token.is_some()
    }

    /// Returns the driver to serve after checking the token.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotLaunchedByController`] when the token is
    /// missing or wrong, and [`PluginError::MissingDriverName`] when no
    /// driver was named.
    pub fn driver_name(&self) -> Result<&str, PluginError> {
        if self.token.as_deref() != Some(PLUGIN_ENV_VALUE) {
            return Err(PluginError::NotLaunchedByController);
        }
        self.driver
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or(PluginError::MissingDriverName {
                variable: PLUGIN_ENV_DRIVER_NAME,
            })
    }
}

/// Writes `address` as a single line and flushes it.
///
/// # Errors
///
/// Returns the underlying write failure.
pub fn announce_address<W: Write>(writer: &mut W, address: &SocketAddr) -> io::Result<()> {
    writeln!(writer, "{address}")?;
    writer.flush()
}

/// Loopback listener answering each connection with a driver descriptor.
#[derive(Debug)]
pub struct GuestListener {
    driver: String,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GuestListener {
    /// Binds an ephemeral loopback port and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Guest`] when the socket cannot be bound or
    /// configured, and [`PluginError::SpawnWorker`] when the accept thread
    /// cannot start.
    pub fn bind(driver: &str) -> Result<Self, PluginError> {
        let listener =
            TcpListener::bind(("127.0.0.1", 0)).map_err(|err| PluginError::guest(driver, err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| PluginError::guest(driver, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| PluginError::guest(driver, err))?;

        let descriptor = serde_json::to_string(&DriverDescriptor::for_driver(driver))
            .map_err(|err| PluginError::guest(driver, io::Error::other(err)))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let owned_driver = driver.to_owned();
        let handle = thread::Builder::new()
            .name(format!("plugin-listener-{driver}"))
            .spawn(move || run_accept_loop(&listener, &owned_driver, &descriptor, &shutdown_flag))
            .map_err(|err| PluginError::spawn_worker(driver, "listener", err))?;

        info!(target: GUEST_TARGET, driver, address = %local_addr, "plugin listener active");
        Ok(Self {
            driver: driver.to_owned(),
            local_addr,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks the accept loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Stops the accept loop and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::WorkerPanicked`] when the accept thread
    /// panicked.
    pub fn join(mut self) -> Result<(), PluginError> {
        self.shutdown();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| PluginError::WorkerPanicked {
                driver: self.driver.clone(),
                worker: "listener",
            }),
            None => Ok(()),
        }
    }
}

impl Drop for GuestListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn run_accept_loop(listener: &TcpListener, driver: &str, descriptor: &str, shutdown: &AtomicBool) {
    let mut last_error = None::<io::ErrorKind>;
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                last_error = None;
                debug!(target: GUEST_TARGET, driver, %peer, "controller connected");
                if let Err(err) = answer(stream, descriptor) {
                    warn!(
                        target: GUEST_TARGET,
                        driver,
                        error = %err,
                        "failed to answer connection"
                    );
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
            Err(err) => {
                let kind = err.kind();
                if last_error != Some(kind) {
                    warn!(target: GUEST_TARGET, driver, error = %err, "plugin accept error");
                }
                last_error = Some(kind);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    debug!(target: GUEST_TARGET, driver, "plugin listener stopped");
}

fn answer(mut stream: TcpStream, descriptor: &str) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    writeln!(stream, "{descriptor}")?;
    stream.flush()
}
