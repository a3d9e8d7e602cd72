//! Plugin session orchestration.
//!
//! A [`Plugin`] starts its executor, reads the address handshake from the
//! first stdout line, then forwards every later stdout and stderr line to a
//! [`LogSink`] until it is stopped or both streams end. The address is
//! published through a single-use channel and cached after the first
//! successful [`Plugin::address`] call.

mod sink;
mod state;

use std::io::BufRead;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select_biased};
use tracing::{debug, info, warn};

use crate::cancel::ShutdownToken;
use crate::error::PluginError;
use crate::process::{BinaryExecutor, LineSource, PluginStreams};
use crate::protocol::parse_address_line;
use crate::stream::LineStream;

pub use sink::{LogSink, STDERR_TARGET, STDOUT_TARGET, TracingLogSink};
pub use state::SessionState;

/// Tracing target for session orchestration.
pub(crate) const SERVER_TARGET: &str = "machine_plugin::server";

/// Default bound on [`Plugin::address`].
pub const DEFAULT_ADDRESS_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for each stream worker to acknowledge.
const STREAM_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Process lifecycle capability of a plugin.
pub trait PluginServer {
    /// Returns the address announced by the plugin, waiting a bounded time.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AddressTimeout`] when the bound expires and
    /// [`PluginError::AddressUnavailable`] when the session ended without an
    /// address.
    fn address(&self) -> Result<String, PluginError>;

    /// Runs the session until it is closed or the plugin's streams end.
    ///
    /// # Errors
    ///
    /// Returns start, handshake, worker and close failures.
    fn serve(&self) -> Result<(), PluginError>;

    /// Signals the session to stop. Never blocks and may be called any
    /// number of times.
    ///
    /// # Errors
    ///
    /// Implementations may report failures delivering the signal.
    fn close(&self) -> Result<(), PluginError>;
}

/// Streaming capability of a plugin.
pub trait PluginStreamer {
    /// Starts a worker forwarding lines from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SpawnWorker`] when the worker cannot start.
    fn attach_stream(&self, label: &'static str, source: LineSource)
    -> Result<LineStream, PluginError>;
}

/// A plugin offering both capabilities.
pub trait DriverPlugin: PluginServer + PluginStreamer {}

impl<T: PluginServer + PluginStreamer> DriverPlugin for T {}

/// One plugin session owning its executor.
pub struct Plugin<E> {
    executor: Mutex<E>,
    driver: String,
    machine_name: String,
    address: OnceLock<String>,
    address_tx: Mutex<Option<Sender<String>>>,
    address_rx: Mutex<Option<Receiver<String>>>,
    stop: ShutdownToken,
    state: Mutex<SessionState>,
    address_timeout: Duration,
    sink: Arc<dyn LogSink>,
}

impl<E> std::fmt::Debug for Plugin<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("driver", &self.driver)
            .field("machine_name", &self.machine_name)
            .field("address", &self.address.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum DispatchEnd {
    Stopped,
    StreamsEnded,
}

impl<E: BinaryExecutor> Plugin<E> {
    /// Wraps `executor` in a new session. The machine name defaults to the
    /// driver name.
    #[must_use]
    pub fn new(executor: E) -> Self {
        let driver = executor.driver_name().to_owned();
        let (address_tx, address_rx) = crossbeam_channel::bounded(1);
        Self {
            executor: Mutex::new(executor),
            machine_name: driver.clone(),
            driver,
            address: OnceLock::new(),
            address_tx: Mutex::new(Some(address_tx)),
            address_rx: Mutex::new(Some(address_rx)),
            stop: ShutdownToken::new(),
            state: Mutex::new(SessionState::NotStarted),
            address_timeout: DEFAULT_ADDRESS_TIMEOUT,
            sink: Arc::new(TracingLogSink),
        }
    }
}

impl<E> Plugin<E> {
    /// Tags forwarded output with `name`.
    #[must_use]
    pub fn with_machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = name.into();
        self
    }

    /// Overrides the bound on [`Plugin::address`].
    #[must_use]
    pub const fn with_address_timeout(mut self, timeout: Duration) -> Self {
        self.address_timeout = timeout;
        self
    }

    /// Sends forwarded output to `sink` instead of `tracing`.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Driver served by the plugin.
    #[must_use]
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Name used to tag forwarded output.
    #[must_use]
    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Returns `true` once [`Plugin::close`] has been called.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        debug!(
            target: SERVER_TARGET,
            driver = %self.driver,
            from = %*state,
            to = %next,
            "plugin session state change"
        );
        *state = next;
    }

    /// Drops the address sender so waiting callers see the session ended.
    fn abandon_address(&self) {
        drop(lock(&self.address_tx).take());
    }

    fn wait_for_address(&self) -> Result<String, PluginError> {
        if let Some(address) = self.address.get() {
            return Ok(address.clone());
        }
        let mut slot = lock(&self.address_rx);
        // Another caller may have consumed the channel while we waited.
        if let Some(address) = self.address.get() {
            return Ok(address.clone());
        }
        let Some(receiver) = slot.as_ref() else {
            return Err(self.address_unavailable());
        };
        match receiver.recv_timeout(self.address_timeout) {
            Ok(address) => {
                let cached = self.address.get_or_init(|| address).clone();
                *slot = None;
                Ok(cached)
            }
            Err(RecvTimeoutError::Timeout) => Err(PluginError::AddressTimeout {
                driver: self.driver.clone(),
                timeout_ms: u64::try_from(self.address_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                *slot = None;
                Err(self.address_unavailable())
            }
        }
    }

    fn address_unavailable(&self) -> PluginError {
        PluginError::AddressUnavailable {
            driver: self.driver.clone(),
        }
    }

    fn publish_address(&self, address: &str) {
        if let Some(address_tx) = lock(&self.address_tx).take() {
            // Capacity one: never blocks. Dropping the sender afterwards
            // closes the channel behind the single value.
            if address_tx.send(address.to_owned()).is_err() {
                debug!(
                    target: SERVER_TARGET,
                    driver = %self.driver,
                    "address receiver already gone"
                );
            }
        }
        info!(
            target: SERVER_TARGET,
            driver = %self.driver,
            machine = %self.machine_name,
            address,
            "plugin announced address"
        );
    }

    /// Reads the handshake line on a worker so a stop signal can interrupt
    /// the wait. Returns `None` when stopped first.
    fn await_handshake(
        &self,
        stdout: LineSource,
    ) -> Result<Option<(String, LineSource)>, PluginError> {
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let driver = self.driver.clone();
        thread::Builder::new()
            .name(format!("plugin-handshake-{}", self.driver))
            .spawn(move || {
                let mut source = stdout;
                let result = read_handshake_line(&driver, &mut source);
                if result_tx.send((result, source)).is_err() {
                    debug!(target: SERVER_TARGET, driver = %driver, "handshake abandoned");
                }
            })
            .map_err(|err| PluginError::spawn_worker(&self.driver, "handshake", err))?;

        select_biased! {
            recv(self.stop.signal()) -> _ => Ok(None),
            recv(result_rx) -> message => match message {
                Ok((Ok(address), source)) => Ok(Some((address, source))),
                Ok((Err(err), _)) => Err(err),
                Err(_) => Err(PluginError::WorkerPanicked {
                    driver: self.driver.clone(),
                    worker: "handshake",
                }),
            },
        }
    }

    /// Forwards lines until stopped or both streams end.
    fn dispatch(&self, stdout: &LineStream, stderr: &LineStream) -> DispatchEnd {
        let never = crossbeam_channel::never::<String>();
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            let out = if stdout_open { stdout.lines() } else { &never };
            let err = if stderr_open { stderr.lines() } else { &never };
            select_biased! {
                recv(self.stop.signal()) -> _ => return DispatchEnd::Stopped,
                recv(out) -> message => match message {
                    Ok(line) => self.sink.plugin_stdout(&self.machine_name, &line),
                    Err(_) => stdout_open = false,
                },
                recv(err) -> message => match message {
                    Ok(line) => self.sink.plugin_stderr(&self.machine_name, &line),
                    Err(_) => stderr_open = false,
                },
            }
        }
        DispatchEnd::StreamsEnded
    }
}

impl<E: BinaryExecutor> Plugin<E> {
    fn lock_executor(&self) -> MutexGuard<'_, E> {
        lock(&self.executor)
    }

    /// Moves `NotStarted` to `Starting`. Returns `false` when the session
    /// was closed before it started.
    fn begin(&self) -> Result<bool, PluginError> {
        let mut state = lock(&self.state);
        if *state != SessionState::NotStarted {
            return Err(PluginError::InvalidState {
                driver: self.driver.clone(),
                operation: "serve",
                state: state.to_string(),
            });
        }
        if self.stop.is_cancelled() {
            *state = SessionState::Closed;
            return Ok(false);
        }
        *state = SessionState::Starting;
        Ok(true)
    }

    fn run(&self) -> Result<(), PluginError> {
        let PluginStreams { stdout, stderr } = self.lock_executor().start()?;
        let result = self.run_started(stdout, stderr);
        if result.is_err() {
            self.abort_executor();
        }
        result
    }

    fn run_started(&self, stdout: LineSource, stderr: LineSource) -> Result<(), PluginError> {
        self.set_state(SessionState::AwaitingAddress);
        let Some((address, stdout)) = self.await_handshake(stdout)? else {
            info!(
                target: SERVER_TARGET,
                driver = %self.driver,
                "plugin stopped before announcing an address"
            );
            self.abandon_address();
            self.set_state(SessionState::Stopping);
            return self.lock_executor().close();
        };
        self.publish_address(&address);

        let stdout_stream = self.attach_stream("stdout", stdout)?;
        let stderr_stream = self.attach_stream("stderr", stderr)?;
        self.set_state(SessionState::Streaming);

        match self.dispatch(&stdout_stream, &stderr_stream) {
            DispatchEnd::Stopped => {
                info!(target: SERVER_TARGET, driver = %self.driver, "stopping plugin session");
            }
            DispatchEnd::StreamsEnded => {
                info!(target: SERVER_TARGET, driver = %self.driver, "plugin output ended");
            }
        }

        self.set_state(SessionState::Stopping);
        stdout_stream.stop();
        stderr_stream.stop();
        let closed = self.lock_executor().close();
        for stream in [stdout_stream, stderr_stream] {
            let label = stream.label();
            if !stream.join(STREAM_ACK_TIMEOUT) {
                warn!(
                    target: SERVER_TARGET,
                    driver = %self.driver,
                    stream = label,
                    "stream worker did not acknowledge shutdown"
                );
            }
        }
        closed
    }

    /// Best-effort executor teardown after a failure.
    fn abort_executor(&self) {
        if let Err(err) = self.lock_executor().close() {
            debug!(
                target: SERVER_TARGET,
                driver = %self.driver,
                error = %err,
                "executor close after failure"
            );
        }
    }
}

impl<E: BinaryExecutor> PluginServer for Plugin<E> {
    fn address(&self) -> Result<String, PluginError> {
        self.wait_for_address()
    }

    fn serve(&self) -> Result<(), PluginError> {
        if !self.begin()? {
            debug!(target: SERVER_TARGET, driver = %self.driver, "closed before serve");
            self.abandon_address();
            return Ok(());
        }
        let result = self.run();
        match &result {
            Ok(()) => self.set_state(SessionState::Closed),
            Err(err) => {
                warn!(
                    target: SERVER_TARGET,
                    driver = %self.driver,
                    error = %err,
                    "plugin session failed"
                );
                self.abandon_address();
                self.set_state(SessionState::Failed);
            }
        }
        result
    }

    fn close(&self) -> Result<(), PluginError> {
        if self.stop.cancel() {
            debug!(target: SERVER_TARGET, driver = %self.driver, "stop requested");
        }
        if self.state() == SessionState::NotStarted {
            self.abandon_address();
        }
        Ok(())
    }
}

impl<E> PluginStreamer for Plugin<E> {
    fn attach_stream(
        &self,
        label: &'static str,
        source: LineSource,
    ) -> Result<LineStream, PluginError> {
        LineStream::attach(&self.driver, label, source)
    }
}

fn read_handshake_line(driver: &str, source: &mut LineSource) -> Result<String, PluginError> {
    let mut line = String::new();
    let read = source.read_line(&mut line).map_err(|err| PluginError::Handshake {
        driver: driver.to_owned(),
        message: String::from("error reading the address line"),
        source: Some(Arc::new(err)),
    })?;
    if read == 0 {
        return Err(PluginError::Handshake {
            driver: driver.to_owned(),
            message: String::from("plugin closed stdout before announcing an address"),
            source: None,
        });
    }
    parse_address_line(&line)
        .map(str::to_owned)
        .ok_or_else(|| PluginError::Handshake {
            driver: driver.to_owned(),
            message: String::from("plugin announced an empty address"),
            source: None,
        })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
