//! Plugin process spawning and teardown.
//!
//! [`LocalBinaryExecutor`] launches a resolved plugin binary with the
//! handshake environment, hands back its stdout and stderr as line sources,
//! and closes those pipes on [`BinaryExecutor::close`]. Shutdown is
//! cooperative unless a kill grace period is configured.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{PluginError, StartStage};
use crate::pipe::{self, ClosePipe, PipeHandle};
use crate::protocol::{PLUGIN_ENV_DRIVER_NAME, PLUGIN_ENV_KEY, PLUGIN_ENV_VALUE};

/// Tracing target for plugin process management.
pub(crate) const PROCESS_TARGET: &str = "machine_plugin::process";

/// Blocking, line-buffered byte source produced by a plugin stream.
pub type LineSource = Box<dyn BufRead + Send>;

/// The two output streams of a started plugin.
pub struct PluginStreams {
    /// Standard output: the address line followed by informational logs.
    pub stdout: LineSource,
    /// Standard error: debug logs.
    pub stderr: LineSource,
}

impl fmt::Debug for PluginStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginStreams").finish_non_exhaustive()
    }
}

/// Owns one plugin subprocess from start to close.
pub trait BinaryExecutor: Send {
    /// Driver the process serves.
    fn driver_name(&self) -> &str;

    /// Spawns the plugin and returns its output streams.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::StartFailed`] when a pipe cannot be set up or
    /// the process cannot be created, and [`PluginError::InvalidState`] when
    /// the executor was already started.
    fn start(&mut self) -> Result<PluginStreams, PluginError>;

    /// Closes both output pipes.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Close`] carrying the first failure after both
    /// pipes have been attempted.
    fn close(&mut self) -> Result<(), PluginError>;
}

enum ExecutorState {
    Idle,
    Running(Box<RunningProcess>),
    Closed,
}

impl ExecutorState {
    const fn describe(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running(_) => "running",
            Self::Closed => "closed",
        }
    }
}

struct RunningProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: PipeHandle,
    stderr: PipeHandle,
}

/// Executes a plugin binary from the local filesystem.
pub struct LocalBinaryExecutor {
    driver: String,
    binary: PathBuf,
    args: Vec<OsString>,
    kill_grace: Option<Duration>,
    state: ExecutorState,
}

impl fmt::Debug for LocalBinaryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBinaryExecutor")
            .field("driver", &self.driver)
            .field("binary", &self.binary)
            .field("args", &self.args)
            .field("kill_grace", &self.kill_grace)
            .field("state", &self.state.describe())
            .finish()
    }
}

impl LocalBinaryExecutor {
    /// Creates an executor for `binary` serving `driver`.
    #[must_use]
    pub fn new(driver: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            driver: driver.into(),
            binary: binary.into(),
            args: Vec::new(),
            kill_grace: None,
            state: ExecutorState::Idle,
        }
    }

    /// Appends command-line arguments passed to the plugin.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Kills the child if it is still running `grace` after its pipes close.
    #[must_use]
    pub const fn with_kill_grace(mut self, grace: Option<Duration>) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Path of the plugin binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Returns `true` while the child is running and its pipes are open.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, ExecutorState::Running(_))
    }

    fn spawn(&self) -> Result<(RunningProcess, PluginStreams), PluginError> {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .env(PLUGIN_ENV_KEY, PLUGIN_ENV_VALUE)
            .env(PLUGIN_ENV_DRIVER_NAME, &self.driver)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            target: PROCESS_TARGET,
            driver = %self.driver,
            binary = %self.binary.display(),
            "spawning plugin process"
        );

        let mut child = command
            .spawn()
            .map_err(|err| PluginError::start_failed(&self.driver, StartStage::Spawn, err))?;

        let Some(stdin) = child.stdin.take() else {
            return Err(self.abandon(child, StartStage::StdinPipe));
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(self.abandon(child, StartStage::StdoutPipe));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(self.abandon(child, StartStage::StderrPipe));
        };

        let (stdout_reader, stdout_handle) = pipe::closable("stdout", stdout);
        let (stderr_reader, stderr_handle) = pipe::closable("stderr", stderr);

        info!(
            target: PROCESS_TARGET,
            driver = %self.driver,
            pid = child.id(),
            "plugin process started"
        );

        Ok((
            RunningProcess {
                child,
                stdin: Some(stdin),
                stdout: stdout_handle,
                stderr: stderr_handle,
            },
            PluginStreams {
                stdout: Box::new(BufReader::new(stdout_reader)),
                stderr: Box::new(BufReader::new(stderr_reader)),
            },
        ))
    }

    /// Kills a child whose pipes could not be captured.
    fn abandon(&self, mut child: Child, stage: StartStage) -> PluginError {
        if let Err(err) = child.kill() {
            debug!(target: PROCESS_TARGET, driver = %self.driver, error = %err, "kill failed");
        }
        if let Err(err) = child.wait() {
            debug!(target: PROCESS_TARGET, driver = %self.driver, error = %err, "reap failed");
        }
        PluginError::start_failed(
            &self.driver,
            stage,
            io::Error::other(format!("child {stage} was not captured")),
        )
    }

    fn shutdown(&self, running: RunningProcess) -> Result<(), PluginError> {
        let RunningProcess {
            mut child,
            stdin,
            stdout,
            stderr,
        } = running;

        // Closing stdin tells a cooperative plugin to exit.
        drop(stdin);
        let closed = close_pipes(&self.driver, [&stdout, &stderr]);

        match self.kill_grace {
            Some(grace) => terminate_child(&mut child, &self.driver, grace),
            None => release_child(child, &self.driver),
        }
        closed
    }
}

/// Closes every pipe even after a failure and reports the first failure.
fn close_pipes(driver: &str, pipes: [&dyn ClosePipe; 2]) -> Result<(), PluginError> {
    let mut first_error = None;
    for pipe in pipes {
        let Err(err) = pipe.close() else {
            continue;
        };
        if first_error.is_none() {
            first_error = Some(err);
        } else {
            warn!(
                target: PROCESS_TARGET,
                driver,
                error = %err,
                "second pipe also failed to close"
            );
        }
    }
    first_error.map_or_else(
        || {
            debug!(target: PROCESS_TARGET, driver, "plugin pipes closed");
            Ok(())
        },
        |err| Err(PluginError::close(driver, err)),
    )
}

impl BinaryExecutor for LocalBinaryExecutor {
    fn driver_name(&self) -> &str {
        &self.driver
    }

    fn start(&mut self) -> Result<PluginStreams, PluginError> {
        if !matches!(self.state, ExecutorState::Idle) {
            return Err(PluginError::InvalidState {
                driver: self.driver.clone(),
                operation: "start",
                state: self.state.describe().to_owned(),
            });
        }
        let (running, streams) = self.spawn()?;
        self.state = ExecutorState::Running(Box::new(running));
        Ok(streams)
    }

    fn close(&mut self) -> Result<(), PluginError> {
        match mem::replace(&mut self.state, ExecutorState::Closed) {
            ExecutorState::Running(running) => self.shutdown(*running),
            ExecutorState::Closed => Ok(()),
            ExecutorState::Idle => {
                self.state = ExecutorState::Idle;
                Err(PluginError::InvalidState {
                    driver: self.driver.clone(),
                    operation: "close",
                    state: String::from("idle"),
                })
            }
        }
    }
}

impl Drop for LocalBinaryExecutor {
    fn drop(&mut self) {
        if !self.is_running() {
            return;
        }
        if let Err(err) = self.close() {
            warn!(
                target: PROCESS_TARGET,
                driver = %self.driver,
                error = %err,
                "failed to close plugin on drop"
            );
        }
    }
}

/// Reaps the child in the background so a cooperative exit leaves no zombie.
fn release_child(mut child: Child, driver: &str) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(target: PROCESS_TARGET, driver, ?status, "plugin exited");
        return;
    }
    let owned_driver = driver.to_owned();
    let spawned = thread::Builder::new()
        .name(format!("plugin-reaper-{driver}"))
        .spawn(move || match child.wait() {
            Ok(status) => {
                debug!(target: PROCESS_TARGET, driver = %owned_driver, ?status, "plugin exited");
            }
            Err(err) => {
                warn!(
                    target: PROCESS_TARGET,
                    driver = %owned_driver,
                    error = %err,
                    "failed to reap plugin process"
                );
            }
        });
    if let Err(err) = spawned {
        warn!(
            target: PROCESS_TARGET,
            driver,
            error = %err,
            "could not spawn reaper; plugin exit status will not be collected"
        );
    }
}

/// Waits up to `grace` for the child to exit on its own, then kills it.
fn terminate_child(child: &mut Child, driver: &str, grace: Duration) {
    const POLL: Duration = Duration::from_millis(20);

    let mut waited = Duration::ZERO;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: PROCESS_TARGET, driver, ?status, "plugin exited after pipe close");
                return;
            }
            Ok(None) if waited < grace => {
                thread::sleep(POLL);
                waited += POLL;
            }
            Ok(None) => break,
            Err(err) => {
                warn!(
                    target: PROCESS_TARGET,
                    driver,
                    error = %err,
                    "failed to check plugin status"
                );
                break;
            }
        }
    }

    warn!(
        target: PROCESS_TARGET,
        driver,
        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
        "plugin did not exit within grace period, killing"
    );
    if let Err(err) = child.kill() {
        debug!(target: PROCESS_TARGET, driver, error = %err, "kill failed");
    }
    if let Err(err) = child.wait() {
        debug!(target: PROCESS_TARGET, driver, error = %err, "reap failed");
    }
}
