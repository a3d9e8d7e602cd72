//! Push-based line streaming from a blocking source.
//!
//! A [`LineStream`] owns a worker thread that pulls lines from a plugin pipe
//! and republishes them, trimmed of line terminators, on an unbounded
//! channel. The dispatch loop selects over those channels so a silent stream
//! never blocks it.

use std::io::{self, BufRead};
use std::mem;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::cancel::ShutdownToken;
use crate::error::PluginError;
use crate::process::LineSource;
use crate::protocol::trim_line_terminators;

/// Tracing target for stream workers.
pub(crate) const STREAM_TARGET: &str = "machine_plugin::stream";

/// Consecutive read failures after which a stream gives up.
pub const MAX_CONSECUTIVE_READ_ERRORS: usize = 16;

/// A line source drained by a dedicated worker thread.
#[derive(Debug)]
pub struct LineStream {
    label: &'static str,
    lines: Receiver<String>,
    stop: ShutdownToken,
    done: Receiver<()>,
}

impl LineStream {
    /// Starts a worker that streams lines from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::SpawnWorker`] when the worker thread cannot be
    /// created.
    pub fn attach(
        driver: &str,
        label: &'static str,
        source: LineSource,
    ) -> Result<Self, PluginError> {
        let (line_tx, lines) = crossbeam_channel::unbounded();
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let stop = ShutdownToken::new();
        let worker = Worker {
            driver: driver.to_owned(),
            label,
            source,
            lines: line_tx,
            stop: stop.clone(),
            _done: done_tx,
        };
        thread::Builder::new()
            .name(format!("plugin-{label}-{driver}"))
            .spawn(move || worker.run())
            .map_err(|err| PluginError::spawn_worker(driver, label, err))?;
        Ok(Self {
            label,
            lines,
            stop,
            done,
        })
    }

    /// Stream label, `stdout` or `stderr`.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        self.label
    }

    /// Channel of trimmed lines. Disconnects when the stream ends or stops.
    #[must_use]
    pub const fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    /// Asks the worker to stop pulling lines. Never blocks.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stops the worker and waits up to `timeout` for it to acknowledge.
    ///
    /// Returns `true` when the worker has exited.
    #[must_use]
    pub fn join(mut self, timeout: Duration) -> bool {
        self.stop();
        // Later sends fail once the receiver is gone.
        drop(mem::replace(&mut self.lines, crossbeam_channel::never()));
        matches!(
            self.done.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Worker {
    driver: String,
    label: &'static str,
    source: LineSource,
    lines: Sender<String>,
    stop: ShutdownToken,
    // Disconnects when the worker returns, acknowledging shutdown.
    _done: Sender<()>,
}

impl Worker {
    fn run(mut self) {
        let mut buffer = Vec::new();
        let mut consecutive_errors = 0_usize;
        while !self.stop.is_cancelled() {
            buffer.clear();
            // Bytes, not `read_line`: plugin output is not guaranteed UTF-8.
            match self.source.read_until(b'\n', &mut buffer) {
                Ok(0) => {
                    debug!(
                        target: STREAM_TARGET,
                        driver = %self.driver,
                        stream = self.label,
                        "plugin stream reached end of file"
                    );
                    break;
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    if self.stop.is_cancelled() {
                        break;
                    }
                    let text = String::from_utf8_lossy(&buffer);
                    let line = trim_line_terminators(&text).to_owned();
                    if self.lines.send(line).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    consecutive_errors += 1;
                    if !self.absorb_read_error(&err, consecutive_errors) {
                        break;
                    }
                }
            }
        }
        debug!(
            target: STREAM_TARGET,
            driver = %self.driver,
            stream = self.label,
            "plugin stream worker exiting"
        );
    }

    /// Logs a read failure. Returns `false` once the stream should give up.
    fn absorb_read_error(&self, err: &io::Error, consecutive: usize) -> bool {
        if consecutive >= MAX_CONSECUTIVE_READ_ERRORS {
            warn!(
                target: STREAM_TARGET,
                driver = %self.driver,
                stream = self.label,
                error = %err,
                consecutive,
                "abandoning plugin stream after repeated read errors"
            );
            return false;
        }
        warn!(
            target: STREAM_TARGET,
            driver = %self.driver,
            stream = self.label,
            error = %err,
            "error reading plugin stream"
        );
        true
    }
}
