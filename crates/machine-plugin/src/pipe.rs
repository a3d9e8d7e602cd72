//! Closable wrappers around child process pipes.
//!
//! A child's stdout and stderr are read on worker threads that own the pipe
//! readers, so the executor cannot drop them directly. Instead each reader is
//! paired with a [`PipeHandle`]; closing the handle makes the reader release
//! its descriptor and report end of stream on its next poll.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(unix)]
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

/// Upper bound on how long a blocked read waits before re-checking closure.
#[cfg(unix)]
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Pairs `inner` with a handle that can close it from another thread.
pub(crate) fn closable<R>(label: &'static str, inner: R) -> (PipeReader<R>, PipeHandle) {
    let closed = Arc::new(AtomicBool::new(false));
    (
        PipeReader {
            inner: Some(inner),
            closed: Arc::clone(&closed),
        },
        PipeHandle { label, closed },
    )
}

/// Reader half of a closable pipe.
#[derive(Debug)]
pub(crate) struct PipeReader<R> {
    inner: Option<R>,
    closed: Arc<AtomicBool>,
}

impl<R> PipeReader<R> {
    fn release_if_closed(&mut self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            self.inner = None;
        }
        self.inner.is_none()
    }
}

#[cfg(unix)]
impl<R: Read + AsRawFd> Read for PipeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.release_if_closed() {
                return Ok(0);
            }
            let Some(inner) = self.inner.as_mut() else {
                return Ok(0);
            };
            if wait_readable(inner.as_raw_fd(), POLL_SLICE)? {
                return inner.read(buf);
            }
        }
    }
}

#[cfg(not(unix))]
impl<R: Read> Read for PipeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.release_if_closed() {
            return Ok(0);
        }
        match self.inner.as_mut() {
            Some(inner) => inner.read(buf),
            None => Ok(0),
        }
    }
}

/// Waits up to `timeout` for `fd` to become readable or hang up.
#[cfg(unix)]
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `pollfd` is a single, exclusively borrowed entry that outlives
    // the call, and `fd` stays open because the reader still owns it.
    let ready = unsafe { libc::poll(&raw mut pollfd, 1, millis) };
    if ready < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(error);
    }
    Ok(ready > 0)
}

/// Controller half of a closable pipe.
#[derive(Debug, Clone)]
pub(crate) struct PipeHandle {
    label: &'static str,
    closed: Arc<AtomicBool>,
}

/// Something the executor closes at shutdown.
pub(crate) trait ClosePipe {
    /// Closes the pipe. Fails when it was already closed.
    fn close(&self) -> io::Result<()>;
}

impl ClosePipe for PipeHandle {
    /// Marks the pipe closed; the reader drops its descriptor on its next poll.
    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(io::Error::other(format!(
                "{} pipe already closed",
                self.label
            )));
        }
        Ok(())
    }
}
