//! Idempotent broadcast stop signal.
//!
//! A [`ShutdownToken`] can be cancelled any number of times from any thread
//! without blocking. Waiters observe cancellation either by polling
//! [`ShutdownToken::is_cancelled`] or by selecting on
//! [`ShutdownToken::signal`], a channel that disconnects once the token is
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Clonable cancellation token shared between a controller and its workers.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl ShutdownToken {
    /// Creates a token in the running state.
    #[must_use]
    pub fn new() -> Self {
        let (trigger, signal) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                signal,
            }),
        }
    }

    /// Cancels the token.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        // Dropping the only sender disconnects every receiver at once.
        drop(
            self.inner
                .trigger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        first
    }

    /// Reports whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Channel that never carries a value and disconnects on cancellation.
    ///
    /// Suitable for `crossbeam_channel::select!` arms.
    #[must_use]
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }

    /// Blocks until the token is cancelled or `timeout` elapses.
    ///
    /// Returns `true` when the token was cancelled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        matches!(
            self.inner.signal.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
