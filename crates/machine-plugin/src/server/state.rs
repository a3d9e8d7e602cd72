//! Lifecycle states of a plugin session.

use std::fmt;

/// Where a [`Plugin`](super::Plugin) is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// `serve` has not been called.
    #[default]
    NotStarted,
    /// The executor is spawning the plugin process.
    Starting,
    /// Waiting for the address line on stdout.
    AwaitingAddress,
    /// Forwarding plugin output to the log sink.
    Streaming,
    /// Halting streams and closing pipes.
    Stopping,
    /// The session ended cleanly.
    Closed,
    /// The session ended with an error.
    Failed,
}

impl SessionState {
    /// Returns `true` for `Closed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::AwaitingAddress => "awaiting address",
            Self::Streaming => "streaming",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}
