//! Channel errors

use super::ChannelId;
use std::fmt;

/// The channel was closed
///
/// For sends, the unsent value is handed back.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation on closed channel")]
pub struct ClosedChannelError<T = ()>(pub T);

impl<T> ClosedChannelError<T> {
    /// Recover the value that could not be sent
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for ClosedChannelError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClosedChannelError(..)")
    }
}

/// `close` called on an already closed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("close of closed channel {0}")]
pub struct DoubleCloseError(pub ChannelId);

/// Why `try_send` did not send
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    /// No receiver waiting and no buffer room
    #[error("channel full")]
    Full(T),

    /// The channel is closed
    #[error("send on closed channel")]
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Recover the value that was not sent
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(v) | TrySendError::Closed(v) => v,
        }
    }

    /// Whether the failure was a closed channel
    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Why `try_recv` got nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// Nothing buffered and no sender waiting
    #[error("channel empty")]
    Empty,

    /// Closed and drained
    #[error("receive on closed channel")]
    Closed,
}

impl From<ClosedChannelError> for TryRecvError {
    fn from(_: ClosedChannelError) -> Self {
        TryRecvError::Closed
    }
}
