//! Typed channels
//!
//! A channel with capacity 0 is synchronous: a send completes only when a
//! receiver takes the value. With capacity N a send completes once the
//! value is buffered. Handles are cloneable and any number of tasks may
//! send and receive through them.
//!
//! After `close`, receivers drain whatever is buffered and then see
//! [`ClosedChannelError`]; sends fail immediately and hand the value back.

mod chan;
mod error;

pub use error::{ClosedChannelError, DoubleCloseError, TryRecvError, TrySendError};

pub(crate) use chan::{Chan, RecvAttempt, SendAttempt, Slot, Waiter};

use crate::scheduler::{block_on, BlockReason};
use crate::sync::token::{current_waker, wake_all, Token};
use chan::Registration;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

impl ChannelId {
    pub(crate) fn new() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// Create a channel with room for `capacity` buffered values
pub fn channel<T>(capacity: usize) -> Channel<T> {
    Channel::new(capacity)
}

/// Handle to a typed channel
pub struct Channel<T> {
    chan: Arc<Chan<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Channel<T> {
    /// Create a channel; capacity 0 makes it synchronous
    pub fn new(capacity: usize) -> Self {
        Self {
            chan: Arc::new(Chan::new(capacity)),
        }
    }

    /// Channel identifier
    pub fn id(&self) -> ChannelId {
        self.chan.id
    }

    /// Buffer capacity
    pub fn capacity(&self) -> usize {
        self.chan.capacity
    }

    /// Number of buffered values
    pub fn len(&self) -> usize {
        self.chan.state.lock().buf.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.chan.state.lock().closed
    }

    pub(crate) fn chan(&self) -> &Chan<T> {
        &self.chan
    }

    /// Send without waiting
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let attempt = self.chan.state.lock().try_send(self.chan.capacity, value);
        match attempt {
            SendAttempt::Sent(token) => {
                wake_all(token);
                Ok(())
            }
            SendAttempt::Full(value) => Err(TrySendError::Full(value)),
            SendAttempt::Closed(value) => Err(TrySendError::Closed(value)),
        }
    }

    /// Receive without waiting
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let attempt = self.chan.state.lock().try_recv();
        match attempt {
            RecvAttempt::Received(value, token) => {
                wake_all(token);
                Ok(value)
            }
            RecvAttempt::Empty => Err(TryRecvError::Empty),
            RecvAttempt::Closed => Err(TryRecvError::Closed),
        }
    }

    /// Send, suspending until a receiver or buffer slot takes the value.
    ///
    /// Fails if the channel is closed before or while waiting; the value
    /// comes back in the error.
    pub async fn send(&self, value: T) -> Result<(), ClosedChannelError<T>> {
        let waker = current_waker().await;
        let (token, slot) = {
            let mut state = self.chan.state.lock();
            let attempt = state.try_send(self.chan.capacity, value);
            match attempt {
                SendAttempt::Sent(token) => {
                    drop(state);
                    wake_all(token);
                    return Ok(());
                }
                SendAttempt::Closed(value) => return Err(ClosedChannelError(value)),
                SendAttempt::Full(value) => {
                    let token = Token::new(&waker);
                    let slot: Slot<T> = Arc::new(parking_lot::Mutex::new(Some(value)));
                    state.senders.push_back(Waiter {
                        token: token.clone(),
                        case: 0,
                        slot: slot.clone(),
                    });
                    (token, slot)
                }
            }
        };

        let registration = Registration::new(&self.chan, &token);
        token.wait(BlockReason::Send(self.chan.id)).await;
        registration.disarm();

        let unsent = slot.lock().take();
        match unsent {
            None => Ok(()),
            Some(value) => Err(ClosedChannelError(value)),
        }
    }

    /// Receive, suspending until a value arrives.
    ///
    /// Fails once the channel is closed and drained.
    pub async fn recv(&self) -> Result<T, ClosedChannelError> {
        let waker = current_waker().await;
        let (token, slot) = {
            let mut state = self.chan.state.lock();
            let attempt = state.try_recv();
            match attempt {
                RecvAttempt::Received(value, token) => {
                    drop(state);
                    wake_all(token);
                    return Ok(value);
                }
                RecvAttempt::Closed => return Err(ClosedChannelError(())),
                RecvAttempt::Empty => {
                    let token = Token::new(&waker);
                    let slot: Slot<T> = Arc::new(parking_lot::Mutex::new(None));
                    state.receivers.push_back(Waiter {
                        token: token.clone(),
                        case: 0,
                        slot: slot.clone(),
                    });
                    (token, slot)
                }
            }
        };

        let registration = Registration::new(&self.chan, &token);
        token.wait(BlockReason::Recv(self.chan.id)).await;
        registration.disarm();

        let received = slot.lock().take();
        received.ok_or(ClosedChannelError(()))
    }

    /// `send` for OS threads outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics on a runtime worker thread.
    pub fn send_blocking(&self, value: T) -> Result<(), ClosedChannelError<T>> {
        block_on(self.send(value))
    }

    /// `recv` for OS threads outside the runtime.
    ///
    /// # Panics
    ///
    /// Panics on a runtime worker thread.
    pub fn recv_blocking(&self) -> Result<T, ClosedChannelError> {
        block_on(self.recv())
    }

    /// Close the channel, failing every blocked sender and waking every
    /// blocked receiver.
    pub fn close(&self) -> Result<(), DoubleCloseError> {
        let woken = {
            let mut state = self.chan.state.lock();
            if state.closed {
                return Err(DoubleCloseError(self.chan.id));
            }
            state.close()
        };
        tracing::trace!(channel = %self.chan.id, woken = woken.len(), "channel closed");
        wake_all(woken);
        Ok(())
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.chan.state.lock();
        f.debug_struct("Channel")
            .field("id", &self.chan.id)
            .field("capacity", &self.chan.capacity)
            .field("len", &state.buf.len())
            .field("closed", &state.closed)
            .field("blocked_senders", &state.senders.len())
            .field("blocked_receivers", &state.receivers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_fifo() {
        let ch = channel(3);
        for i in 0..3 {
            ch.try_send(i).unwrap();
        }
        assert_eq!(ch.try_send(9), Err(TrySendError::Full(9)));
        assert_eq!(ch.len(), 3);
        for i in 0..3 {
            assert_eq!(ch.try_recv(), Ok(i));
        }
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_unbuffered_try_send_needs_receiver() {
        let ch = channel::<u8>(0);
        assert_eq!(ch.try_send(1), Err(TrySendError::Full(1)));
        assert!(ch.is_empty());
    }

    #[test]
    fn test_close_drains_then_fails() {
        let ch = channel(2);
        ch.try_send("a").unwrap();
        ch.close().unwrap();
        assert!(ch.is_closed());

        assert_eq!(ch.try_send("b"), Err(TrySendError::Closed("b")));
        assert_eq!(ch.try_recv(), Ok("a"));
        assert_eq!(ch.try_recv(), Err(TryRecvError::Closed));
        assert!(ch.recv_blocking().is_err());
    }

    #[test]
    fn test_double_close() {
        let ch = channel::<()>(0);
        ch.close().unwrap();
        assert_eq!(ch.close(), Err(DoubleCloseError(ch.id())));
    }

    #[test]
    fn test_rendezvous_between_threads() {
        let ch = channel(0);
        let rx = ch.clone();
        let receiver = std::thread::spawn(move || {
            let mut got = Vec::new();
            while let Ok(v) = rx.recv_blocking() {
                got.push(v);
            }
            got
        });

        for i in 0..5 {
            ch.send_blocking(i).unwrap();
        }
        ch.close().unwrap();
        assert_eq!(receiver.join().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_close_fails_blocked_sender() {
        let ch = channel(0);
        let tx = ch.clone();
        let sender = std::thread::spawn(move || tx.send_blocking(42));

        while ch.chan().state.lock().senders.is_empty() {
            std::thread::yield_now();
        }
        ch.close().unwrap();

        let err = sender.join().unwrap().unwrap_err();
        assert_eq!(err.into_inner(), 42);
    }

    struct NoopWake;

    impl std::task::Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn poll_once<F: std::future::Future>(fut: std::pin::Pin<&mut F>) -> bool {
        let waker = std::task::Waker::from(Arc::new(NoopWake));
        let mut cx = std::task::Context::from_waker(&waker);
        std::future::Future::poll(fut, &mut cx).is_pending()
    }

    #[test]
    fn test_dropped_recv_withdraws_waiter() {
        let ch = channel::<u32>(0);
        let mut recv = Box::pin(ch.recv());
        assert!(poll_once(recv.as_mut()));
        assert_eq!(ch.chan().state.lock().receivers.len(), 1);

        drop(recv);
        assert!(ch.chan().state.lock().receivers.is_empty());
        // Nobody left to hand a value to
        assert_eq!(ch.try_send(1), Err(TrySendError::Full(1)));
    }

    #[test]
    fn test_dropped_send_withdraws_waiter() {
        let ch = channel::<String>(0);
        let mut send = Box::pin(ch.send("gone".to_string()));
        assert!(poll_once(send.as_mut()));
        assert_eq!(ch.chan().state.lock().senders.len(), 1);

        drop(send);
        assert!(ch.chan().state.lock().senders.is_empty());
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_dropped_send_on_full_buffer_withdraws_waiter() {
        let ch = channel(1);
        ch.try_send(1).unwrap();
        let mut send = Box::pin(ch.send(2));
        assert!(poll_once(send.as_mut()));

        drop(send);
        assert_eq!(ch.try_recv(), Ok(1));
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_channel_ids_unique() {
        let a = channel::<()>(0);
        let b = channel::<()>(0);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
