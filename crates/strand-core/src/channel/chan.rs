//! Channel state and the locked send/receive steps
//!
//! A blocked sender or receiver is a `Waiter`: a token plus a value slot.
//! A sender's slot starts holding its value; a receiver's starts empty.
//! Whoever fires the token does so while holding the slot lock and moves
//! the value in the same critical section, so an owner that sees its
//! token fired always finds the slot settled:
//!
//! - sender, slot empty: delivered
//! - sender, slot still full: channel closed
//! - receiver, slot full: received
//! - receiver, slot empty: channel closed
//!
//! Lock order is channel state, then slot.

use super::ChannelId;
use crate::sync::token::Token;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub(crate) type Slot<T> = Arc<Mutex<Option<T>>>;

pub(crate) struct Waiter<T> {
    pub(crate) token: Arc<Token>,
    /// Case index to fire the token with
    pub(crate) case: usize,
    pub(crate) slot: Slot<T>,
}

impl<T> Waiter<T> {
    /// A waiter that is not ours and not already claimed elsewhere
    fn is_live_for(&self, own: &Arc<Token>) -> bool {
        !Arc::ptr_eq(&self.token, own) && !self.token.is_fired()
    }
}

pub(crate) enum SendAttempt<T> {
    /// Delivered or buffered; wake the token, if any, after unlocking
    Sent(Option<Arc<Token>>),
    Full(T),
    Closed(T),
}

pub(crate) enum RecvAttempt<T> {
    /// Got a value; wake the token, if any, after unlocking
    Received(T, Option<Arc<Token>>),
    Empty,
    Closed,
}

pub(crate) struct ChanState<T> {
    pub(crate) buf: VecDeque<T>,
    pub(crate) closed: bool,
    /// Blocked senders, oldest first
    pub(crate) senders: VecDeque<Waiter<T>>,
    /// Blocked receivers, oldest first
    pub(crate) receivers: VecDeque<Waiter<T>>,
}

impl<T> ChanState<T> {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            closed: false,
            senders: VecDeque::new(),
            receivers: VecDeque::new(),
        }
    }

    /// Hand `value` to the oldest receiver, or buffer it
    pub(crate) fn try_send(&mut self, capacity: usize, value: T) -> SendAttempt<T> {
        if self.closed {
            return SendAttempt::Closed(value);
        }

        while let Some(receiver) = self.receivers.pop_front() {
            let mut slot = receiver.slot.lock();
            if receiver.token.try_fire(receiver.case) {
                *slot = Some(value);
                drop(slot);
                return SendAttempt::Sent(Some(receiver.token));
            }
            // Stale: its select already completed elsewhere
        }

        if self.buf.len() < capacity {
            self.buf.push_back(value);
            return SendAttempt::Sent(None);
        }
        SendAttempt::Full(value)
    }

    /// Take the oldest buffered value, or one straight from a blocked sender
    pub(crate) fn try_recv(&mut self) -> RecvAttempt<T> {
        if let Some(value) = self.buf.pop_front() {
            // A slot opened up: move the oldest blocked sender's value in
            let woken = self.take_from_sender().map(|(v, token)| {
                self.buf.push_back(v);
                token
            });
            return RecvAttempt::Received(value, woken);
        }

        if let Some((value, token)) = self.take_from_sender() {
            return RecvAttempt::Received(value, Some(token));
        }

        if self.closed {
            RecvAttempt::Closed
        } else {
            RecvAttempt::Empty
        }
    }

    fn take_from_sender(&mut self) -> Option<(T, Arc<Token>)> {
        while let Some(sender) = self.senders.pop_front() {
            let mut slot = sender.slot.lock();
            if sender.token.try_fire(sender.case) {
                if let Some(value) = slot.take() {
                    drop(slot);
                    return Some((value, sender.token));
                }
                // Fired with an empty slot: sender lost its value, skip it
                drop(slot);
                continue;
            }
        }
        None
    }

    /// Whether a send would complete now, ignoring waiters holding `own`
    pub(crate) fn can_send(&self, capacity: usize, own: &Arc<Token>) -> bool {
        self.closed
            || self.buf.len() < capacity
            || self.receivers.iter().any(|w| w.is_live_for(own))
    }

    /// Whether a receive would complete now, ignoring waiters holding `own`
    pub(crate) fn can_recv(&self, own: &Arc<Token>) -> bool {
        !self.buf.is_empty() || self.closed || self.senders.iter().any(|w| w.is_live_for(own))
    }

    /// Drop every queue entry holding `token`
    pub(crate) fn remove_token(&mut self, token: &Arc<Token>) {
        self.senders.retain(|w| !Arc::ptr_eq(&w.token, token));
        self.receivers.retain(|w| !Arc::ptr_eq(&w.token, token));
    }

    /// Mark closed and fire every waiter. Senders keep their value in the
    /// slot, receivers get nothing. Returns tokens to wake.
    pub(crate) fn close(&mut self) -> Vec<Arc<Token>> {
        self.closed = true;
        let mut woken = Vec::new();
        for waiter in self.senders.drain(..).chain(self.receivers.drain(..)) {
            let _slot = waiter.slot.lock();
            if waiter.token.try_fire(waiter.case) {
                woken.push(waiter.token.clone());
            }
        }
        woken
    }
}

/// Shared channel object behind every `Channel` handle
pub(crate) struct Chan<T> {
    pub(crate) id: ChannelId,
    pub(crate) capacity: usize,
    pub(crate) state: Mutex<ChanState<T>>,
}

impl<T> Chan<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            id: ChannelId::new(),
            capacity,
            state: Mutex::new(ChanState::new(capacity)),
        }
    }
}

/// Removes a pending registration when its future is dropped
pub(crate) struct Registration<'a, T> {
    chan: &'a Chan<T>,
    token: &'a Arc<Token>,
    armed: bool,
}

impl<'a, T> Registration<'a, T> {
    pub(crate) fn new(chan: &'a Chan<T>, token: &'a Arc<Token>) -> Self {
        Self {
            chan,
            token,
            armed: true,
        }
    }

    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.chan.state.lock().remove_token(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Wake, Waker};

    struct Noop;

    impl Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }

    fn token() -> Arc<Token> {
        Token::new(&Waker::from(Arc::new(Noop)))
    }

    fn waiter<T>(value: Option<T>) -> Waiter<T> {
        Waiter {
            token: token(),
            case: 0,
            slot: Arc::new(Mutex::new(value)),
        }
    }

    #[test]
    fn test_buffer_respects_capacity() {
        let mut st = ChanState::new(2);
        assert!(matches!(st.try_send(2, 1), SendAttempt::Sent(None)));
        assert!(matches!(st.try_send(2, 2), SendAttempt::Sent(None)));
        assert!(matches!(st.try_send(2, 3), SendAttempt::Full(3)));
        assert_eq!(st.buf.len(), 2);
    }

    #[test]
    fn test_send_skips_stale_receiver() {
        let mut st = ChanState::new(0);
        let stale = waiter::<u32>(None);
        assert!(stale.token.try_fire(5));
        let live = waiter::<u32>(None);
        let live_slot = live.slot.clone();
        st.receivers.push_back(stale);
        st.receivers.push_back(live);

        assert!(matches!(st.try_send(0, 9), SendAttempt::Sent(Some(_))));
        assert_eq!(*live_slot.lock(), Some(9));
        assert!(st.receivers.is_empty());
    }

    #[test]
    fn test_recv_refills_from_blocked_sender() {
        let mut st = ChanState::new(1);
        st.buf.push_back(1);
        let sender = waiter(Some(2));
        let slot = sender.slot.clone();
        st.senders.push_back(sender);

        match st.try_recv() {
            RecvAttempt::Received(v, Some(_)) => assert_eq!(v, 1),
            _ => panic!("expected buffered value"),
        }
        assert_eq!(slot.lock().take(), None);
        assert_eq!(st.buf.front(), Some(&2));
    }

    #[test]
    fn test_close_fires_waiters() {
        let mut st = ChanState::new(0);
        let sender = waiter(Some(7));
        let sender_slot = sender.slot.clone();
        st.senders.push_back(sender);
        st.receivers.push_back(waiter::<i32>(None));

        let woken = st.close();
        assert_eq!(woken.len(), 2);
        assert!(st.closed);
        // Sender keeps its value: the send failed
        assert_eq!(*sender_slot.lock(), Some(7));
        assert!(matches!(st.try_recv(), RecvAttempt::Closed));
    }

    #[test]
    fn test_readiness_ignores_own_token() {
        let mut st = ChanState::<u8>::new(0);
        let own = token();
        st.receivers.push_back(Waiter {
            token: own.clone(),
            case: 1,
            slot: Arc::new(Mutex::new(None)),
        });
        assert!(!st.can_send(0, &own));
        assert!(st.can_send(0, &token()));

        st.remove_token(&own);
        assert!(st.receivers.is_empty());
    }
}
