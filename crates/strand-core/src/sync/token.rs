//! Wait tokens
//!
//! A token is what a blocked task leaves in a wait queue. Whoever completes
//! the wait first claims the token with a single CAS, recording which case
//! fired. Every other party that later finds the token treats it as stale.
//! A select registers one token on several queues; the CAS is what makes
//! exactly one of them win.
//!
//! Peers fire tokens while holding the queue's lock, then call `wake` after
//! releasing it.

use super::Owner;
use crate::scheduler::{record_block, BlockReason};
use parking_lot::Mutex;
use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Poll, Waker};

const WAITING: usize = usize::MAX;

/// Case index recorded when the owner withdraws its own token
pub(crate) const ABORTED: usize = usize::MAX - 1;

pub(crate) struct Token {
    selected: AtomicUsize,
    waker: Mutex<Option<Waker>>,
    /// Task or thread that owns this wait
    owner: Owner,
}

impl Token {
    pub(crate) fn new(waker: &Waker) -> Arc<Self> {
        Arc::new(Self {
            selected: AtomicUsize::new(WAITING),
            waker: Mutex::new(Some(waker.clone())),
            owner: Owner::current(),
        })
    }

    /// Claim the token for `case`. Only the first claim succeeds.
    pub(crate) fn try_fire(&self, case: usize) -> bool {
        self.selected
            .compare_exchange(WAITING, case, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.selected.load(Ordering::Acquire) != WAITING
    }

    /// The winning case, once fired
    pub(crate) fn selected(&self) -> Option<usize> {
        match self.selected.load(Ordering::Acquire) {
            WAITING => None,
            case => Some(case),
        }
    }

    pub(crate) fn owner(&self) -> Owner {
        self.owner
    }

    /// Wake the owner. Call with no queue lock held.
    pub(crate) fn wake(&self) {
        let waker = self.waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wait until fired; resolves to the winning case
    pub(crate) fn wait(&self, reason: BlockReason) -> impl Future<Output = usize> + '_ {
        poll_fn(move |cx| {
            // Store the waker before checking, so a fire in between still wakes us
            {
                let mut slot = self.waker.lock();
                match slot.as_ref() {
                    Some(w) if w.will_wake(cx.waker()) => {}
                    _ => *slot = Some(cx.waker().clone()),
                }
            }
            match self.selected() {
                Some(case) => Poll::Ready(case),
                None => {
                    record_block(reason.clone());
                    Poll::Pending
                }
            }
        })
    }
}

/// Waker of the task awaiting this future
pub(crate) async fn current_waker() -> Waker {
    poll_fn(|cx| Poll::Ready(cx.waker().clone())).await
}

/// Wake every token in `tokens`
pub(crate) fn wake_all(tokens: impl IntoIterator<Item = Arc<Token>>) {
    for token in tokens {
        token.wake();
    }
}
