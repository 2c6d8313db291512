//! Multi-way select over channel operations
//!
//! ```ignore
//! let value = Select::new()
//!     .recv(&numbers, |r| r.ok())
//!     .recv(&timeout, |_| None)
//!     .wait()
//!     .await;
//! ```
//!
//! Exactly one case runs. When several are ready at once the winner is
//! chosen uniformly at random; with none ready, the default case runs if
//! present, otherwise the task blocks on every channel at once. A single
//! wait token is registered with each channel and the first peer to claim
//! it decides the winner, so a blocked select can never complete twice.
//! Handlers run after all channel locks are released.

use crate::channel::{
    Chan, Channel, ChannelId, ClosedChannelError, RecvAttempt, SendAttempt, Slot, Waiter,
};
use crate::scheduler::{with_rng, BlockReason};
use crate::sync::token::{current_waker, wake_all, Token, ABORTED};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

/// Outcome of trying to register a case
enum Registered {
    /// Queued on the channel
    Waiting,
    /// The operation can complete right now
    Ready,
}

/// One arm of a select
trait Case<R> {
    fn channel(&self) -> ChannelId;

    /// Complete the operation now if it is ready
    fn try_now(&mut self) -> bool;

    /// Queue on the channel with `token`, firing as `index`
    fn register(&mut self, token: &Arc<Token>, index: usize) -> Registered;

    /// Leave the channel's queue, reclaiming any unsent value
    fn unregister(&mut self, token: &Arc<Token>);

    /// Read the outcome a peer left in our slot
    fn take_fired(&mut self);

    /// Run the handler on the stored outcome
    fn finish(self: Box<Self>) -> R;
}

struct RecvCase<'a, T, F> {
    chan: &'a Chan<T>,
    handler: F,
    slot: Option<Slot<T>>,
    outcome: Option<Result<T, ClosedChannelError>>,
}

impl<'a, T, F, R> Case<R> for RecvCase<'a, T, F>
where
    F: FnOnce(Result<T, ClosedChannelError>) -> R,
{
    fn channel(&self) -> ChannelId {
        self.chan.id
    }

    fn try_now(&mut self) -> bool {
        let attempt = self.chan.state.lock().try_recv();
        match attempt {
            RecvAttempt::Received(value, token) => {
                wake_all(token);
                self.outcome = Some(Ok(value));
                true
            }
            RecvAttempt::Closed => {
                self.outcome = Some(Err(ClosedChannelError(())));
                true
            }
            RecvAttempt::Empty => false,
        }
    }

    fn register(&mut self, token: &Arc<Token>, index: usize) -> Registered {
        let mut state = self.chan.state.lock();
        if state.can_recv(token) {
            return Registered::Ready;
        }
        let slot: Slot<T> = Arc::new(parking_lot::Mutex::new(None));
        state.receivers.push_back(Waiter {
            token: token.clone(),
            case: index,
            slot: slot.clone(),
        });
        self.slot = Some(slot);
        Registered::Waiting
    }

    fn unregister(&mut self, token: &Arc<Token>) {
        self.chan.state.lock().remove_token(token);
        self.slot = None;
    }

    fn take_fired(&mut self) {
        let received = self.slot.take().and_then(|slot| slot.lock().take());
        self.outcome = Some(received.ok_or(ClosedChannelError(())));
    }

    fn finish(self: Box<Self>) -> R {
        let outcome = self.outcome.unwrap_or(Err(ClosedChannelError(())));
        (self.handler)(outcome)
    }
}

struct SendCase<'a, T, F> {
    chan: &'a Chan<T>,
    value: Option<T>,
    handler: F,
    slot: Option<Slot<T>>,
    outcome: Option<Result<(), ClosedChannelError<T>>>,
}

impl<'a, T, F, R> Case<R> for SendCase<'a, T, F>
where
    F: FnOnce(Result<(), ClosedChannelError<T>>) -> R,
{
    fn channel(&self) -> ChannelId {
        self.chan.id
    }

    fn try_now(&mut self) -> bool {
        let Some(value) = self.value.take() else {
            return false;
        };
        let attempt = self.chan.state.lock().try_send(self.chan.capacity, value);
        match attempt {
            SendAttempt::Sent(token) => {
                wake_all(token);
                self.outcome = Some(Ok(()));
                true
            }
            SendAttempt::Closed(value) => {
                self.outcome = Some(Err(ClosedChannelError(value)));
                true
            }
            SendAttempt::Full(value) => {
                self.value = Some(value);
                false
            }
        }
    }

    fn register(&mut self, token: &Arc<Token>, index: usize) -> Registered {
        let mut state = self.chan.state.lock();
        if state.can_send(self.chan.capacity, token) {
            return Registered::Ready;
        }
        let slot: Slot<T> = Arc::new(parking_lot::Mutex::new(self.value.take()));
        state.senders.push_back(Waiter {
            token: token.clone(),
            case: index,
            slot: slot.clone(),
        });
        self.slot = Some(slot);
        Registered::Waiting
    }

    fn unregister(&mut self, token: &Arc<Token>) {
        self.chan.state.lock().remove_token(token);
        if let Some(slot) = self.slot.take() {
            if let Some(value) = slot.lock().take() {
                self.value = Some(value);
            }
        }
    }

    fn take_fired(&mut self) {
        let unsent = self.slot.take().and_then(|slot| slot.lock().take());
        self.outcome = Some(match unsent {
            None => Ok(()),
            Some(value) => Err(ClosedChannelError(value)),
        });
    }

    fn finish(self: Box<Self>) -> R {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None => match self.value {
                Some(value) => Err(ClosedChannelError(value)),
                None => Ok(()),
            },
        };
        (self.handler)(outcome)
    }
}

type DefaultCase<'a, R> = Box<dyn FnOnce() -> R + Send + 'a>;

/// Builder for a multi-way channel select
pub struct Select<'a, R> {
    cases: Vec<Box<dyn Case<R> + Send + 'a>>,
    default: Option<DefaultCase<'a, R>>,
    seed: Option<u64>,
}

impl<'a, R> Default for Select<'a, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, R> Select<'a, R> {
    /// Empty select
    pub fn new() -> Self {
        Self {
            cases: Vec::new(),
            default: None,
            seed: None,
        }
    }

    /// Receive case; the handler gets the value or the close
    pub fn recv<T, F>(mut self, channel: &'a Channel<T>, handler: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Result<T, ClosedChannelError>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(RecvCase {
            chan: channel.chan(),
            handler,
            slot: None,
            outcome: None,
        }));
        self
    }

    /// Send case; on close the handler gets the value back
    pub fn send<T, F>(mut self, channel: &'a Channel<T>, value: T, handler: F) -> Self
    where
        T: Send + 'a,
        F: FnOnce(Result<(), ClosedChannelError<T>>) -> R + Send + 'a,
    {
        self.cases.push(Box::new(SendCase {
            chan: channel.chan(),
            value: Some(value),
            handler,
            slot: None,
            outcome: None,
        }));
        self
    }

    /// Case run when nothing else is ready
    pub fn default_case<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() -> R + Send + 'a,
    {
        self.default = Some(Box::new(handler));
        self
    }

    /// Choose among ready cases with a private RNG seeded by `seed`
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of channel cases
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether there are no channel cases
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Run the select.
    ///
    /// With no cases and no default this never completes.
    pub async fn wait(mut self) -> R {
        let mut rng = self.seed.map(StdRng::seed_from_u64);

        loop {
            // Probing in a random order makes every ready case equally likely
            let mut order: Vec<usize> = (0..self.cases.len()).collect();
            match rng.as_mut() {
                Some(rng) => order.shuffle(rng),
                None => with_rng(|rng| order.shuffle(rng)),
            }
            for &index in &order {
                if self.cases[index].try_now() {
                    return self.finish(index);
                }
            }

            if let Some(default) = self.default.take() {
                return default();
            }
            if self.cases.is_empty() {
                return std::future::pending().await;
            }

            let waker = current_waker().await;
            let token = Token::new(&waker);
            let mut registered = 0;
            let mut ready = false;
            for (index, case) in self.cases.iter_mut().enumerate() {
                if token.is_fired() {
                    break;
                }
                match case.register(&token, index) {
                    Registered::Waiting => registered = index + 1,
                    Registered::Ready => {
                        ready = true;
                        break;
                    }
                }
            }

            if (ready || registered < self.cases.len()) && token.try_fire(ABORTED) {
                // A case became ready while registering: withdraw and retry
                for case in &mut self.cases[..registered] {
                    case.unregister(&token);
                }
                continue;
            }

            let channels = self.cases.iter().map(|c| c.channel()).collect();
            let fired = {
                let mut pending = PendingSelect {
                    cases: &mut self.cases[..registered],
                    token: &token,
                    armed: true,
                };
                let fired = token.wait(BlockReason::Select(channels)).await;
                pending.armed = false;
                fired
            };

            for (index, case) in self.cases[..registered].iter_mut().enumerate() {
                if index != fired {
                    case.unregister(&token);
                }
            }
            self.cases[fired].take_fired();
            return self.finish(fired);
        }
    }

    fn finish(mut self, index: usize) -> R {
        let case = self.cases.swap_remove(index);
        case.finish()
    }
}

/// Withdraws every registration when a blocked select is dropped
struct PendingSelect<'s, 'a, R> {
    cases: &'s mut [Box<dyn Case<R> + Send + 'a>],
    token: &'s Arc<Token>,
    armed: bool,
}

impl<R> Drop for PendingSelect<'_, '_, R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.token.try_fire(ABORTED);
        for case in self.cases.iter_mut() {
            case.unregister(self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel;
    use crate::scheduler::block_on;

    #[test]
    fn test_default_when_nothing_ready() {
        let ch = channel::<u32>(0);
        let got = block_on(
            Select::new()
                .recv(&ch, |r| r.ok())
                .default_case(|| Some(0))
                .wait(),
        );
        assert_eq!(got, Some(0));
        // No registration left behind
        assert!(ch.chan().state.lock().receivers.is_empty());
    }

    #[test]
    fn test_ready_case_beats_default() {
        let ch = channel(1);
        ch.try_send(5).unwrap();
        let got = block_on(
            Select::new()
                .recv(&ch, |r| r.unwrap())
                .default_case(|| 0)
                .wait(),
        );
        assert_eq!(got, 5);
    }

    #[test]
    fn test_closed_channel_is_ready() {
        let ch = channel::<u8>(0);
        ch.close().unwrap();
        let closed = block_on(Select::new().recv(&ch, |r| r.is_err()).wait());
        assert!(closed);
    }

    #[test]
    fn test_send_case_reports_value_on_close() {
        let ch = channel::<&str>(0);
        ch.close().unwrap();
        let back = block_on(
            Select::new()
                .send(&ch, "v", |r| r.unwrap_err().into_inner())
                .wait(),
        );
        assert_eq!(back, "v");
    }

    #[test]
    fn test_blocked_select_wakes_on_send() {
        let a = channel::<u32>(0);
        let b = channel::<u32>(0);
        let tx = b.clone();

        let sender = std::thread::spawn(move || tx.send_blocking(9));

        let got = block_on(
            Select::new()
                .recv(&a, |r| ("a", r.ok()))
                .recv(&b, |r| ("b", r.ok()))
                .wait(),
        );
        assert_eq!(got, ("b", Some(9)));
        sender.join().unwrap().unwrap();

        // The losing registration was withdrawn
        assert!(a.chan().state.lock().receivers.is_empty());
    }

    #[test]
    fn test_seeded_choice_is_reproducible() {
        let pick = |seed| {
            let a = channel(1);
            let b = channel(1);
            a.try_send(1).unwrap();
            b.try_send(2).unwrap();
            block_on(
                Select::new()
                    .recv(&a, |r| r.unwrap())
                    .recv(&b, |r| r.unwrap())
                    .with_seed(seed)
                    .wait(),
            )
        };
        for seed in 0..8 {
            assert_eq!(pick(seed), pick(seed));
        }
    }
}
