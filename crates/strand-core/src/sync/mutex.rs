//! Task-aware Mutex implementation

use super::guard::MutexGuard;
use super::token::{current_waker, Token};
use super::{LockId, NotOwnerError, Owner};
use crate::scheduler::BlockReason;
use parking_lot::Mutex as ParkingLotMutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

struct LockState {
    locked: bool,

    /// Holder; None when unlocked
    owner: Option<Owner>,

    /// FIFO wait queue of blocked tasks
    waiters: VecDeque<Arc<Token>>,
}

/// Task-aware mutual exclusion lock
///
/// Blocking on `lock` suspends the task, not the worker thread. Unlock
/// hands the lock straight to the longest waiter, so a task releasing and
/// re-locking in a loop cannot starve the queue.
pub struct Mutex<T: ?Sized> {
    /// Unique lock ID
    id: LockId,

    state: ParkingLotMutex<LockState>,

    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a new unlocked mutex
    pub fn new(value: T) -> Self {
        Self {
            id: LockId::new(),
            state: ParkingLotMutex::new(LockState {
                locked: false,
                owner: None,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the mutex, returning the protected value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Get the lock ID
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Lock, suspending the task until the lock is granted
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.acquire().await;
        MutexGuard::new(self, Owner::current())
    }

    /// Lock only if free and nobody is queued
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.try_acquire() {
            Some(MutexGuard::new(self, Owner::current()))
        } else {
            None
        }
    }

    /// Block the calling OS thread until the lock is granted.
    ///
    /// # Panics
    ///
    /// Panics on a runtime worker thread.
    pub fn lock_blocking(&self) -> MutexGuard<'_, T> {
        crate::scheduler::block_on(self.lock())
    }

    /// Mutable access without locking; the borrow proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquire without a guard. Pair with [`Mutex::release`].
    pub async fn acquire(&self) {
        let waker = current_waker().await;
        let token = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                state.owner = Some(Owner::current());
                return;
            }
            let token = Token::new(&waker);
            state.waiters.push_back(token.clone());
            token
        };

        let mut pending = PendingAcquire {
            mutex: self,
            token: &token,
            armed: true,
        };
        token.wait(BlockReason::Lock(self.id)).await;
        pending.armed = false;
        tracing::trace!(lock = %self.id, owner = %token.owner(), "lock handed off");
    }

    /// Acquire only if free and nobody is queued
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            return false;
        }
        state.locked = true;
        state.owner = Some(Owner::current());
        true
    }

    /// Release a lock taken with [`Mutex::acquire`].
    ///
    /// Fails with [`NotOwnerError`] if the mutex is unlocked or held by
    /// another task or thread.
    pub fn release(&self) -> Result<(), NotOwnerError> {
        self.release_as(Owner::current())
    }

    pub(crate) fn release_as(&self, caller: Owner) -> Result<(), NotOwnerError> {
        let next = {
            let mut state = self.state.lock();
            if !state.locked || state.owner != Some(caller) {
                return Err(NotOwnerError {
                    lock: self.id,
                    caller,
                });
            }
            Self::hand_off(&mut state)
        };
        if let Some(token) = next {
            token.wake();
        }
        Ok(())
    }

    /// Grant the lock to the head waiter, or mark it free
    fn hand_off(state: &mut LockState) -> Option<Arc<Token>> {
        while let Some(token) = state.waiters.pop_front() {
            if token.try_fire(0) {
                state.owner = Some(token.owner());
                return Some(token);
            }
        }
        state.locked = false;
        state.owner = None;
        None
    }

    /// Whether the mutex is held
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Current holder
    pub fn owner(&self) -> Option<Owner> {
        self.state.lock().owner
    }

    /// Number of tasks queued for the lock
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("id", &self.id)
            .field("locked", &state.locked)
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Withdraws a queued acquire whose future was dropped
struct PendingAcquire<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    token: &'a Arc<Token>,
    armed: bool,
}

impl<T: ?Sized> Drop for PendingAcquire<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let next = {
            let mut state = self.mutex.state.lock();
            if self.token.is_fired() {
                // Granted after we stopped waiting; pass it on
                Mutex::<T>::hand_off(&mut state)
            } else {
                state.waiters.retain(|t| !Arc::ptr_eq(t, self.token));
                None
            }
        };
        if let Some(token) = next {
            token.wake();
        }
    }
}
