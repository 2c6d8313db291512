//! Task-aware reader/writer lock
//!
//! Writer-preferring: once a writer is queued, new readers queue behind it
//! instead of joining the readers already inside.

use super::guard::{RwMutexReadGuard, RwMutexWriteGuard};
use super::token::{current_waker, wake_all, Token};
use super::{LockId, NotOwnerError, Owner};
use crate::scheduler::BlockReason;
use parking_lot::Mutex as ParkingLotMutex;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

struct RwWaiter {
    token: Arc<Token>,
    exclusive: bool,
}

struct RwState {
    write_locked: bool,
    /// Writer while write-locked
    writer: Option<Owner>,
    readers: usize,
    /// FIFO queue of blocked readers and writers
    waiters: VecDeque<RwWaiter>,
}

impl RwState {
    /// Grant the lock to queued waiters, front first: one writer, or
    /// every reader up to the next queued writer.
    fn grant(&mut self) -> Vec<Arc<Token>> {
        let mut granted = Vec::new();
        if self.write_locked {
            return granted;
        }
        while let Some(front) = self.waiters.front() {
            if front.exclusive {
                if self.readers > 0 {
                    break;
                }
                let Some(waiter) = self.waiters.pop_front() else {
                    break;
                };
                if waiter.token.try_fire(0) {
                    self.write_locked = true;
                    self.writer = Some(waiter.token.owner());
                    granted.push(waiter.token);
                    break;
                }
            } else {
                let Some(waiter) = self.waiters.pop_front() else {
                    break;
                };
                if waiter.token.try_fire(0) {
                    self.readers += 1;
                    granted.push(waiter.token);
                }
            }
        }
        granted
    }

    fn remove(&mut self, token: &Arc<Token>) {
        self.waiters.retain(|w| !Arc::ptr_eq(&w.token, token));
    }
}

/// Task-aware reader/writer lock
pub struct RwMutex<T: ?Sized> {
    id: LockId,
    state: ParkingLotMutex<RwState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwMutex<T> {}

impl<T> RwMutex<T> {
    /// Create a new unlocked RwMutex
    pub fn new(value: T) -> Self {
        Self {
            id: LockId::new(),
            state: ParkingLotMutex::new(RwState {
                write_locked: false,
                writer: None,
                readers: 0,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the lock, returning the protected value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwMutex<T> {
    /// Get the lock ID
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Exclusive access, suspending until granted
    pub async fn write(&self) -> RwMutexWriteGuard<'_, T> {
        self.lock().await;
        RwMutexWriteGuard::new(self, Owner::current())
    }

    /// Shared access, suspending until granted
    pub async fn read(&self) -> RwMutexReadGuard<'_, T> {
        self.rlock().await;
        RwMutexReadGuard::new(self)
    }

    /// Exclusive access if immediately available
    pub fn try_write(&self) -> Option<RwMutexWriteGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.write_locked || state.readers > 0 || !state.waiters.is_empty() {
            return None;
        }
        let owner = Owner::current();
        state.write_locked = true;
        state.writer = Some(owner);
        drop(state);
        Some(RwMutexWriteGuard::new(self, owner))
    }

    /// Shared access if no writer holds or awaits the lock
    pub fn try_read(&self) -> Option<RwMutexReadGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.write_locked || !state.waiters.is_empty() {
            return None;
        }
        state.readers += 1;
        drop(state);
        Some(RwMutexReadGuard::new(self))
    }

    /// Mutable access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Acquire exclusively without a guard. Pair with [`RwMutex::unlock`].
    pub async fn lock(&self) {
        let waker = current_waker().await;
        let token = {
            let mut state = self.state.lock();
            if !state.write_locked && state.readers == 0 && state.waiters.is_empty() {
                state.write_locked = true;
                state.writer = Some(Owner::current());
                return;
            }
            let token = Token::new(&waker);
            state.waiters.push_back(RwWaiter {
                token: token.clone(),
                exclusive: true,
            });
            token
        };

        let mut pending = PendingRw {
            rw: self,
            token: &token,
            exclusive: true,
            armed: true,
        };
        token.wait(BlockReason::WriteLock(self.id)).await;
        pending.armed = false;
    }

    /// Acquire shared without a guard. Pair with [`RwMutex::runlock`].
    pub async fn rlock(&self) {
        let waker = current_waker().await;
        let token = {
            let mut state = self.state.lock();
            if !state.write_locked && state.waiters.is_empty() {
                state.readers += 1;
                return;
            }
            let token = Token::new(&waker);
            state.waiters.push_back(RwWaiter {
                token: token.clone(),
                exclusive: false,
            });
            token
        };

        let mut pending = PendingRw {
            rw: self,
            token: &token,
            exclusive: false,
            armed: true,
        };
        token.wait(BlockReason::ReadLock(self.id)).await;
        pending.armed = false;
    }

    /// Release exclusive access taken with [`RwMutex::lock`]
    pub fn unlock(&self) -> Result<(), NotOwnerError> {
        self.unlock_as(Owner::current())
    }

    pub(crate) fn unlock_as(&self, caller: Owner) -> Result<(), NotOwnerError> {
        let granted = {
            let mut state = self.state.lock();
            if !state.write_locked || state.writer != Some(caller) {
                return Err(NotOwnerError {
                    lock: self.id,
                    caller,
                });
            }
            state.write_locked = false;
            state.writer = None;
            state.grant()
        };
        wake_all(granted);
        Ok(())
    }

    /// Release shared access taken with [`RwMutex::rlock`].
    ///
    /// Fails with [`NotOwnerError`] when no reader holds the lock.
    pub fn runlock(&self) -> Result<(), NotOwnerError> {
        let granted = {
            let mut state = self.state.lock();
            if state.readers == 0 {
                return Err(NotOwnerError {
                    lock: self.id,
                    caller: Owner::current(),
                });
            }
            state.readers -= 1;
            if state.readers == 0 {
                state.grant()
            } else {
                Vec::new()
            }
        };
        wake_all(granted);
        Ok(())
    }

    /// Number of readers inside
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    /// Whether a writer holds the lock
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().write_locked
    }

    /// Queued readers and writers
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T: Default> Default for RwMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for RwMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RwMutex")
            .field("id", &self.id)
            .field("write_locked", &state.write_locked)
            .field("readers", &state.readers)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Withdraws a queued lock/rlock whose future was dropped
struct PendingRw<'a, T: ?Sized> {
    rw: &'a RwMutex<T>,
    token: &'a Arc<Token>,
    exclusive: bool,
    armed: bool,
}

impl<T: ?Sized> Drop for PendingRw<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let granted = {
            let mut state = self.rw.state.lock();
            if self.token.is_fired() {
                // Granted after we stopped waiting; give it back
                if self.exclusive {
                    state.write_locked = false;
                    state.writer = None;
                } else {
                    state.readers -= 1;
                }
            } else {
                state.remove(self.token);
            }
            // A withdrawn writer may have been holding readers back
            state.grant()
        };
        wake_all(granted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::block_on;

    #[test]
    fn test_readers_share() {
        let rw = RwMutex::new(1);
        let r1 = rw.try_read().unwrap();
        let r2 = rw.try_read().unwrap();
        assert_eq!(*r1 + *r2, 2);
        assert_eq!(rw.readers(), 2);
        assert!(rw.try_write().is_none());
        drop(r1);
        drop(r2);
        assert_eq!(rw.readers(), 0);
        assert!(rw.try_write().is_some());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let rw = RwMutex::new(String::new());
        let mut w = rw.try_write().unwrap();
        w.push('x');
        assert!(rw.is_write_locked());
        assert!(rw.try_read().is_none());
        drop(w);
        assert_eq!(*rw.try_read().unwrap(), "x");
    }

    #[test]
    fn test_runlock_without_readers() {
        let rw = RwMutex::new(());
        let err = rw.runlock().unwrap_err();
        assert_eq!(err.lock, rw.id());
    }

    #[test]
    fn test_unlock_when_not_write_locked() {
        let rw = RwMutex::new(());
        assert!(rw.unlock().is_err());
        block_on(rw.rlock());
        assert!(rw.unlock().is_err());
        rw.runlock().unwrap();
    }

    #[test]
    fn test_grant_readers_up_to_writer() {
        let mut state = RwState {
            write_locked: false,
            writer: None,
            readers: 0,
            waiters: VecDeque::new(),
        };
        let waker = std::task::Waker::from(Arc::new(Noop));
        for exclusive in [false, false, true, false] {
            state.waiters.push_back(RwWaiter {
                token: Token::new(&waker),
                exclusive,
            });
        }

        let granted = state.grant();
        assert_eq!(granted.len(), 2);
        assert_eq!(state.readers, 2);
        assert_eq!(state.waiters.len(), 2);

        state.readers = 0;
        let granted = state.grant();
        assert_eq!(granted.len(), 1);
        assert!(state.write_locked);
        assert_eq!(state.waiters.len(), 1);
    }

    struct Noop;

    impl std::task::Wake for Noop {
        fn wake(self: Arc<Self>) {}
    }
}
