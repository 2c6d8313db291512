//! RAII guards for automatic unlock

use super::{Mutex, Owner, RwMutex};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

/// RAII guard for Mutex (auto-unlocks on drop)
///
/// The guard remembers its owner, so it may be dropped from another task
/// after being moved there.
pub struct MutexGuard<'a, T: ?Sized> {
    /// Reference to the mutex
    mutex: &'a Mutex<T>,
    /// Task that owns the lock
    owner: Owner,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// The caller must own `mutex`
    pub(crate) fn new(mutex: &'a Mutex<T>, owner: Owner) -> Self {
        Self {
            mutex,
            owner,
            _marker: PhantomData,
        }
    }

    /// Unlock early, handing off to the next waiter
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock
        unsafe { &*self.mutex.data_ptr() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively
        unsafe { &mut *self.mutex.data_ptr() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Cannot fail: the guard is the owner
        let _ = self.mutex.release_as(self.owner);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Shared access to an RwMutex (releases on drop)
pub struct RwMutexReadGuard<'a, T: ?Sized> {
    rw: &'a RwMutex<T>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: ?Sized> RwMutexReadGuard<'a, T> {
    pub(crate) fn new(rw: &'a RwMutex<T>) -> Self {
        Self {
            rw,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for RwMutexReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: no writer while any read guard exists
        unsafe { &*self.rw.data_ptr() }
    }
}

impl<T: ?Sized> Drop for RwMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.rw.runlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwMutexReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// Exclusive access to an RwMutex (releases on drop)
pub struct RwMutexWriteGuard<'a, T: ?Sized> {
    rw: &'a RwMutex<T>,
    owner: Owner,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> RwMutexWriteGuard<'a, T> {
    pub(crate) fn new(rw: &'a RwMutex<T>, owner: Owner) -> Self {
        Self {
            rw,
            owner,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for RwMutexWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the write lock
        unsafe { &*self.rw.data_ptr() }
    }
}

impl<T: ?Sized> DerefMut for RwMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the write lock
        unsafe { &mut *self.rw.data_ptr() }
    }
}

impl<T: ?Sized> Drop for RwMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.rw.unlock_as(self.owner);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwMutexWriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
