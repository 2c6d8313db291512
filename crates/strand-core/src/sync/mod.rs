//! Synchronization primitives for task coordination
//!
//! These block at the task level instead of the OS thread level: a task
//! waiting for a lock is suspended and its worker moves on to other tasks.

mod guard;
mod lock_id;
mod mutex;
mod owner;
mod rwmutex;
pub(crate) mod token;

pub use guard::{MutexGuard, RwMutexReadGuard, RwMutexWriteGuard};
pub use lock_id::LockId;
pub use mutex::Mutex;
pub use owner::Owner;
pub use rwmutex::RwMutex;

/// Unlock called by a task or thread that does not hold the lock
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unlock of {lock} by non-owner {caller}")]
pub struct NotOwnerError {
    /// The lock
    pub lock: LockId,
    /// Who attempted the unlock
    pub caller: Owner,
}
