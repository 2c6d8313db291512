//! Unique identifier for locks

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a Mutex or RwMutex
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

impl LockId {
    /// Generate a new unique LockId
    pub(crate) fn new() -> Self {
        LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}
