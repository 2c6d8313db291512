//! Strand Core Runtime
//!
//! This crate provides a user-space concurrency runtime:
//! - Task scheduler (goroutine-style green tasks on a fixed worker pool)
//! - Typed channels, synchronous and buffered
//! - Multi-way `Select` over channel operations
//! - Task-aware synchronization primitives (Mutex, RwMutex)
//!
//! Task bodies are futures. A task suspends only when it awaits one of the
//! runtime's primitives, so every suspension point is explicit.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod config;
pub mod logger;
pub mod scheduler;
pub mod select;
pub mod sync;

pub use channel::{
    channel, Channel, ChannelId, ClosedChannelError, DoubleCloseError, TryRecvError, TrySendError,
};
pub use config::{ConfigError, RuntimeConfig};
pub use scheduler::{
    after, current_id, sleep, spawn, yield_now, BlockReason, Builder, Handle, JoinError, JoinHandle, Runtime,
    RuntimeStats, TaskId, TaskState,
};
pub use select::Select;
pub use sync::{
    LockId, Mutex, MutexGuard, NotOwnerError, Owner, RwMutex, RwMutexReadGuard, RwMutexWriteGuard,
};

/// Runtime construction and lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Invalid runtime configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The host refused to create a worker or timer thread
    #[error("Failed to spawn runtime thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Runtime result
pub type RuntimeResult<T> = Result<T, RuntimeError>;
