//! Task scheduler
//!
//! A fixed pool of worker threads runs green tasks. Each worker owns a
//! FIFO local queue; a global queue takes tasks spawned or woken from
//! outside the pool. Idle workers steal from peers before parking.
//!
//! A task body is a future. Resuming a task polls it once; returning
//! `Pending` blocks it until one of the runtime's primitives wakes it.

mod context;
mod deque;
mod join;
mod park;
#[allow(clippy::module_inception)]
mod scheduler;
mod task;
mod timer;
mod worker;

pub use join::{JoinError, JoinHandle};
pub use scheduler::{Builder, Handle, Runtime, RuntimeStats};
pub use task::{BlockReason, TaskId, TaskState};

pub(crate) use context::{current_task_id, record_block, with_rng};
pub(crate) use park::block_on;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::channel::Channel;

/// Log and abort on a broken scheduler invariant.
///
/// Unwinding here would leave other workers with corrupt shared state.
#[cold]
pub(crate) fn fatal(message: &str) -> ! {
    tracing::error!("runtime invariant violated: {}", message);
    std::process::abort()
}

fn current_handle(what: &str) -> Handle {
    match Handle::current() {
        Some(handle) => handle,
        None => panic!("`{}` called outside of a strand runtime", what),
    }
}

/// Spawn a task on the current runtime.
///
/// # Panics
///
/// Panics when called outside a runtime task; use [`Handle::spawn`] there.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    current_handle("spawn").spawn(future)
}

/// Identifier of the task running on this thread
pub fn current_id() -> Option<TaskId> {
    current_task_id()
}

/// Give up the worker; the task goes to the back of its worker's queue.
pub async fn yield_now() {
    YieldNow { yielded: false }.await
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        if !context::request_yield() {
            // Not on a worker: let whoever polls us come back
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }
}

/// Channel that receives the current instant once `delay` has passed.
///
/// # Panics
///
/// Panics when called outside a runtime task; use [`Handle::after`] there.
pub fn after(delay: Duration) -> Channel<Instant> {
    current_handle("after").after(delay)
}

/// Suspend the current task for at least `delay`
pub async fn sleep(delay: Duration) {
    let _ = after(delay).recv().await;
}
