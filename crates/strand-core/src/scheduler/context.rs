//! Per-thread runtime context
//!
//! A worker thread installs a `WorkerContext` for its lifetime; the task it
//! is polling is tracked separately so primitives can name their owner and
//! record why the task blocked. Borrows are kept short and never span a poll.

use super::deque::WorkerDeque;
use super::scheduler::{Handle, Shared};
use super::task::{BlockReason, Task, TaskId};
use rand::rngs::StdRng;
use rand::RngCore;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

pub(crate) struct WorkerContext {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: usize,
    pub(crate) deque: WorkerDeque,
    pub(crate) rng: StdRng,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    static YIELD_REQUESTED: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn enter(ctx: WorkerContext) {
    WORKER.with(|w| *w.borrow_mut() = Some(ctx));
}

pub(crate) fn exit() -> Option<WorkerContext> {
    WORKER.try_with(|w| w.borrow_mut().take()).ok().flatten()
}

/// Run `f` against this thread's worker context, if any
pub(crate) fn with_worker<R>(f: impl FnOnce(&mut WorkerContext) -> R) -> Option<R> {
    WORKER
        .try_with(|w| match w.try_borrow_mut() {
            Ok(mut slot) => slot.as_mut().map(f),
            Err(_) => None,
        })
        .ok()
        .flatten()
}

/// Whether this thread is a worker of any runtime
pub(crate) fn in_worker() -> bool {
    WORKER
        .try_with(|w| w.try_borrow().map(|s| s.is_some()).unwrap_or(true))
        .unwrap_or(false)
}

/// Whether this thread is a worker of the runtime owning `shared`
pub(crate) fn is_worker_of(shared: &Arc<Shared>) -> bool {
    with_worker(|ctx| Arc::ptr_eq(&ctx.shared, shared)).unwrap_or(false)
}

/// Push to the local queue if this thread is a worker of `shared`
pub(crate) fn try_push_local(shared: &Arc<Shared>, task: Arc<Task>) -> Result<(), Arc<Task>> {
    let mut task = Some(task);
    let pushed = with_worker(|ctx| {
        if !Arc::ptr_eq(&ctx.shared, shared) {
            return false;
        }
        if let Some(task) = task.take() {
            ctx.deque.push(task);
        }
        true
    })
    .unwrap_or(false);

    match task {
        Some(task) if !pushed => Err(task),
        _ => Ok(()),
    }
}

/// Push to the local queue if this thread is worker `index` of `shared`
pub(crate) fn try_push_local_on(
    shared: &Arc<Shared>,
    index: usize,
    task: Arc<Task>,
) -> Result<(), Arc<Task>> {
    let mut task = Some(task);
    let pushed = with_worker(|ctx| {
        if !Arc::ptr_eq(&ctx.shared, shared) || ctx.index != index {
            return false;
        }
        if let Some(task) = task.take() {
            ctx.deque.push(task);
        }
        true
    })
    .unwrap_or(false);

    match task {
        Some(task) if !pushed => Err(task),
        _ => Ok(()),
    }
}

/// Handle of the runtime this thread works for
pub(crate) fn current_handle() -> Option<Handle> {
    if let Some(handle) = with_worker(|ctx| Handle::from_shared(ctx.shared.clone())) {
        return Some(handle);
    }
    // Inside a task polled re-entrantly (context already borrowed)
    CURRENT
        .try_with(|c| {
            c.borrow()
                .as_ref()
                .and_then(|task| task.runtime())
                .map(Handle::from_shared)
        })
        .ok()
        .flatten()
}

pub(crate) fn set_current(task: Option<Arc<Task>>) {
    CURRENT.with(|c| *c.borrow_mut() = task);
}

/// Identifier of the task running on this thread
pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT
        .try_with(|c| c.borrow().as_ref().map(|t| t.id()))
        .ok()
        .flatten()
}

/// Note why the current task is about to return `Pending`
pub(crate) fn record_block(reason: BlockReason) {
    let _ = CURRENT.try_with(|c| {
        if let Some(task) = c.borrow().as_ref() {
            task.set_block_reason(reason);
        }
    });
}

/// Ask the worker to requeue the current task at its local tail.
/// False when no task is running on this thread.
pub(crate) fn request_yield() -> bool {
    if current_task_id().is_none() {
        return false;
    }
    YIELD_REQUESTED.with(|y| y.set(true));
    true
}

pub(crate) fn take_yield_request() -> bool {
    YIELD_REQUESTED.with(|y| y.replace(false))
}

/// Run `f` with the worker's seeded random source, or the thread RNG
/// off-runtime.
pub(crate) fn with_rng<R>(f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
    let mut f = Some(f);
    let seeded = with_worker(|ctx| {
        let f = f.take()?;
        Some(f(&mut ctx.rng))
    })
    .flatten();

    match (seeded, f) {
        (Some(result), _) => result,
        (None, Some(f)) => f(&mut rand::thread_rng()),
        (None, None) => super::fatal("rng closure consumed without a result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_no_context_off_runtime() {
        assert!(!in_worker());
        assert_eq!(current_task_id(), None);
        assert!(current_handle().is_none());
        assert!(!request_yield());
        assert!(!take_yield_request());
    }

    #[test]
    fn test_rng_fallback_off_runtime() {
        let value = with_rng(|rng| rng.gen_range(0..10u32));
        assert!(value < 10);
    }
}
