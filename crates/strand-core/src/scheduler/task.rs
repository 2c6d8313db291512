//! Task structure and execution state

use super::join::{JoinError, JoinState};
use super::scheduler::Shared;
use super::fatal;
use crate::channel::ChannelId;
use crate::sync::LockId;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub(crate) fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// State of a Task
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, waiting for a worker
    Runnable = 0,
    /// Currently executing on a worker
    Running = 1,
    /// Suspended on a channel, lock or join; not in any run queue
    Blocked = 2,
    /// Finished (normally or by panic); never rescheduled
    Done = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Runnable,
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Done,
            other => fatal(&format!("corrupt task state byte {}", other)),
        }
    }
}

/// Why a Task is blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting to send on a channel
    Send(ChannelId),
    /// Waiting to receive from a channel
    Recv(ChannelId),
    /// Waiting in a select over these channels
    Select(Vec<ChannelId>),
    /// Waiting to acquire a mutex
    Lock(LockId),
    /// Waiting for shared access to an RwMutex
    ReadLock(LockId),
    /// Waiting for exclusive access to an RwMutex
    WriteLock(LockId),
    /// Waiting for another task to finish
    Join(TaskId),
}

/// How a task body ended
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    Panicked,
}

/// Type-erased task body. The typed result goes to the task's `JoinState`.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

const NO_WORKER: usize = usize::MAX;

/// Result of suspending a task after a `Pending` poll
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Parked {
    /// Task is Blocked until a peer wakes it
    Blocked,
    /// A wake raced the poll; the task is Runnable again
    Rescheduled,
}

/// A lightweight green task owned by the scheduler
pub(crate) struct Task {
    /// Unique identifier
    id: TaskId,

    /// Current state (a `TaskState` byte)
    state: AtomicU8,

    /// Set by every wake; re-checked after the worker records Blocked
    notified: AtomicBool,

    /// Worker index while Running
    worker: AtomicUsize,

    /// Worker that last ran this task; kept across suspension
    home: AtomicUsize,

    /// Set while Blocked
    block_reason: Mutex<Option<BlockReason>>,

    /// Saved continuation
    future: Mutex<Option<BoxFuture>>,

    /// Owning runtime, for re-enqueueing on wake
    shared: Weak<Shared>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("worker", &self.worker())
            .finish()
    }
}

impl Task {
    /// Create a Runnable task around `future`
    pub(crate) fn new(future: BoxFuture, shared: Weak<Shared>) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::new(),
            state: AtomicU8::new(TaskState::Runnable as u8),
            notified: AtomicBool::new(false),
            worker: AtomicUsize::new(NO_WORKER),
            home: AtomicUsize::new(NO_WORKER),
            block_reason: Mutex::new(None),
            future: Mutex::new(Some(future)),
            shared,
        })
    }

    /// Get the Task's unique ID
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Get the current state
    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Worker running this task, if Running
    pub(crate) fn worker(&self) -> Option<usize> {
        match self.worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            index => Some(index),
        }
    }

    /// Worker that last ran this task, if it ever ran
    pub(crate) fn home(&self) -> Option<usize> {
        match self.home.load(Ordering::Acquire) {
            NO_WORKER => None,
            index => Some(index),
        }
    }

    /// Owning runtime, if still alive
    pub(crate) fn runtime(&self) -> Option<Arc<Shared>> {
        self.shared.upgrade()
    }

    pub(crate) fn block_reason(&self) -> Option<BlockReason> {
        self.block_reason.lock().clone()
    }

    pub(crate) fn set_block_reason(&self, reason: BlockReason) {
        *self.block_reason.lock() = Some(reason);
    }

    /// Runnable -> Running on `worker`. False if the task was not Runnable.
    pub(crate) fn begin_run(&self, worker: usize) -> bool {
        if self
            .state
            .compare_exchange(
                TaskState::Runnable as u8,
                TaskState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        self.worker.store(worker, Ordering::Release);
        self.home.store(worker, Ordering::Release);
        self.notified.store(false, Ordering::SeqCst);
        *self.block_reason.lock() = None;
        true
    }

    /// Resume the continuation once.
    pub(crate) fn poll(self: &Arc<Self>) -> Poll<Outcome> {
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(fut) = slot.as_mut() else {
            fatal(&format!("{} resumed without a continuation", self.id));
        };

        let poll = fut.as_mut().poll(&mut cx);
        if poll.is_ready() {
            // Drop the body outside the slot lock
            let body = slot.take();
            drop(slot);
            drop(body);
        }
        poll
    }

    /// Running -> Done
    pub(crate) fn finish(&self) {
        self.state.store(TaskState::Done as u8, Ordering::SeqCst);
        self.worker.store(NO_WORKER, Ordering::Release);
        *self.block_reason.lock() = None;
    }

    /// Running -> Runnable after an explicit yield
    pub(crate) fn yield_now(&self) {
        self.worker.store(NO_WORKER, Ordering::Release);
        self.state.store(TaskState::Runnable as u8, Ordering::SeqCst);
    }

    /// Running -> Blocked after a `Pending` poll.
    ///
    /// A wake that fired during the poll saw Running and only set
    /// `notified`; it is picked up here so the task is not lost.
    pub(crate) fn park(&self, shared: &Shared) -> Parked {
        self.worker.store(NO_WORKER, Ordering::Release);
        shared.counters.blocked.fetch_add(1, Ordering::SeqCst);

        if self
            .state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Blocked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            fatal(&format!("{} left Running while being polled", self.id));
        }

        if self.notified.load(Ordering::SeqCst) && self.try_unblock() {
            shared.counters.blocked.fetch_sub(1, Ordering::SeqCst);
            return Parked::Rescheduled;
        }
        Parked::Blocked
    }

    /// Forced shutdown: mark Done and hand back the previous state and the
    /// continuation to drop
    pub(crate) fn abandon(&self) -> (TaskState, Option<BoxFuture>) {
        let previous = self.state.swap(TaskState::Done as u8, Ordering::SeqCst);
        let future = self.future.lock().take();
        (TaskState::from_u8(previous), future)
    }

    fn try_unblock(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Blocked as u8,
                TaskState::Runnable as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notified.store(true, Ordering::SeqCst);
        if !self.try_unblock() {
            // Runnable, Running or Done: nothing to enqueue
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.counters.blocked.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!(task = %self.id, "unblocked");
            shared.schedule_woken(self.clone());
        }
    }
}

/// Future wrapper that isolates panics and publishes the typed result.
pub(crate) struct TaskBody<F: Future> {
    future: Pin<Box<F>>,
    join: Arc<JoinState<F::Output>>,
}

impl<F: Future> TaskBody<F> {
    pub(crate) fn new(future: F, join: Arc<JoinState<F::Output>>) -> Self {
        Self {
            future: Box::pin(future),
            join,
        }
    }
}

impl<F: Future> Future for TaskBody<F> {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        let this = &mut *self;
        match catch_unwind(AssertUnwindSafe(|| this.future.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.join.complete(Ok(value));
                Poll::Ready(Outcome::Completed)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(panic = %message, "task panicked");
                this.join.complete(Err(JoinError::Panicked(message)));
                Poll::Ready(Outcome::Panicked)
            }
        }
    }
}

impl<F: Future> Drop for TaskBody<F> {
    fn drop(&mut self) {
        // No-op once a result was published
        self.join.abandon();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
