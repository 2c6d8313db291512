//! Join handles for spawned tasks

use super::context;
use super::park;
use super::task::{BlockReason, TaskId};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Why a task produced no value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// The task body panicked; the message is the panic payload
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The runtime shut down before the task finished
    #[error("task abandoned by runtime shutdown")]
    Abandoned,
}

/// Result slot shared by a task body and its `JoinHandle`
pub(crate) struct JoinState<T> {
    inner: Mutex<JoinInner<T>>,
    finished: AtomicBool,
}

struct JoinInner<T> {
    result: Option<Result<T, JoinError>>,
    waker: Option<Waker>,
}

impl<T> JoinState<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(JoinInner {
                result: None,
                waker: None,
            }),
            finished: AtomicBool::new(false),
        }
    }

    /// Publish the result. Only the first call has any effect.
    pub(crate) fn complete(&self, result: Result<T, JoinError>) {
        let waker = {
            let mut inner = self.inner.lock();
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            inner.result = Some(result);
            self.finished.store(true, Ordering::Release);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Publish `Abandoned` unless a result already exists
    pub(crate) fn abandon(&self) {
        self.complete(Err(JoinError::Abandoned));
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn try_take(&self) -> Option<Result<T, JoinError>> {
        self.inner.lock().result.take()
    }
}

/// Handle to await a spawned task's result
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Arc<JoinState<T>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(id: TaskId, state: Arc<JoinState<T>>) -> Self {
        Self { id, state }
    }

    /// Identifier of the spawned task
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has finished (completed, panicked or abandoned)
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Block the calling OS thread until the task finishes.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a runtime task; await the handle instead.
    pub fn join(self) -> Result<T, JoinError> {
        park::block_on(self)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.state.inner.lock();
        if let Some(result) = inner.result.take() {
            return Poll::Ready(result);
        }
        if self.state.is_finished() {
            // Result already taken by an earlier poll
            return Poll::Ready(Err(JoinError::Abandoned));
        }
        match &inner.waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => inner.waker = Some(cx.waker().clone()),
        }
        drop(inner);
        context::record_block(BlockReason::Join(self.id));
        Poll::Pending
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
