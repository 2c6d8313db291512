//! Lock owner identity

use crate::scheduler::{current_task_id, TaskId};
use std::fmt;
use std::thread::{self, ThreadId};

/// Who holds a lock: a runtime task, or an OS thread outside the runtime
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// A task, wherever it happens to be polled
    Task(TaskId),
    /// A thread blocking through `lock_blocking` or similar
    Thread(ThreadId),
}

impl Owner {
    /// Identity of the caller: the running task if any, else this thread
    pub fn current() -> Self {
        match current_task_id() {
            Some(id) => Owner::Task(id),
            None => Owner::Thread(thread::current().id()),
        }
    }

    /// The owning task, if a task owns it
    pub fn task(self) -> Option<TaskId> {
        match self {
            Owner::Task(id) => Some(id),
            Owner::Thread(_) => None,
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Task(id) => write!(f, "{}", id),
            Owner::Thread(id) => write!(f, "thread {:?}", id),
        }
    }
}
