//! Worker thread run loop

use super::context::{self, WorkerContext};
use super::deque::{Source, WorkerDeque};
use super::fatal;
use super::scheduler::Shared;
use super::task::{Parked, Task, TaskState};
use rand::rngs::StdRng;
use std::sync::Arc;
use std::task::Poll;

/// Worker thread main loop
pub(crate) fn run(shared: Arc<Shared>, index: usize, deque: WorkerDeque, rng: StdRng) {
    let span = tracing::info_span!("worker", id = index);
    let _enter = span.enter();
    tracing::debug!("worker started");

    context::enter(WorkerContext {
        shared: shared.clone(),
        index,
        deque,
        rng,
    });

    while !shared.is_shutdown() {
        let found = context::with_worker(|ctx| ctx.deque.find_work()).flatten();
        match found {
            Some((task, source)) => {
                if let Source::Stolen(victim) = source {
                    shared.record_steal();
                    tracing::trace!(task = %task.id(), victim, "stole task");
                }
                run_task(&shared, index, task);
            }
            None => shared.park_idle(),
        }
    }

    // Tasks left in the local queue stay registered and are abandoned
    drop(context::exit());
    shared.worker_exited(index);
}

/// Resume one task for one poll
fn run_task(shared: &Arc<Shared>, index: usize, task: Arc<Task>) {
    if !task.begin_run(index) {
        match task.state() {
            // Abandoned by a shutdown that raced the dequeue
            TaskState::Done if shared.is_shutdown() => return,
            state => fatal(&format!("dequeued {} in state {:?}", task.id(), state)),
        }
    }

    context::set_current(Some(task.clone()));
    let poll = task.poll();
    context::set_current(None);
    let yielded = context::take_yield_request();

    match poll {
        Poll::Ready(outcome) => {
            task.finish();
            shared.task_finished(&task, outcome);
        }
        Poll::Pending if yielded => {
            task.yield_now();
            requeue_local(shared, task);
        }
        Poll::Pending => match task.park(shared) {
            Parked::Rescheduled => requeue_local(shared, task),
            Parked::Blocked => {
                tracing::trace!(task = %task.id(), reason = ?task.block_reason(), "blocked");
            }
        },
    }
}

fn requeue_local(shared: &Arc<Shared>, task: Arc<Task>) {
    // Always our own runtime here, so this lands on the local tail
    shared.schedule(task);
}
