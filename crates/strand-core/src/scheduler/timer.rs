//! Timer thread backing `after` and `sleep`
//!
//! Each runtime owns one timer thread. It waits on a condvar for the
//! earliest deadline, then sends the fire time on the timer's channel and
//! closes it, so a timer is just another channel a task can receive from
//! or select on.

use crate::channel::Channel;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Entry in the timer heap
struct TimerEntry {
    /// When to fire
    deadline: Instant,
    /// Registration order, to break deadline ties
    seq: u64,
    /// Receives the fire time, then closes
    channel: Channel<Instant>,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Timer thread for a runtime
pub(crate) struct TimerThread {
    /// Pending timers, earliest first
    pending: Mutex<BinaryHeap<TimerEntry>>,
    /// Wakes the timer thread on a new registration or shutdown
    notify: Condvar,
    /// Timers whose deadline is past the clock's range; closed at stop
    unbounded: Mutex<Vec<Channel<Instant>>>,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(BinaryHeap::new()),
            notify: Condvar::new(),
            unbounded: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            handle: Mutex::new(None),
        })
    }

    /// Start the timer thread
    pub(crate) fn start(self: &Arc<Self>, name: String) -> io::Result<()> {
        let timer = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || timer.run_loop())?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the thread and close every pending timer channel
    pub(crate) fn stop(&self) {
        {
            let _pending = self.pending.lock();
            self.shutdown.store(true, AtomicOrdering::Release);
            self.notify.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let drained: Vec<TimerEntry> = self.pending.lock().drain().collect();
        for entry in drained {
            let _ = entry.channel.close();
        }
        let unbounded: Vec<Channel<Instant>> = self.unbounded.lock().drain(..).collect();
        for channel in unbounded {
            let _ = channel.close();
        }
    }

    /// Channel that receives one value at `now + delay`.
    ///
    /// A delay too large for `Instant` never fires; its channel stays open
    /// until the timer stops.
    pub(crate) fn after(&self, delay: Duration) -> Channel<Instant> {
        let channel = Channel::new(1);
        let deadline = Instant::now().checked_add(delay);

        let mut pending = self.pending.lock();
        if self.shutdown.load(AtomicOrdering::Acquire) {
            drop(pending);
            let _ = channel.close();
            return channel;
        }
        let Some(deadline) = deadline else {
            self.unbounded.lock().push(channel.clone());
            return channel;
        };
        pending.push(TimerEntry {
            deadline,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            channel: channel.clone(),
        });
        self.notify.notify_one();
        channel
    }

    /// Number of timers that have not fired yet
    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn run_loop(&self) {
        let mut pending = self.pending.lock();
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let now = Instant::now();
            let mut due = Vec::new();
            while pending.peek().map_or(false, |e| e.deadline <= now) {
                if let Some(entry) = pending.pop() {
                    due.push(entry);
                }
            }

            if !due.is_empty() {
                // Fire outside the heap lock; sends may wake tasks
                drop(pending);
                for entry in due {
                    let _ = entry.channel.try_send(now);
                    let _ = entry.channel.close();
                }
                pending = self.pending.lock();
                continue;
            }

            match pending.peek().map(|e| e.deadline) {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(now);
                    self.notify.wait_for(&mut pending, timeout);
                }
                None => self.notify.wait(&mut pending),
            }
        }

        tracing::debug!("timer thread shutting down");
    }
}
