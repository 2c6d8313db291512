//! Run queues for a single worker

use super::task::Task;
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::sync::Arc;

/// Where `find_work` got a task from
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Source {
    Local,
    Global,
    Stolen(usize),
}

/// Work-stealing run queues for a single worker
pub(crate) struct WorkerDeque {
    /// This worker's index
    index: usize,

    /// Local FIFO queue
    worker: Worker<Arc<Task>>,

    /// Stealer handles for every worker, indexed by worker
    stealers: Vec<Stealer<Arc<Task>>>,

    /// Global queue for tasks without affinity
    injector: Arc<Injector<Arc<Task>>>,

    /// Next victim to try; rotates so no peer is always hit first
    next_victim: usize,

    /// Dispatches since start, for the fairness check
    dispatches: u64,

    fairness_tick: u32,
}

impl WorkerDeque {
    pub(crate) fn new(
        index: usize,
        worker: Worker<Arc<Task>>,
        stealers: Vec<Stealer<Arc<Task>>>,
        injector: Arc<Injector<Arc<Task>>>,
        fairness_tick: u32,
    ) -> Self {
        Self {
            index,
            worker,
            next_victim: (index + 1) % stealers.len().max(1),
            stealers,
            injector,
            dispatches: 0,
            fairness_tick: fairness_tick.max(1),
        }
    }

    /// Push a task to the tail of the local queue
    pub(crate) fn push(&self, task: Arc<Task>) {
        self.worker.push(task);
    }

    /// Check if the local queue is empty
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    /// Number of tasks in the local queue
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.worker.len()
    }

    /// Next task to run: local, then global, then steal.
    ///
    /// Every `fairness_tick` dispatches the global queue goes first so
    /// a worker with a busy local queue cannot starve injected tasks.
    pub(crate) fn find_work(&mut self) -> Option<(Arc<Task>, Source)> {
        self.dispatches += 1;
        if self.dispatches % u64::from(self.fairness_tick) == 0 {
            if let Some(task) = self.steal_global() {
                return Some((task, Source::Global));
            }
        }

        if let Some(task) = self.worker.pop() {
            return Some((task, Source::Local));
        }

        if let Some(task) = self.steal_global() {
            return Some((task, Source::Global));
        }

        self.steal_from_others()
            .map(|(task, victim)| (task, Source::Stolen(victim)))
    }

    fn steal_global(&self) -> Option<Arc<Task>> {
        loop {
            match self.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Steal one task, trying victims round-robin from `next_victim`
    fn steal_from_others(&mut self) -> Option<(Arc<Task>, usize)> {
        let count = self.stealers.len();
        if count <= 1 {
            return None;
        }

        let start = self.next_victim;
        for i in 0..count {
            let victim = (start + i) % count;
            if victim == self.index {
                continue;
            }

            // Retry loop for stealing (handle concurrent modifications)
            loop {
                match self.stealers[victim].steal() {
                    Steal::Success(task) => {
                        self.next_victim = (victim + 1) % count;
                        return Some((task, victim));
                    }
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        self.next_victim = (start + 1) % count;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::Outcome;
    use std::sync::Weak;

    fn create_test_task() -> Arc<Task> {
        Task::new(Box::pin(async { Outcome::Completed }), Weak::new())
    }

    fn deques(count: usize, tick: u32) -> Vec<WorkerDeque> {
        let injector = Arc::new(Injector::new());
        let workers: Vec<_> = (0..count).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<_> = workers.iter().map(|w| w.stealer()).collect();
        workers
            .into_iter()
            .enumerate()
            .map(|(i, w)| WorkerDeque::new(i, w, stealers.clone(), injector.clone(), tick))
            .collect()
    }

    #[test]
    fn test_local_queue_is_fifo() {
        let mut d = deques(1, 61).remove(0);
        let t1 = create_test_task();
        let t2 = create_test_task();
        d.push(t1.clone());
        d.push(t2.clone());
        assert_eq!(d.len(), 2);

        let (first, src) = d.find_work().unwrap();
        assert_eq!(first.id(), t1.id());
        assert_eq!(src, Source::Local);
        assert_eq!(d.find_work().unwrap().0.id(), t2.id());
        assert!(d.find_work().is_none());
    }

    #[test]
    fn test_global_before_steal() {
        let mut ds = deques(2, 61);
        let global = create_test_task();
        let peer = create_test_task();
        ds[0].injector.push(global.clone());
        ds[1].push(peer.clone());

        let (task, src) = ds[0].find_work().unwrap();
        assert_eq!(task.id(), global.id());
        assert_eq!(src, Source::Global);

        let (task, src) = ds[0].find_work().unwrap();
        assert_eq!(task.id(), peer.id());
        assert_eq!(src, Source::Stolen(1));
        assert!(ds[1].is_empty());
    }

    #[test]
    fn test_fairness_tick_checks_global_first() {
        let mut d = deques(1, 2).remove(0);
        let local = create_test_task();
        let global = create_test_task();
        d.push(local.clone());
        d.push(create_test_task());
        d.injector.push(global.clone());

        // Dispatch 1: local
        assert_eq!(d.find_work().unwrap().0.id(), local.id());
        // Dispatch 2: tick fires, global wins over the non-empty local queue
        let (task, src) = d.find_work().unwrap();
        assert_eq!(task.id(), global.id());
        assert_eq!(src, Source::Global);
    }

    #[test]
    fn test_victims_rotate() {
        let mut ds = deques(3, 61);
        ds[1].push(create_test_task());
        ds[2].push(create_test_task());
        ds[1].push(create_test_task());

        // Worker 0 starts at victim 1, then moves past it
        assert_eq!(ds[0].find_work().unwrap().1, Source::Stolen(1));
        assert_eq!(ds[0].find_work().unwrap().1, Source::Stolen(2));
        assert_eq!(ds[0].find_work().unwrap().1, Source::Stolen(1));
        assert!(ds[0].find_work().is_none());
    }
}
