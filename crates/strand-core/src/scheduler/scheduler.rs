//! Runtime coordinating worker threads

use super::context;
use super::deque::WorkerDeque;
use super::join::{JoinError, JoinHandle, JoinState};
use super::park;
use super::task::{BlockReason, BoxFuture, Outcome, Task, TaskBody, TaskId, TaskState};
use super::timer::TimerThread;
use super::worker;
use crate::channel::Channel;
use crate::config::RuntimeConfig;
use crate::RuntimeResult;
use crossbeam_deque::{Injector, Steal, Stealer, Worker as CWorker};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Runtime statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Number of worker threads
    pub workers: usize,

    /// Total tasks spawned
    pub spawned: u64,

    /// Tasks that ran to completion (including panicked ones)
    pub completed: u64,

    /// Tasks whose body panicked
    pub panicked: u64,

    /// Tasks spawned but not yet Done
    pub live: usize,

    /// Tasks currently Blocked
    pub blocked: usize,

    /// Successful steals from peer queues
    pub steals: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) spawned: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) panicked: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) live: AtomicUsize,
    pub(crate) blocked: AtomicUsize,
}

/// State shared by a runtime's workers, handles and tasks
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,

    /// Global queue
    injector: Arc<Injector<Arc<Task>>>,

    /// Stealers for every worker's local queue
    stealers: Vec<Stealer<Arc<Task>>>,

    /// Tasks not yet Done
    tasks: RwLock<FxHashMap<TaskId, Arc<Task>>>,

    pub(crate) counters: Counters,

    /// Workers currently parked (or about to park)
    sleepers: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,

    /// Signalled when `live` drops to zero
    quiescent_lock: Mutex<()>,
    quiescent_cv: Condvar,

    shutdown: AtomicBool,

    /// Workers still in their run loop
    running_workers: AtomicUsize,

    timer: Arc<TimerThread>,
}

impl Shared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn spawn<F>(self: &Arc<Self>, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let join = Arc::new(JoinState::new());
        let body: BoxFuture = Box::pin(TaskBody::new(future, join.clone()));
        let task = Task::new(body, Arc::downgrade(self));
        let id = task.id();
        let handle = JoinHandle::new(id, join);

        if self.is_shutdown() {
            tracing::debug!(task = %id, "spawn after shutdown; abandoned");
            drop(task.abandon());
            return handle;
        }

        self.counters.spawned.fetch_add(1, Ordering::Relaxed);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        self.tasks.write().insert(id, task.clone());

        // Shutdown may have drained the registry between the check and insert
        if self.is_shutdown() {
            let removed = self.tasks.write().remove(&id);
            if let Some(task) = removed {
                drop(task.abandon());
                self.release_live();
            }
            return handle;
        }

        tracing::debug!(task = %id, "spawned");
        self.schedule(task);
        handle
    }

    /// Make a Runnable task visible to the workers.
    ///
    /// On one of this runtime's workers the task goes to the local tail;
    /// anywhere else it goes to the global queue.
    pub(crate) fn schedule(self: &Arc<Self>, task: Arc<Task>) {
        if let Err(task) = context::try_push_local(self, task) {
            self.injector.push(task);
        }
        self.notify_idle();
    }

    /// Re-enqueue a task that was just unblocked.
    ///
    /// Only the worker that last ran the task keeps it local. A wake from
    /// any other worker or thread goes through the global queue, so the
    /// waker's own queue does not collect its peers' tasks.
    pub(crate) fn schedule_woken(self: &Arc<Self>, task: Arc<Task>) {
        let routed = match task.home() {
            Some(home) => context::try_push_local_on(self, home, task),
            None => Err(task),
        };
        if let Err(task) = routed {
            self.injector.push(task);
        }
        self.notify_idle();
    }

    fn notify_idle(&self) {
        // Pairs with the sleepers increment in `park_idle`
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.idle_lock.lock();
            self.idle_cv.notify_one();
        }
    }

    /// Park an idle worker until new work arrives or the timeout passes
    pub(crate) fn park_idle(&self) {
        let mut guard = self.idle_lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        if !self.is_shutdown() && !self.has_visible_work() {
            tracing::trace!("parking");
            self.idle_cv.wait_for(&mut guard, self.config.park_timeout);
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn has_visible_work(&self) -> bool {
        !self.injector.is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    pub(crate) fn record_steal(&self) {
        self.counters.steals.fetch_add(1, Ordering::Relaxed);
    }

    /// Bookkeeping for a task whose body finished
    pub(crate) fn task_finished(&self, task: &Task, outcome: Outcome) {
        self.tasks.write().remove(&task.id());
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if outcome == Outcome::Panicked {
            self.counters.panicked.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(task = %task.id(), ?outcome, "task finished");
        self.release_live();
    }

    fn release_live(&self) {
        if self.counters.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.quiescent_lock.lock();
            self.quiescent_cv.notify_all();
        }
    }

    fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.quiescent_lock.lock();
        while self.counters.live.load(Ordering::SeqCst) > 0 {
            match deadline {
                Some(deadline) => {
                    if self.quiescent_cv.wait_until(&mut guard, deadline).timed_out() {
                        return self.counters.live.load(Ordering::SeqCst) == 0;
                    }
                }
                None => self.quiescent_cv.wait(&mut guard),
            }
        }
        true
    }

    /// Set the shutdown flag and wake every parked worker.
    /// Returns false if shutdown had already begun.
    fn begin_shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _guard = self.idle_lock.lock();
        self.idle_cv.notify_all();
        true
    }

    /// Called by each worker as it leaves its run loop
    pub(crate) fn worker_exited(&self, index: usize) {
        tracing::debug!(worker = index, "worker exited");
        if self.running_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.abandon_all();
        }
    }

    /// Drop every unfinished continuation; their joiners see `Abandoned`
    fn abandon_all(&self) {
        let drained: Vec<Arc<Task>> = self.tasks.write().drain().map(|(_, t)| t).collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "abandoning unfinished tasks");
        }

        for task in drained {
            let (previous, future) = task.abandon();
            if previous == TaskState::Blocked {
                self.counters.blocked.fetch_sub(1, Ordering::SeqCst);
            }
            // Drop guards inside the future may wake other tasks
            drop(future);
            self.release_live();
        }

        loop {
            match self.injector.steal() {
                Steal::Success(_) | Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }

    fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            workers: self.config.worker_threads,
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            live: self.counters.live.load(Ordering::SeqCst),
            blocked: self.counters.blocked.load(Ordering::SeqCst),
            steals: self.counters.steals.load(Ordering::Relaxed),
        }
    }

    fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(&id).cloned()
    }
}

/// Cloneable handle to a running runtime
///
/// Tasks reach their runtime through [`Handle::current`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Handle of the runtime the calling task runs on
    pub fn current() -> Option<Self> {
        context::current_handle()
    }

    /// Spawn a task. After shutdown the task is never run and its handle
    /// resolves to [`JoinError::Abandoned`].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.spawn(future)
    }

    /// Channel that receives the current instant once `delay` has passed,
    /// then closes.
    pub fn after(&self, delay: Duration) -> Channel<Instant> {
        self.shared.timer.after(delay)
    }

    /// Snapshot of the runtime counters
    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.shared.config.worker_threads
    }

    /// Current state of a live task (None once it is Done)
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.task(id).map(|t| t.state())
    }

    /// Why a live task is blocked
    pub fn block_reason(&self, id: TaskId) -> Option<BlockReason> {
        self.shared
            .task(id)
            .filter(|t| t.state() == TaskState::Blocked)
            .and_then(|t| t.block_reason())
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.shared.config.worker_threads)
            .field("shutdown", &self.shared.is_shutdown())
            .finish()
    }
}

/// A fixed pool of worker threads running green tasks
///
/// Workers do not exit when the runtime goes quiescent. An idle worker
/// parks and wakes every `park_timeout` to look for work until
/// [`Runtime::shutdown`], [`Runtime::shutdown_on_idle`] or drop stops it.
pub struct Runtime {
    handle: Handle,

    /// Worker thread handles, joined on shutdown
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Start a runtime with `config`
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let config = config.validate()?;
        let workers = config.worker_threads;

        let locals: Vec<CWorker<Arc<Task>>> = (0..workers).map(|_| CWorker::new_fifo()).collect();
        let stealers: Vec<_> = locals.iter().map(CWorker::stealer).collect();
        let injector = Arc::new(Injector::new());

        let shared = Arc::new(Shared {
            config: config.clone(),
            injector: injector.clone(),
            stealers: stealers.clone(),
            tasks: RwLock::new(FxHashMap::default()),
            counters: Counters::default(),
            sleepers: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            quiescent_lock: Mutex::new(()),
            quiescent_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            running_workers: AtomicUsize::new(workers),
            timer: TimerThread::new(),
        });

        let runtime = Runtime {
            handle: Handle::from_shared(shared.clone()),
            threads: Mutex::new(Vec::with_capacity(workers)),
        };

        shared
            .timer
            .start(format!("{}-timer", config.thread_name_prefix))?;

        for (index, local) in locals.into_iter().enumerate() {
            let deque = WorkerDeque::new(
                index,
                local,
                stealers.clone(),
                injector.clone(),
                config.fairness_tick,
            );
            let rng = match config.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                None => StdRng::from_entropy(),
            };
            let worker_shared = shared.clone();

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name_prefix, index))
                .spawn(move || worker::run(worker_shared, index, deque, rng));

            match spawned {
                Ok(handle) => runtime.threads.lock().push(handle),
                Err(e) => {
                    // Only the threads already started will report exit
                    shared
                        .running_workers
                        .fetch_sub(workers - index, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(workers, seed = ?config.seed, "runtime started");
        Ok(runtime)
    }

    /// Start a runtime with `workers` threads and default settings
    pub fn with_workers(workers: usize) -> RuntimeResult<Self> {
        Builder::new().worker_threads(workers).build()
    }

    /// Create a builder
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Handle for spawning from other threads or tasks
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task. From one of this runtime's workers it goes to that
    /// worker's local queue, from anywhere else to the global queue.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `future` as a task and block the calling thread on its result.
    ///
    /// # Panics
    ///
    /// Panics if called from a worker thread.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output, JoinError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        park::block_on(self.spawn(future))
    }

    /// Block until no live tasks remain.
    ///
    /// Returns immediately if nothing was ever spawned. If the remaining
    /// tasks are all blocked on each other this never returns.
    pub fn wait_idle(&self) {
        self.handle.shared.wait_idle(None);
    }

    /// Like `wait_idle` with a timeout; true if the runtime went quiescent.
    ///
    /// A timeout past the clock's range waits without a deadline.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        self.handle
            .shared
            .wait_idle(Instant::now().checked_add(timeout))
    }

    /// Snapshot of the runtime counters
    pub fn stats(&self) -> RuntimeStats {
        self.handle.stats()
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.handle.worker_count()
    }

    /// Whether shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        self.handle.is_shutdown()
    }

    /// Stop the runtime now.
    ///
    /// Workers finish their current poll and exit; every unfinished task
    /// is abandoned and its joiners receive [`JoinError::Abandoned`].
    /// Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.begin_shutdown() {
            tracing::info!("runtime shutting down");
        }
        shared.timer.stop();

        if context::is_worker_of(shared) {
            // Cannot join ourselves; the last worker out abandons the rest
            return;
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    /// Wait for quiescence, then shut down
    pub fn shutdown_on_idle(&self) {
        self.wait_idle();
        self.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Runtime builder
#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: RuntimeConfig,
}

impl Builder {
    /// Builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from `STRAND_WORKERS` / `STRAND_SEED`
    pub fn from_env() -> Result<Self, crate::ConfigError> {
        Ok(Self {
            config: RuntimeConfig::from_env()?,
        })
    }

    /// Builder from an explicit configuration
    pub fn from_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Number of worker threads (0 = hardware parallelism)
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.config.worker_threads = workers;
        self
    }

    /// Worker thread name prefix
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Seed the runtime random source for reproducible `Select` choices
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Idle park timeout
    pub fn park_timeout(mut self, timeout: Duration) -> Self {
        self.config.park_timeout = timeout;
        self
    }

    /// Dispatches between forced global queue checks
    pub fn fairness_tick(mut self, tick: u32) -> Self {
        self.config.fairness_tick = tick;
        self
    }

    /// Start the runtime
    pub fn build(self) -> RuntimeResult<Runtime> {
        Runtime::new(self.config)
    }
}
