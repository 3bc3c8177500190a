//! Worker pool for background task execution.
//!
//! Threads are started on demand up to a configurable maximum. A thread that
//! finishes a task keeps draining the shared queue while capacity allows,
//! then parks on its own condition variable. If nothing wakes it before the
//! expiry timeout it retires to the expired set, from which a later
//! submission can restart it.
//!
//! Queued tasks are bucketed by priority into fixed-capacity pages so that
//! insertion never scans the whole queue.
//!
//! # Example
//!
//! ```
//! use tether_core::threadpool::{ThreadPool, ThreadPoolConfig};
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
//! let handle = pool.spawn(|| 6 * 7);
//! assert_eq!(handle.wait(), Some(42));
//! ```
//!
//! # Cancellation
//!
//! ```
//! use tether_core::threadpool::{ThreadPool, ThreadPoolConfig};
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
//! let (handle, token) = pool.spawn_cancellable(|token| {
//!     while !token.is_cancelled() {
//!         std::thread::sleep(Duration::from_millis(1));
//!     }
//!     "stopped"
//! });
//! token.cancel();
//! assert_eq!(handle.wait(), Some("stopped"));
//! ```

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError, bounded};
use parking_lot::{Condvar, Mutex, MutexGuard};

pub use crate::config::ThreadPoolConfig;
use crate::dispatcher::panic_message;
use crate::error::{Result, ThreadPoolError};
use crate::logging::targets;

/// Global thread pool instance.
static GLOBAL_POOL: OnceLock<ThreadPool> = OnceLock::new();

/// Counter for unique task IDs.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Tasks per queue page.
const PAGE_CAPACITY: usize = 256;

thread_local! {
    /// Address of the pool state the calling thread works for, or zero.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

/// Priority levels for thread pool tasks.
///
/// Queued tasks run in priority order, and in submission order within one
/// priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum TaskPriority {
    /// Low priority - background maintenance tasks.
    Low = 0,
    /// Normal priority - default for most tasks.
    #[default]
    Normal = 1,
    /// High priority - time-sensitive operations.
    High = 2,
}

/// A cancellation token for cooperative task cancellation.
///
/// Tasks must periodically check the token and exit gracefully when
/// cancelled.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Reset the token to non-cancelled state.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a spawned task that allows waiting for its result.
///
/// Waiting yields `None` if the task panicked or was removed from the queue
/// by [`ThreadPool::clear`] before it ran.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    receiver: Receiver<T>,
    cancellation: Option<CancellationToken>,
}

impl<T> TaskHandle<T> {
    /// Get the unique task ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the task's result is available.
    pub fn is_finished(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Try to get the result without blocking.
    pub fn try_get(&self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait for the task to complete and return its result.
    pub fn wait(self) -> Option<T> {
        self.receiver.recv().ok()
    }

    /// Wait for the task with a timeout.
    ///
    /// Returns `None` if the timeout elapsed or the task never produced a
    /// result.
    pub fn wait_timeout(self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Cancel the task if it has a cancellation token.
    pub fn cancel(&self) {
        if let Some(ref token) = self.cancellation {
            token.cancel();
        }
    }

    /// Get a reference to the cancellation token, if any.
    pub fn cancellation_token(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    priority: TaskPriority,
    run: Job,
}

struct QueuePage {
    priority: TaskPriority,
    tasks: VecDeque<Task>,
}

impl QueuePage {
    fn new(task: Task) -> Self {
        let mut tasks = VecDeque::with_capacity(PAGE_CAPACITY);
        let priority = task.priority;
        tasks.push_back(task);
        Self { priority, tasks }
    }

    fn accepts(&self, priority: TaskPriority) -> bool {
        self.priority == priority && self.tasks.len() < PAGE_CAPACITY
    }
}

/// Pages ordered by descending priority.
#[derive(Default)]
struct TaskQueue {
    pages: VecDeque<QueuePage>,
    len: usize,
}

impl TaskQueue {
    fn push(&mut self, task: Task) {
        self.len += 1;
        let last = self.pages.iter().rposition(|p| p.priority >= task.priority);
        match last {
            Some(i) if self.pages[i].accepts(task.priority) => self.pages[i].tasks.push_back(task),
            Some(i) => self.pages.insert(i + 1, QueuePage::new(task)),
            None => self.pages.push_front(QueuePage::new(task)),
        }
    }

    /// Put a task back at the head of its priority.
    fn push_front(&mut self, task: Task) {
        self.len += 1;
        let first = self.pages.iter().position(|p| p.priority <= task.priority);
        match first {
            Some(i) if self.pages[i].accepts(task.priority) => self.pages[i].tasks.push_front(task),
            Some(i) => self.pages.insert(i, QueuePage::new(task)),
            None => self.pages.push_back(QueuePage::new(task)),
        }
    }

    fn pop(&mut self) -> Option<Task> {
        let page = self.pages.front_mut()?;
        let task = page.tasks.pop_front();
        if page.tasks.is_empty() {
            self.pages.pop_front();
        }
        if task.is_some() {
            self.len -= 1;
        }
        task
    }

    fn take_all(&mut self) -> Vec<Task> {
        self.len = 0;
        self.pages.drain(..).flat_map(|p| p.tasks).collect()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct WorkerThread {
    id: usize,
    ready: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct PoolState {
    queue: TaskQueue,
    all: HashMap<usize, Arc<WorkerThread>>,
    idle: VecDeque<usize>,
    expired: VecDeque<usize>,
    /// Task handed to a worker that is being started.
    handoff: HashMap<usize, Task>,
    /// Threads currently outside their idle wait.
    active: usize,
    reserved: usize,
    max_threads: usize,
    expiry: Option<Duration>,
    exiting: bool,
    next_worker: usize,
}

impl PoolState {
    fn active_thread_count(&self) -> usize {
        let parked = self.expired.len() + self.idle.len();
        self.all.len().saturating_sub(parked) + self.reserved
    }

    fn too_many_active(&self) -> bool {
        let count = self.active_thread_count();
        count > self.max_threads && count.saturating_sub(self.reserved) > 1
    }
}

enum Rejected {
    Busy(Task),
    Spawn(Task, String),
}

struct Shared {
    state: Mutex<PoolState>,
    no_active: Condvar,
    thread_name: String,
    stack_size: Option<usize>,
}

impl Shared {
    fn address(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn register_inactive(&self, state: &mut PoolState) {
        state.active -= 1;
        if state.active == 0 {
            self.no_active.notify_all();
        }
    }

    fn wake(state: &PoolState, id: usize) {
        if let Some(worker) = state.all.get(&id) {
            worker.ready.notify_one();
        }
    }

    fn try_start(self: &Arc<Self>, state: &mut PoolState, task: Task) -> std::result::Result<(), Rejected> {
        if state.all.is_empty() {
            return self.start_thread(state, task);
        }
        if state.active_thread_count() >= state.max_threads {
            return Err(Rejected::Busy(task));
        }
        if let Some(id) = state.idle.pop_front() {
            state.queue.push(task);
            Self::wake(state, id);
            return Ok(());
        }
        if let Some(id) = state.expired.pop_front() {
            return self.resurrect(state, id, task);
        }
        self.start_thread(state, task)
    }

    fn start_thread(self: &Arc<Self>, state: &mut PoolState, task: Task) -> std::result::Result<(), Rejected> {
        let id = state.next_worker;
        state.next_worker += 1;
        let worker = Arc::new(WorkerThread {
            id,
            ready: Condvar::new(),
            handle: Mutex::new(None),
        });
        state.all.insert(id, worker.clone());
        if let Err(e) = self.launch(state, &worker, task) {
            state.all.remove(&id);
            return Err(e);
        }
        tracing::debug!(target: targets::THREADPOOL, worker = id, "pool thread started");
        Ok(())
    }

    fn resurrect(self: &Arc<Self>, state: &mut PoolState, id: usize, task: Task) -> std::result::Result<(), Rejected> {
        let Some(worker) = state.all.get(&id).cloned() else {
            return self.start_thread(state, task);
        };
        // The expired thread released the lock for the last time before it
        // became visible in the expired set.
        if let Some(old) = worker.handle.lock().take() {
            let _ = old.join();
        }
        if let Err(e) = self.launch(state, &worker, task) {
            state.all.remove(&id);
            return Err(e);
        }
        tracing::trace!(target: targets::THREADPOOL, worker = id, "pool thread restarted");
        Ok(())
    }

    fn launch(
        self: &Arc<Self>,
        state: &mut PoolState,
        worker: &Arc<WorkerThread>,
        task: Task,
    ) -> std::result::Result<(), Rejected> {
        let mut builder = std::thread::Builder::new().name(format!("{}-{}", self.thread_name, worker.id));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        state.active += 1;
        state.handoff.insert(worker.id, task);
        let shared = self.clone();
        let me = worker.clone();
        match builder.spawn(move || shared.run_worker(&me)) {
            Ok(handle) => {
                *worker.handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                state.active -= 1;
                let task = state.handoff.remove(&worker.id);
                tracing::error!(target: targets::THREADPOOL, error = %e, "failed to spawn pool thread");
                match task {
                    Some(task) => Err(Rejected::Spawn(task, e.to_string())),
                    None => Ok(()),
                }
            }
        }
    }

    /// Start threads for queued work while capacity allows.
    fn start_more(self: &Arc<Self>, state: &mut PoolState) {
        let mut pending = state.queue.len();
        while pending > 0 && state.active_thread_count() < state.max_threads {
            if let Some(id) = state.idle.pop_front() {
                Self::wake(state, id);
                pending -= 1;
                continue;
            }
            let Some(task) = state.queue.pop() else {
                break;
            };
            let started = match state.expired.pop_front() {
                Some(id) => self.resurrect(state, id, task),
                None => self.start_thread(state, task),
            };
            match started {
                Ok(()) => pending -= 1,
                Err(Rejected::Busy(task)) | Err(Rejected::Spawn(task, _)) => {
                    state.queue.push_front(task);
                    break;
                }
            }
        }
    }

    fn run_worker(self: &Arc<Self>, me: &Arc<WorkerThread>) {
        WORKER_OF.with(|w| w.set(self.address()));
        let mut state = self.state.lock();
        loop {
            let mut task = state.handoff.remove(&me.id);
            loop {
                if let Some(current) = task.take() {
                    MutexGuard::unlocked(&mut state, || run_task(current));
                }
                if state.too_many_active() {
                    break;
                }
                match state.queue.pop() {
                    Some(next) => task = Some(next),
                    None => break,
                }
            }

            if state.exiting {
                self.register_inactive(&mut state);
                break;
            }

            let mut expired = state.too_many_active();
            if !expired {
                state.idle.push_back(me.id);
                self.register_inactive(&mut state);
                // A wake that leaves us in `idle` handed over no work; only an
                // elapsed expiry retires the thread.
                let deadline = state.expiry.map(|timeout| Instant::now() + timeout);
                loop {
                    match deadline {
                        Some(deadline) => {
                            me.ready.wait_until(&mut state, deadline);
                        }
                        None => me.ready.wait(&mut state),
                    }
                    let handed_off = !state.idle.contains(&me.id);
                    let timed_out = deadline.is_some_and(|d| Instant::now() >= d);
                    if handed_off || timed_out || state.exiting || !state.all.contains_key(&me.id) {
                        break;
                    }
                }
                state.active += 1;
                if let Some(pos) = state.idle.iter().position(|&id| id == me.id) {
                    state.idle.remove(pos);
                    expired = true;
                }
                if !state.all.contains_key(&me.id) {
                    self.register_inactive(&mut state);
                    break;
                }
            }
            if expired {
                state.expired.push_back(me.id);
                self.register_inactive(&mut state);
                tracing::trace!(target: targets::THREADPOOL, worker = me.id, "pool thread expired");
                break;
            }
        }
        drop(state);
        WORKER_OF.with(|w| w.set(0));
    }
}

fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task.run)) {
        tracing::error!(
            target: targets::THREADPOOL,
            panic = %panic_message(payload.as_ref()),
            "pool task panicked"
        );
    }
}

/// A pool of worker threads executing submitted tasks.
///
/// Dropping the pool waits for every queued task to finish and joins all
/// threads. Dropping a pool from one of its own worker threads panics.
pub struct ThreadPool {
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Get the global thread pool instance.
    ///
    /// The global pool is lazily initialized with default settings.
    pub fn global() -> &'static ThreadPool {
        GLOBAL_POOL.get_or_init(|| ThreadPool::new(ThreadPoolConfig::default()))
    }

    /// Initialize the global thread pool with custom configuration.
    ///
    /// Returns an error if the pool has already been initialized.
    pub fn init_global(config: ThreadPoolConfig) -> Result<&'static ThreadPool> {
        let mut created = false;
        let pool = GLOBAL_POOL.get_or_init(|| {
            created = true;
            ThreadPool::new(config)
        });
        if created {
            Ok(pool)
        } else {
            Err(ThreadPoolError::AlreadyInitialized.into())
        }
    }

    /// Create a new thread pool. No threads start until work arrives.
    pub fn new(config: ThreadPoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: TaskQueue::default(),
                    all: HashMap::new(),
                    idle: VecDeque::new(),
                    expired: VecDeque::new(),
                    handoff: HashMap::new(),
                    active: 0,
                    reserved: 0,
                    max_threads: config.max_thread_count,
                    expiry: config.expiry_timeout,
                    exiting: false,
                    next_worker: 0,
                }),
                no_active: Condvar::new(),
                thread_name: config.thread_name,
                stack_size: config.stack_size,
            }),
        }
    }

    /// Submit a task, queueing it if no thread is available.
    ///
    /// Fails only if the pool has no threads and a new one cannot be
    /// spawned; the task is dropped in that case.
    pub fn start<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_with_priority(TaskPriority::Normal, task)
    }

    /// Submit a task with a queue priority.
    pub fn start_with_priority<F>(&self, priority: TaskPriority, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task {
            priority,
            run: Box::new(task),
        };
        let mut state = self.shared.state.lock();
        match self.shared.try_start(&mut state, task) {
            Ok(()) => Ok(()),
            Err(Rejected::Busy(task)) => {
                state.queue.push(task);
                if let Some(id) = state.idle.pop_front() {
                    Shared::wake(&state, id);
                }
                Ok(())
            }
            Err(Rejected::Spawn(task, error)) => {
                if state.all.is_empty() {
                    drop(state);
                    drop(task);
                    return Err(ThreadPoolError::SpawnFailed(error).into());
                }
                state.queue.push(task);
                Ok(())
            }
        }
    }

    /// Run a task only if a thread can take it right now.
    ///
    /// Returns `false` without queueing when the pool is at capacity.
    pub fn try_start<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task {
            priority: TaskPriority::Normal,
            run: Box::new(task),
        };
        let mut state = self.shared.state.lock();
        if !state.all.is_empty() && state.active_thread_count() >= state.max_threads {
            return false;
        }
        let rejected = match self.shared.try_start(&mut state, task) {
            Ok(()) => return true,
            Err(rejected) => rejected,
        };
        drop(state);
        drop(rejected);
        false
    }

    /// Spawn a task on the thread pool.
    ///
    /// Returns a handle that can be used to wait for the result.
    pub fn spawn<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_internal(TaskPriority::Normal, task, None)
    }

    /// Spawn a task with priority.
    pub fn spawn_with_priority<F, T>(&self, priority: TaskPriority, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_internal(priority, task, None)
    }

    /// Spawn a task with a cancellation token.
    ///
    /// The task receives a clone of the token and should periodically
    /// check `token.is_cancelled()`.
    pub fn spawn_cancellable<F, T>(&self, task: F) -> (TaskHandle<T>, CancellationToken)
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let token_for_task = token.clone();
        let handle = self.spawn_internal(
            TaskPriority::Normal,
            move || task(token_for_task),
            Some(token.clone()),
        );
        (handle, token)
    }

    fn spawn_internal<F, T>(
        &self,
        priority: TaskPriority,
        task: F,
        cancellation: Option<CancellationToken>,
    ) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = bounded(1);
        let submitted = self.start_with_priority(priority, move || {
            let _ = sender.send(task());
        });
        if let Err(e) = submitted {
            tracing::error!(target: targets::THREADPOOL, task = id, error = %e, "task dropped");
        }
        TaskHandle {
            id,
            receiver,
            cancellation,
        }
    }

    /// Block until the queue is empty and no thread is running a task.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_for_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        while !(state.queue.is_empty() && state.active == 0) {
            match deadline {
                Some(deadline) => {
                    if self.shared.no_active.wait_until(&mut state, deadline).timed_out() {
                        return state.queue.is_empty() && state.active == 0;
                    }
                }
                None => self.shared.no_active.wait(&mut state),
            }
        }
        true
    }

    /// Drain the queue and join every thread.
    ///
    /// The pool stays usable afterwards; threads start again on demand.
    /// Calling this from one of the pool's own threads logs an error and
    /// returns.
    pub fn shutdown(&self) {
        if self.is_own_worker() {
            tracing::error!(target: targets::THREADPOOL, "pool shutdown requested from its own thread");
            return;
        }
        self.wait_for_done(None);

        let mut state = self.shared.state.lock();
        state.exiting = true;
        while !state.all.is_empty() {
            let workers: Vec<_> = state.all.drain().map(|(_, w)| w).collect();
            state.idle.clear();
            state.expired.clear();
            MutexGuard::unlocked(&mut state, || {
                for worker in workers {
                    worker.ready.notify_all();
                    if let Some(handle) = worker.handle.lock().take() {
                        if handle.join().is_err() {
                            tracing::warn!(target: targets::THREADPOOL, worker = worker.id, "pool thread panicked");
                        }
                    }
                }
            });
        }
        state.exiting = false;
        tracing::debug!(target: targets::THREADPOOL, "pool threads joined");
    }

    /// Remove every queued task that has not started.
    ///
    /// Handles of removed tasks yield `None`.
    pub fn clear(&self) -> usize {
        let removed = self.shared.state.lock().queue.take_all();
        removed.len()
    }

    /// Threads currently running tasks, plus reserved threads.
    pub fn active_thread_count(&self) -> usize {
        self.shared.state.lock().active_thread_count()
    }

    /// Number of tasks waiting in the queue.
    pub fn queued_task_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Upper bound on concurrently active threads.
    pub fn max_thread_count(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    /// Change the thread limit. Raising it starts threads for queued work.
    pub fn set_max_thread_count(&self, count: usize) {
        let mut state = self.shared.state.lock();
        state.max_threads = count;
        self.shared.start_more(&mut state);
    }

    /// Idle time before a thread exits.
    pub fn expiry_timeout(&self) -> Option<Duration> {
        self.shared.state.lock().expiry
    }

    /// Change the idle expiry. Threads already waiting keep their old timeout.
    pub fn set_expiry_timeout(&self, timeout: Option<Duration>) {
        self.shared.state.lock().expiry = timeout;
    }

    /// Count one externally used thread against the limit.
    pub fn reserve_thread(&self) {
        self.shared.state.lock().reserved += 1;
    }

    /// Undo a [`reserve_thread`](Self::reserve_thread).
    pub fn release_thread(&self) {
        let mut state = self.shared.state.lock();
        state.reserved = state.reserved.saturating_sub(1);
        self.shared.start_more(&mut state);
    }

    fn is_own_worker(&self) -> bool {
        WORKER_OF.with(|w| w.get()) == self.shared.address()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if self.is_own_worker() {
            panic!("ThreadPool dropped from one of its own worker threads");
        }
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadPool")
            .field("threads", &state.all.len())
            .field("active", &state.active_thread_count())
            .field("queued", &state.queue.len())
            .field("max_threads", &state.max_threads)
            .finish()
    }
}

/// A builder for constructing tasks with various options.
pub struct TaskBuilder<'a> {
    pool: &'a ThreadPool,
    priority: TaskPriority,
    cancellation: Option<CancellationToken>,
}

impl<'a> TaskBuilder<'a> {
    /// Create a new task builder.
    pub fn new(pool: &'a ThreadPool) -> Self {
        Self {
            pool,
            priority: TaskPriority::Normal,
            cancellation: None,
        }
    }

    /// Set the task priority.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a cancellation token for the task.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Spawn the task.
    pub fn spawn<F, T>(self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.pool.spawn_internal(self.priority, task, self.cancellation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicUsize};
    use std::sync::Barrier;

    fn job(priority: TaskPriority, tag: u32, out: &Arc<Mutex<Vec<u32>>>) -> Task {
        let out = out.clone();
        Task {
            priority,
            run: Box::new(move || out.lock().push(tag)),
        }
    }

    #[test]
    fn test_queue_orders_by_priority() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TaskQueue::default();
        queue.push(job(TaskPriority::Low, 1, &out));
        queue.push(job(TaskPriority::High, 2, &out));
        queue.push(job(TaskPriority::Normal, 3, &out));
        queue.push(job(TaskPriority::High, 4, &out));
        queue.push_front(job(TaskPriority::Normal, 5, &out));
        assert_eq!(queue.len(), 5);
        while let Some(task) = queue.pop() {
            (task.run)();
        }
        assert!(queue.is_empty());
        assert_eq!(*out.lock(), vec![2, 4, 5, 3, 1]);
    }

    #[test]
    fn test_queue_pages_fill() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let mut queue = TaskQueue::default();
        for i in 0..(PAGE_CAPACITY as u32 + 10) {
            queue.push(job(TaskPriority::Normal, i, &out));
        }
        assert_eq!(queue.pages.len(), 2);
        let first = queue.pop().map(|t| t.priority);
        assert_eq!(first, Some(TaskPriority::Normal));
        assert_eq!(queue.take_all().len(), PAGE_CAPACITY + 9);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spawn_and_wait() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
        let handle = pool.spawn(|| 42);
        assert_eq!(handle.wait(), Some(42));
    }

    #[test]
    fn test_wait_timeout() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let handle = pool.spawn(|| {
            std::thread::sleep(Duration::from_millis(200));
            42
        });
        let result = handle.wait_timeout(Duration::from_millis(10));
        assert!(result.is_none() || result == Some(42));
    }

    #[test]
    fn test_multiple_tasks() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4));
        let counter = Arc::new(AtomicI32::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let counter = counter.clone();
                pool.spawn(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.wait();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_max_thread_count_respected() {
        const LIMIT: usize = 3;
        const TASKS: usize = 10;

        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(LIMIT));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();

        for i in 0..TASKS {
            let running = running.clone();
            let peak = peak.clone();
            let started = started.clone();
            let release = release_rx.clone();
            pool.start(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                started.lock().push(i);
                let _ = release.recv();
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert!(wait_until(|| running.load(Ordering::SeqCst) == LIMIT));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(running.load(Ordering::SeqCst), LIMIT);
        assert_eq!(pool.queued_task_count(), TASKS - LIMIT);

        // one finished task frees exactly one thread for the next queued one
        for next in LIMIT..TASKS {
            release_tx.send(()).unwrap();
            assert!(wait_until(|| started.lock().len() == next + 1));
        }
        for _ in 0..LIMIT {
            release_tx.send(()).unwrap();
        }

        assert!(pool.wait_for_done(Some(Duration::from_secs(10))));
        assert_eq!(peak.load(Ordering::SeqCst), LIMIT);
        let overflow: Vec<usize> = started.lock()[LIMIT..].to_vec();
        assert_eq!(overflow, (LIMIT..TASKS).collect::<Vec<_>>());
        assert_eq!(pool.active_thread_count(), 0);
    }

    #[test]
    fn test_queued_tasks_run_by_priority() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        pool.start(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        for (priority, tag) in [
            (TaskPriority::Low, "low"),
            (TaskPriority::High, "high"),
            (TaskPriority::Normal, "normal"),
        ] {
            let order = order.clone();
            pool.start_with_priority(priority, move || order.lock().push(tag))
                .unwrap();
        }
        assert_eq!(pool.queued_task_count(), 3);
        gate_tx.send(()).unwrap();

        assert!(pool.wait_for_done(Some(Duration::from_secs(10))));
        assert_eq!(*order.lock(), vec!["high", "normal", "low"]);
    }

    #[test]
    fn test_try_start_refuses_when_full() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        assert!(pool.try_start(move || {
            let _ = gate_rx.recv();
        }));
        assert!(!pool.try_start(|| {}));
        assert_eq!(pool.queued_task_count(), 0);
        gate_tx.send(()).unwrap();
        assert!(pool.wait_for_done(Some(Duration::from_secs(10))));
    }

    #[test]
    fn test_idle_threads_expire_and_restart() {
        let pool = ThreadPool::new(
            ThreadPoolConfig::with_threads(2).expiry_timeout(Some(Duration::from_millis(20))),
        );
        assert_eq!(pool.spawn(|| 1).wait(), Some(1));
        std::thread::sleep(Duration::from_millis(150));
        {
            let state = pool.shared.state.lock();
            assert_eq!(state.expired.len(), 1);
            assert!(state.idle.is_empty());
        }
        assert_eq!(pool.active_thread_count(), 0);

        assert_eq!(pool.spawn(|| 2).wait(), Some(2));
        assert_eq!(pool.shared.state.lock().all.len(), 1);
    }

    #[test]
    fn test_idle_thread_without_expiry_ignores_stray_wake() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1).expiry_timeout(None));
        assert_eq!(pool.spawn(|| 1).wait(), Some(1));
        assert!(wait_until(|| pool.shared.state.lock().idle.len() == 1));

        {
            let state = pool.shared.state.lock();
            let id = state.idle[0];
            Shared::wake(&state, id);
        }
        std::thread::sleep(Duration::from_millis(50));
        {
            let state = pool.shared.state.lock();
            assert_eq!(state.idle.len(), 1);
            assert!(state.expired.is_empty());
        }

        assert_eq!(pool.spawn(|| 2).wait(), Some(2));
        assert_eq!(pool.shared.state.lock().all.len(), 1);
    }

    #[test]
    fn test_idle_thread_reused() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(4).expiry_timeout(None));
        assert_eq!(pool.spawn(|| 1).wait(), Some(1));
        assert!(pool.wait_for_done(Some(Duration::from_secs(10))));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.spawn(|| 2).wait(), Some(2));
        assert_eq!(pool.shared.state.lock().all.len(), 1);
    }

    #[test]
    fn test_reserve_thread_limits_capacity() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
        pool.reserve_thread();
        assert_eq!(pool.active_thread_count(), 1);

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.start(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        let second = pool.spawn(|| "queued");
        assert_eq!(pool.queued_task_count(), 1);

        pool.release_thread();
        assert_eq!(second.wait(), Some("queued"));
        gate_tx.send(()).unwrap();
        assert!(pool.wait_for_done(Some(Duration::from_secs(10))));
    }

    #[test]
    fn test_raising_max_starts_queued_work() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.start(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        let queued = pool.spawn(|| 7);
        assert_eq!(pool.queued_task_count(), 1);

        pool.set_max_thread_count(2);
        assert_eq!(pool.max_thread_count(), 2);
        assert_eq!(queued.wait(), Some(7));
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_clear_drops_queued_tasks() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.start(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        let dropped = pool.spawn(|| 1);
        assert_eq!(pool.clear(), 1);
        gate_tx.send(()).unwrap();
        assert_eq!(dropped.wait(), None);
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let failed = pool.spawn(|| -> i32 { panic!("boom") });
        assert_eq!(failed.wait(), None);
        assert_eq!(pool.spawn(|| 5).wait(), Some(5));
    }

    #[test]
    fn test_wait_for_done_times_out() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.start(move || {
            let _ = gate_rx.recv();
        })
        .unwrap();
        assert!(!pool.wait_for_done(Some(Duration::from_millis(20))));
        gate_tx.send(()).unwrap();
        assert!(pool.wait_for_done(None));
    }

    #[test]
    fn test_shutdown_joins_and_pool_restarts() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(3));
        let barrier = Arc::new(Barrier::new(4));
        for _ in 0..3 {
            let barrier = barrier.clone();
            pool.start(move || {
                barrier.wait();
            })
            .unwrap();
        }
        barrier.wait();
        pool.shutdown();
        assert!(pool.shared.state.lock().all.is_empty());
        assert_eq!(pool.spawn(|| 9).wait(), Some(9));
    }

    #[test]
    fn test_cancellation_token() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
        let (handle, token) = pool.spawn_cancellable(|token| {
            for _ in 0..1000 {
                if token.is_cancelled() {
                    return -1;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            42
        });
        token.cancel();
        assert!(handle.cancellation_token().is_some());
        assert_eq!(handle.wait(), Some(-1));
    }

    #[test]
    fn test_task_builder() {
        let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
        let token = CancellationToken::new();
        let handle = TaskBuilder::new(&pool)
            .priority(TaskPriority::High)
            .cancellation(token.clone())
            .spawn(|| "done");
        handle.cancel();
        assert!(token.is_cancelled());
        assert_eq!(handle.wait(), Some("done"));
    }

    #[test]
    fn test_global_pool() {
        let a = ThreadPool::global();
        let b = ThreadPool::global();
        assert!(std::ptr::eq(a, b));
        assert!(matches!(
            ThreadPool::init_global(ThreadPoolConfig::default()),
            Err(crate::TetherError::ThreadPool(ThreadPoolError::AlreadyInitialized))
        ));
        assert_eq!(a.spawn(|| 3).wait(), Some(3));
    }
}
