//! Per-thread runtime state and the thread-affinity table.
//!
//! Every thread that owns objects has one [`ThreadData`] per runtime: its
//! posted-event queue, loop and scope level counters, the stack of running
//! event loops, timers, socket notifiers and the readiness source the
//! dispatcher blocks on. Threads are adopted lazily the first time they touch
//! the runtime, and marked finished when the OS thread exits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::dispatcher::{Descriptor, LoopState, ReadinessSource, WakeupSource};
use crate::logging::targets;
use crate::object::ObjectId;
use crate::queue::PostEventList;
use crate::runtime::{Runtime, RuntimeInner};
use crate::timer::TimerManager;

/// Runtime state owned by one thread.
pub(crate) struct ThreadData {
    pub(crate) id: ThreadId,
    pub(crate) name: Option<String>,
    pub(crate) queue: Mutex<PostEventList>,
    /// Number of event loops running on this thread.
    pub(crate) loop_level: AtomicU32,
    /// Number of synchronous deliveries on the stack.
    pub(crate) scope_level: AtomicU32,
    pub(crate) interrupt: AtomicBool,
    exit_requested: AtomicBool,
    exit_code: AtomicI32,
    pub(crate) loops: Mutex<Vec<Arc<LoopState>>>,
    pub(crate) timers: Mutex<TimerManager>,
    pub(crate) notifiers: Mutex<HashMap<Descriptor, ObjectId>>,
    pub(crate) source: Arc<dyn ReadinessSource>,
    finished: AtomicBool,
}

impl ThreadData {
    pub(crate) fn new(
        id: ThreadId,
        name: Option<String>,
        source: Arc<dyn ReadinessSource>,
    ) -> Self {
        Self {
            id,
            name,
            queue: Mutex::new(PostEventList::new()),
            loop_level: AtomicU32::new(0),
            scope_level: AtomicU32::new(0),
            interrupt: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            exit_code: AtomicI32::new(0),
            loops: Mutex::new(Vec::new()),
            timers: Mutex::new(TimerManager::new()),
            notifiers: Mutex::new(HashMap::new()),
            source,
            finished: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_current(&self) -> bool {
        std::thread::current().id() == self.id
    }

    /// Loop plus scope level, the reference for deferred deletes.
    pub(crate) fn current_level(&self) -> u32 {
        self.loop_level.load(Ordering::Acquire) + self.scope_level.load(Ordering::Acquire)
    }

    pub(crate) fn wake(&self) {
        self.source.wake();
    }

    /// Make the current or next wait return without handling more work.
    pub(crate) fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
        self.source.wake();
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub(crate) fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Exit every loop running on this thread and refuse new ones.
    pub(crate) fn exit(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
        self.exit_requested.store(true, Ordering::Release);
        for state in self.loops.lock().iter() {
            state.request_exit(code);
        }
        self.interrupt();
    }

    /// Clear a previous exit request so loops can start again.
    pub(crate) fn reset_exit(&self) {
        self.exit_requested.store(false, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ThreadData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("loop_level", &self.loop_level.load(Ordering::Relaxed))
            .field("scope_level", &self.scope_level.load(Ordering::Relaxed))
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Increments the scope level for the duration of a synchronous delivery.
pub(crate) struct ScopeLevel<'a>(&'a ThreadData);

impl<'a> ScopeLevel<'a> {
    pub(crate) fn enter(data: &'a ThreadData) -> Self {
        data.scope_level.fetch_add(1, Ordering::AcqRel);
        Self(data)
    }
}

impl Drop for ScopeLevel<'_> {
    fn drop(&mut self) {
        self.0.scope_level.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Marks an adopted thread finished when the OS thread exits.
struct AdoptionGuard {
    runtime: Weak<RuntimeInner>,
    data: Arc<ThreadData>,
}

impl Drop for AdoptionGuard {
    fn drop(&mut self) {
        self.data.finish();
        if let Some(inner) = self.runtime.upgrade() {
            let mut threads = inner.threads.write();
            if threads
                .get(&self.data.id)
                .is_some_and(|d| Arc::ptr_eq(d, &self.data))
            {
                threads.remove(&self.data.id);
            }
        }
    }
}

thread_local! {
    static ADOPTED: RefCell<Vec<AdoptionGuard>> = const { RefCell::new(Vec::new()) };
}

impl Runtime {
    /// State of the calling thread, adopting it on first use.
    pub(crate) fn current_thread_data(&self) -> Arc<ThreadData> {
        let id = std::thread::current().id();
        if let Some(data) = self.inner.threads.read().get(&id) {
            return data.clone();
        }
        self.adopt_current_thread(None, Arc::new(WakeupSource::new()))
    }

    /// Adopt the calling thread with a specific readiness source.
    ///
    /// Returns the existing state if the thread is already known.
    pub(crate) fn adopt_current_thread(
        &self,
        name: Option<String>,
        source: Arc<dyn ReadinessSource>,
    ) -> Arc<ThreadData> {
        let current = std::thread::current();
        let data = {
            let mut threads = self.inner.threads.write();
            if let Some(existing) = threads.get(&current.id()) {
                return existing.clone();
            }
            let name = name.or_else(|| current.name().map(str::to_owned));
            let data = Arc::new(ThreadData::new(current.id(), name, source));
            threads.insert(current.id(), data.clone());
            data
        };

        let guard = AdoptionGuard {
            runtime: Arc::downgrade(&self.inner),
            data: data.clone(),
        };
        // Fails only while thread-locals are being torn down.
        let _ = ADOPTED.try_with(|adopted| {
            let mut adopted = adopted.borrow_mut();
            adopted.retain(|g| g.runtime.strong_count() > 0);
            adopted.push(guard);
        });
        tracing::debug!(
            target: targets::RUNTIME,
            thread = ?data.id,
            name = ?data.name,
            "thread adopted"
        );
        data
    }

    /// Handle to the calling thread.
    pub fn current_thread(&self) -> ThreadHandle {
        ThreadHandle {
            data: self.current_thread_data(),
        }
    }

    /// Handle to the thread `object` lives in.
    pub fn thread_of(&self, object: ObjectId) -> Option<ThreadHandle> {
        self.node(object).map(|node| ThreadHandle {
            data: node.thread_data(),
        })
    }

    /// Number of threads currently known to the runtime.
    pub fn thread_count(&self) -> usize {
        self.inner.threads.read().len()
    }
}

/// A handle to a thread known to the runtime.
///
/// Handles stay valid after the thread exits; they then report
/// [`is_finished`](Self::is_finished).
#[derive(Clone)]
pub struct ThreadHandle {
    pub(crate) data: Arc<ThreadData>,
}

impl ThreadHandle {
    /// The OS thread id.
    pub fn id(&self) -> ThreadId {
        self.data.id
    }

    /// The thread name, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.data.name.as_deref()
    }

    /// Whether this handle refers to the calling thread.
    pub fn is_current(&self) -> bool {
        self.data.is_current()
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.data.is_finished()
    }

    /// Number of event loops currently running on the thread.
    pub fn loop_level(&self) -> u32 {
        self.data.loop_level.load(Ordering::Acquire)
    }

    /// Events waiting in the thread's queue.
    pub fn pending_events(&self) -> usize {
        self.data.queue.lock().pending()
    }

    /// Exit every event loop on the thread with `code`.
    pub fn exit(&self, code: i32) {
        tracing::debug!(target: targets::RUNTIME, thread = ?self.data.id, code, "thread exit requested");
        self.data.exit(code);
    }

    /// Exit every event loop on the thread with code 0.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// The code passed to the last [`exit`](Self::exit).
    pub fn exit_code(&self) -> i32 {
        self.data.exit_code()
    }

    /// Make the thread's current wait return immediately.
    pub fn interrupt(&self) {
        self.data.interrupt();
    }

    /// Wake the thread if it is blocked waiting for events.
    pub fn wake(&self) {
        self.data.wake();
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.data.id)
            .field("name", &self.data.name)
            .finish()
    }
}
