//! Per-thread event dispatch.
//!
//! Each thread drains its own [`PostEventList`](crate::queue) through
//! [`Runtime::send_posted_events`], blocks in its [`ReadinessSource`] when
//! there is nothing to do, and fires expired timers and ready socket
//! notifiers. [`EventLoop::exec`] repeats that until the loop is exited; loops
//! nest, and each running loop raises the thread's loop level.
//!
//! # Deferred deletion
//!
//! A [`Event::DeferredDelete`] records the loop plus scope level of the frame
//! that posted it. A dispatch pass only executes it once that frame has
//! unwound, that is when the current level has dropped below the recorded one,
//! or when it was posted outside any loop and a loop is now running. Passes
//! that explicitly ask for deferred deletes also execute those recorded at the
//! current level. Everything else is re-posted behind the current window.
//!
//! # Example
//!
//! ```
//! use tether_core::{EventLoop, Runtime};
//!
//! let rt = Runtime::new();
//! let obj = rt.create_plain(None).unwrap();
//! let event_loop = EventLoop::new(&rt);
//! let handle = event_loop.clone();
//! rt.post_call(obj, move |_ctx| handle.exit(7));
//! assert_eq!(event_loop.exec(), 7);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::event::{Event, EventKind, EventPriority};
use crate::logging::targets;
use crate::meta::Context;
use crate::object::{ObjectError, ObjectId, ObjectNode};
use crate::runtime::Runtime;
use crate::thread_check::require_thread;
use crate::thread_data::{ScopeLevel, ThreadData};

/// An I/O handle watched by a [`ReadinessSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(pub i64);

/// The platform wait primitive a dispatcher blocks on.
///
/// Implementations multiplex registered descriptors (poll, epoll, kqueue, ...)
/// and must return promptly from [`wait`](Self::wait) when
/// [`wake`](Self::wake) is called from any thread, including a wake that
/// arrives before the wait starts.
pub trait ReadinessSource: Send + Sync {
    /// Block until a descriptor is ready, a wake arrives or `timeout` passes.
    ///
    /// `None` waits indefinitely; a zero timeout polls.
    fn wait(&self, timeout: Option<Duration>) -> Vec<Descriptor>;

    /// Wake a current or upcoming [`wait`](Self::wait).
    fn wake(&self);

    /// Start watching `descriptor`.
    fn register(&self, _descriptor: Descriptor) {}

    /// Stop watching `descriptor`.
    fn unregister(&self, _descriptor: Descriptor) {}
}

#[derive(Debug, Default)]
struct WakeState {
    woken: bool,
    ready: Vec<Descriptor>,
    registered: HashSet<Descriptor>,
}

/// The default readiness source: a condition variable.
///
/// It has no OS descriptors of its own; readiness is reported by calling
/// [`mark_ready`](Self::mark_ready), which makes it usable for tests and for
/// integrating external pollers.
#[derive(Debug, Default)]
pub struct WakeupSource {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeupSource {
    /// Create an idle source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `descriptor` as ready. Ignored unless it is registered.
    pub fn mark_ready(&self, descriptor: Descriptor) -> bool {
        let mut state = self.state.lock();
        if !state.registered.contains(&descriptor) {
            return false;
        }
        if !state.ready.contains(&descriptor) {
            state.ready.push(descriptor);
        }
        self.cond.notify_all();
        true
    }

    /// Whether `descriptor` is registered.
    pub fn is_registered(&self, descriptor: Descriptor) -> bool {
        self.state.lock().registered.contains(&descriptor)
    }
}

impl ReadinessSource for WakeupSource {
    fn wait(&self, timeout: Option<Duration>) -> Vec<Descriptor> {
        let mut state = self.state.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !state.woken && state.ready.is_empty() {
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        state.woken = false;
        std::mem::take(&mut state.ready)
    }

    fn wake(&self) {
        self.state.lock().woken = true;
        self.cond.notify_all();
    }

    fn register(&self, descriptor: Descriptor) {
        self.state.lock().registered.insert(descriptor);
    }

    fn unregister(&self, descriptor: Descriptor) {
        let mut state = self.state.lock();
        state.registered.remove(&descriptor);
        state.ready.retain(|d| *d != descriptor);
    }
}

/// Flags controlling one [`Runtime::process_events`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessEventsFlags(u8);

impl ProcessEventsFlags {
    /// Process everything, do not block.
    pub const ALL_EVENTS: Self = Self(0);
    /// Block until something arrives when nothing is pending.
    pub const WAIT_FOR_MORE_EVENTS: Self = Self(1);
    /// Do not deliver socket readiness.
    pub const EXCLUDE_SOCKET_NOTIFIERS: Self = Self(1 << 1);
    /// Do not fire timers.
    pub const EXCLUDE_TIMERS: Self = Self(1 << 2);

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ProcessEventsFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// State of one event loop, shared with the thread's loop stack.
#[derive(Debug)]
pub(crate) struct LoopState {
    exit: AtomicBool,
    code: AtomicI32,
    running: AtomicBool,
    thread: Weak<ThreadData>,
}

impl LoopState {
    pub(crate) fn request_exit(&self, code: i32) {
        self.code.store(code, Ordering::Release);
        self.exit.store(true, Ordering::Release);
    }
}

/// A nestable event loop bound to the thread that created it.
///
/// Clones share the same loop, so a clone can be moved into a slot or another
/// thread to exit it.
#[derive(Clone)]
pub struct EventLoop {
    runtime: Runtime,
    state: Arc<LoopState>,
}

impl EventLoop {
    /// Create a loop for the calling thread.
    pub fn new(runtime: &Runtime) -> Self {
        let data = runtime.current_thread_data();
        Self {
            runtime: runtime.clone(),
            state: Arc::new(LoopState {
                exit: AtomicBool::new(false),
                code: AtomicI32::new(0),
                running: AtomicBool::new(false),
                thread: Arc::downgrade(&data),
            }),
        }
    }

    /// Run until [`exit`](Self::exit) is called; returns the exit code.
    pub fn exec(&self) -> i32 {
        self.exec_with(ProcessEventsFlags::ALL_EVENTS)
    }

    /// Run with extra flags for every pass.
    ///
    /// Returns -1 when called on the wrong thread, while already running, or
    /// after the thread was asked to exit.
    pub fn exec_with(&self, flags: ProcessEventsFlags) -> i32 {
        let Some(data) = self.state.thread.upgrade() else {
            return -1;
        };
        if !data.is_current() {
            tracing::warn!(target: targets::EVENT, "EventLoop::exec called off its thread");
            return -1;
        }
        if self.state.running.swap(true, Ordering::AcqRel) {
            tracing::warn!(target: targets::EVENT, "EventLoop::exec called on a running loop");
            return -1;
        }
        if data.exit_requested() {
            self.state.running.store(false, Ordering::Release);
            return -1;
        }

        self.state.exit.store(false, Ordering::Release);
        data.loops.lock().push(self.state.clone());
        let level = data.loop_level.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(target: targets::EVENT, level, "event loop entered");

        while !self.state.exit.load(Ordering::Acquire) {
            self.runtime
                .process_events(flags | ProcessEventsFlags::WAIT_FOR_MORE_EVENTS, None);
        }

        data.loop_level.fetch_sub(1, Ordering::AcqRel);
        data.loops
            .lock()
            .retain(|state| !Arc::ptr_eq(state, &self.state));
        self.state.running.store(false, Ordering::Release);
        let code = self.state.code.load(Ordering::Acquire);
        tracing::trace!(target: targets::EVENT, level, code, "event loop left");
        code
    }

    /// Ask the loop to return `code`. Callable from any thread.
    pub fn exit(&self, code: i32) {
        self.state.request_exit(code);
        if let Some(data) = self.state.thread.upgrade() {
            data.interrupt();
        }
    }

    /// Exit with code 0.
    pub fn quit(&self) {
        self.exit(0);
    }

    /// Whether [`exec`](Self::exec) is on the stack.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Run a single pass on the loop's thread.
    pub fn process_events(&self, flags: ProcessEventsFlags) -> bool {
        self.runtime.process_events(flags, None)
    }

    /// Wake the loop's thread.
    pub fn wake_up(&self) {
        if let Some(data) = self.state.thread.upgrade() {
            data.wake();
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Whether a deferred delete recorded at `stored` may run at level `current`.
fn deferred_delete_allowed(stored: u32, current: u32, explicit: bool) -> bool {
    stored > current || (stored == 0 && current > 0) || (explicit && stored == current)
}

impl Runtime {
    /// Queue `event` for `receiver` on the receiver's thread.
    ///
    /// Returns `false` when the receiver is gone, its thread has exited, or
    /// the event was compressed into one already pending.
    pub fn post_event(&self, receiver: ObjectId, event: Event, priority: EventPriority) -> bool {
        let Some(node) = self.node(receiver) else {
            tracing::debug!(target: targets::EVENT, ?receiver, kind = ?event.kind(), "post to unknown receiver dropped");
            return false;
        };
        self.post_to_node(&node, event, priority)
    }

    pub(crate) fn post_to_node(
        &self,
        node: &Arc<ObjectNode>,
        mut event: Event,
        priority: EventPriority,
    ) -> bool {
        let current = std::thread::current().id();
        loop {
            let data = node.thread_data();
            let mut queue = data.queue.lock();
            if !Arc::ptr_eq(&data, &node.thread_data()) {
                // Migrated between reading the affinity and locking.
                continue;
            }
            if data.is_finished() {
                drop(queue);
                tracing::debug!(target: targets::EVENT, receiver = ?node.id, kind = ?event.kind(), "post to finished thread dropped");
                return false;
            }
            if event.is_compressible() && queue.has_pending(node.id, event.kind()) {
                drop(queue);
                tracing::trace!(target: targets::EVENT, receiver = ?node.id, kind = ?event.kind(), "event compressed");
                return false;
            }
            if let Event::DeferredDelete { level } = &mut event {
                *level = if data.id == current {
                    let loop_level = data.loop_level.load(Ordering::Acquire);
                    let mut scope_level = data.scope_level.load(Ordering::Acquire);
                    if scope_level == 0 && loop_level != 0 {
                        scope_level = 1;
                    }
                    loop_level + scope_level
                } else {
                    0
                };
            }
            node.posted_events.fetch_add(1, Ordering::AcqRel);
            queue.add(node.id, event, priority);
            queue.can_wait = false;
            drop(queue);
            data.wake();
            return true;
        }
    }

    /// Deliver `event` to `receiver` synchronously.
    ///
    /// Must run on the receiver's thread. Returns whether the receiver
    /// handled the event.
    pub fn send_event(&self, receiver: ObjectId, event: Event) -> Result<bool> {
        let node = self.node(receiver).ok_or(ObjectError::InvalidObjectId)?;
        let data = node.thread_data();
        require_thread("send_event", data.id)?;
        Ok(self.deliver(&data, &node, event))
    }

    /// Deliver with the scope level raised and panics contained.
    pub(crate) fn deliver(&self, data: &ThreadData, node: &Arc<ObjectNode>, event: Event) -> bool {
        let _scope = ScopeLevel::enter(data);
        let kind = event.kind();
        match panic::catch_unwind(AssertUnwindSafe(|| self.notify(node, event))) {
            Ok(handled) => handled,
            Err(payload) => {
                tracing::error!(
                    target: targets::EVENT,
                    receiver = ?node.id,
                    ?kind,
                    panic = panic_message(&payload),
                    "event handler panicked"
                );
                false
            }
        }
    }

    fn notify(&self, node: &Arc<ObjectNode>, event: Event) -> bool {
        let ctx = Context::new(self.clone(), node.id, None);
        match event {
            Event::MetaCall(call) => {
                self.deliver_meta_call(node, call);
                true
            }
            Event::Call(call) => {
                call(&ctx);
                true
            }
            Event::DeferredDelete { .. } => {
                if let Err(err) = self.destroy(node.id) {
                    tracing::warn!(target: targets::OBJECT, object = ?node.id, %err, "deferred delete failed");
                }
                true
            }
            mut event => {
                if node.instance.event(&ctx, &mut event) {
                    return true;
                }
                if matches!(event, Event::Quit) {
                    let data = node.thread_data();
                    let innermost = data.loops.lock().last().cloned();
                    if let Some(state) = innermost {
                        state.request_exit(0);
                        data.interrupt();
                    }
                    return true;
                }
                false
            }
        }
    }

    /// Deliver pending events posted to the calling thread.
    ///
    /// With a `receiver` or `kind` filter, only matching events are delivered
    /// and the rest stay queued in order.
    #[tracing::instrument(level = "trace", target = "tether_core::event", skip_all)]
    pub fn send_posted_events(&self, receiver: Option<ObjectId>, kind: Option<EventKind>) {
        let data = self.current_thread_data();
        if let Some(receiver) = receiver {
            match self.node(receiver) {
                Some(node) if Arc::ptr_eq(&node.thread_data(), &data) => {}
                Some(_) => {
                    tracing::warn!(target: targets::EVENT, ?receiver, "send_posted_events for an object of another thread");
                    return;
                }
                None => return,
            }
        }
        self.send_posted_events_on(&data, receiver, kind);
    }

    fn send_posted_events_on(
        &self,
        data: &Arc<ThreadData>,
        receiver: Option<ObjectId>,
        kind: Option<EventKind>,
    ) {
        let unfiltered = receiver.is_none() && kind.is_none();
        let explicit_delete = kind == Some(EventKind::DeferredDelete);

        let mut queue = data.queue.lock();
        if queue.len() == 0 {
            queue.can_wait = true;
            if queue.recursion == 0 {
                queue.close_window();
            }
            return;
        }
        queue.recursion += 1;
        queue.can_wait = true;
        let mut local_cursor = queue.start_offset;
        let enclosing_window = queue.insertion_offset;
        queue.insertion_offset = queue.len();

        loop {
            let index = if unfiltered {
                queue.start_offset
            } else {
                local_cursor
            };
            if index >= queue.len() || index >= queue.insertion_offset {
                break;
            }
            if unfiltered {
                queue.start_offset += 1;
            } else {
                local_cursor += 1;
            }

            let Some((target, Some(event_kind))) = queue.receiver_at(index) else {
                continue;
            };
            if receiver.is_some_and(|r| r != target) || kind.is_some_and(|k| k != event_kind) {
                queue.can_wait = false;
                continue;
            }

            if let Some(stored) = queue.deferred_level_at(index) {
                if !deferred_delete_allowed(stored, data.current_level(), explicit_delete) {
                    if unfiltered {
                        queue.repost(index);
                    }
                    continue;
                }
            }

            let Some((target, event)) = queue.take(index) else {
                continue;
            };
            let node = self.node(target);
            if let Some(node) = &node {
                node.posted_events.fetch_sub(1, Ordering::AcqRel);
            }
            drop(queue);

            match node {
                Some(node) => {
                    self.deliver(data, &node, event);
                }
                None => {
                    tracing::trace!(target: targets::EVENT, receiver = ?target, "event for destroyed receiver dropped");
                    drop(event);
                }
            }
            queue = data.queue.lock();
        }

        queue.recursion -= 1;
        if queue.recursion == 0 {
            if unfiltered {
                queue.compact();
            }
            queue.close_window();
        } else {
            queue.insertion_offset = enclosing_window;
        }
        let wake = queue.recursion == 0 && !queue.can_wait;
        drop(queue);
        if wake {
            data.wake();
        }
    }

    /// Run one dispatch pass on the calling thread.
    ///
    /// Delivers posted events, then waits for readiness (blocking only with
    /// [`ProcessEventsFlags::WAIT_FOR_MORE_EVENTS`] and nothing pending, and
    /// never past `deadline` or the next timer), then delivers socket
    /// activations and fires expired timers. Returns whether any work was
    /// done.
    pub fn process_events(&self, flags: ProcessEventsFlags, deadline: Option<Instant>) -> bool {
        let data = self.current_thread_data();
        data.interrupt.store(false, Ordering::Release);

        let mut did_work = data.queue.lock().pending() > 0;
        self.send_posted_events_on(&data, None, None);
        if data.interrupt.load(Ordering::Acquire) {
            return did_work;
        }

        let use_timers = !flags.contains(ProcessEventsFlags::EXCLUDE_TIMERS);
        let can_wait = flags.contains(ProcessEventsFlags::WAIT_FOR_MORE_EVENTS)
            && data.queue.lock().can_wait
            && !data.interrupt.load(Ordering::Acquire);

        let timeout = if can_wait {
            let now = Instant::now();
            let timer_deadline = if use_timers {
                data.timers.lock().next_deadline()
            } else {
                None
            };
            match (timer_deadline, deadline) {
                (Some(a), Some(b)) => Some(a.min(b).saturating_duration_since(now)),
                (Some(a), None) | (None, Some(a)) => Some(a.saturating_duration_since(now)),
                (None, None) => None,
            }
        } else {
            Some(Duration::ZERO)
        };

        let ready = data.source.wait(timeout);
        if data.interrupt.load(Ordering::Acquire) {
            return did_work;
        }

        if !flags.contains(ProcessEventsFlags::EXCLUDE_SOCKET_NOTIFIERS) {
            for descriptor in ready {
                let object = data.notifiers.lock().get(&descriptor).copied();
                let Some(object) = object else {
                    continue;
                };
                if let Some(node) = self.node(object) {
                    did_work = true;
                    self.deliver(&data, &node, Event::SocketActivated { descriptor });
                }
            }
        }

        if use_timers {
            let expired = data.timers.lock().take_expired(Instant::now());
            for (id, object) in expired {
                if let Some(node) = self.node(object) {
                    did_work = true;
                    self.deliver(&data, &node, Event::Timer { id });
                }
            }
        }
        did_work
    }

    /// Whether the calling thread has events waiting.
    pub fn has_pending_events(&self) -> bool {
        self.current_thread_data().queue.lock().pending() > 0
    }

    /// Drop pending events for `receiver`, optionally only those of `kind`.
    ///
    /// Returns how many were removed.
    pub fn remove_posted_events(&self, receiver: ObjectId, kind: Option<EventKind>) -> usize {
        let Some(node) = self.node(receiver) else {
            return 0;
        };
        self.remove_posted_events_for(&node, kind)
    }

    pub(crate) fn remove_posted_events_for(
        &self,
        node: &Arc<ObjectNode>,
        kind: Option<EventKind>,
    ) -> usize {
        if node.posted_events.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let removed = loop {
            let data = node.thread_data();
            let mut queue = data.queue.lock();
            if !Arc::ptr_eq(&data, &node.thread_data()) {
                continue;
            }
            let removed =
                queue.remove_matching(|r, k| r == node.id && kind.is_none_or(|want| want == k));
            node.posted_events
                .fetch_sub(removed.len(), Ordering::AcqRel);
            break removed;
        };
        // Released outside the queue lock; blocking calls wake their emitter here.
        let count = removed.len();
        drop(removed);
        count
    }

    /// Queue `f` to run on `object`'s thread.
    pub fn post_call<F>(&self, object: ObjectId, f: F) -> bool
    where
        F: FnOnce(&Context) + Send + 'static,
    {
        self.post_event(object, Event::Call(Box::new(f)), EventPriority::Normal)
    }

    /// Schedule `object` for destruction once the current frame unwinds.
    pub fn delete_later(&self, object: ObjectId) -> bool {
        let Some(node) = self.node(object) else {
            return false;
        };
        node.delete_later_called.store(true, Ordering::Release);
        self.post_to_node(&node, Event::deferred_delete(), EventPriority::Normal)
    }

    /// Watch `descriptor` on `object`'s thread; readiness is delivered as
    /// [`Event::SocketActivated`].
    pub fn register_notifier(&self, object: ObjectId, descriptor: Descriptor) -> Result<()> {
        let node = self.node(object).ok_or(ObjectError::InvalidObjectId)?;
        let data = node.thread_data();
        require_thread("register_notifier", data.id)?;
        data.notifiers.lock().insert(descriptor, object);
        data.source.register(descriptor);
        tracing::trace!(target: targets::EVENT, ?object, ?descriptor, "notifier registered");
        Ok(())
    }

    /// Stop watching `descriptor`. Returns whether it was registered to
    /// `object`.
    pub fn unregister_notifier(&self, object: ObjectId, descriptor: Descriptor) -> Result<bool> {
        let node = self.node(object).ok_or(ObjectError::InvalidObjectId)?;
        let data = node.thread_data();
        require_thread("unregister_notifier", data.id)?;
        let mut notifiers = data.notifiers.lock();
        if notifiers.get(&descriptor) != Some(&object) {
            return Ok(false);
        }
        notifiers.remove(&descriptor);
        drop(notifiers);
        data.source.unregister(descriptor);
        Ok(true)
    }

    /// Drop every notifier owned by `object` on `data`'s thread.
    pub(crate) fn unregister_notifiers_of(&self, data: &ThreadData, object: ObjectId) {
        let removed: Vec<Descriptor> = {
            let mut notifiers = data.notifiers.lock();
            let removed = notifiers
                .iter()
                .filter(|(_, owner)| **owner == object)
                .map(|(d, _)| *d)
                .collect::<Vec<_>>();
            for d in &removed {
                notifiers.remove(d);
            }
            removed
        };
        for descriptor in removed {
            data.source.unregister(descriptor);
        }
    }

    /// Flush deferred deletes on the calling thread before it exits.
    pub(crate) fn flush_deferred_deletes(&self) {
        self.send_posted_events(None, Some(EventKind::DeferredDelete));
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}
