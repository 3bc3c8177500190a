//! Dedicated OS threads running an event loop.
//!
//! An [`EventThread`] is the usual target for
//! [`Runtime::move_to_thread`](crate::Runtime::move_to_thread): objects moved
//! there receive their queued calls, posted events and timers on that
//! thread. The loop runs until the thread is asked to exit, then deferred
//! deletes still addressed to it are flushed.
//!
//! # Example
//!
//! ```
//! use tether_core::{EventThread, Runtime};
//!
//! let rt = Runtime::new();
//! let thread = EventThread::builder().name("io").spawn(&rt).unwrap();
//! let obj = rt.create_plain(None).unwrap();
//! rt.move_to_thread(obj, thread.handle()).unwrap();
//!
//! thread.quit();
//! assert_eq!(thread.join(), Some(0));
//! ```

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;

use crate::dispatcher::{EventLoop, ReadinessSource, WakeupSource};
use crate::error::{Result, ThreadPoolError};
use crate::logging::targets;
use crate::runtime::Runtime;
use crate::thread_data::ThreadHandle;

/// Configuration for an [`EventThread`].
#[derive(Clone, Default)]
pub struct EventThreadConfig {
    /// Name for the OS thread.
    pub name: Option<String>,
    /// Stack size in bytes. `None` uses the platform default.
    pub stack_size: Option<usize>,
    /// Readiness source the thread waits on. Defaults to a [`WakeupSource`].
    pub readiness_source: Option<Arc<dyn ReadinessSource>>,
}

impl EventThreadConfig {
    /// Create a configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

impl std::fmt::Debug for EventThreadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThreadConfig")
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .field("custom_source", &self.readiness_source.is_some())
            .finish()
    }
}

/// Builder for [`EventThread`]s.
#[derive(Debug, Default)]
pub struct EventThreadBuilder {
    config: EventThreadConfig,
}

impl EventThreadBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the stack size.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Wait on a custom readiness source instead of the default one.
    pub fn readiness_source(mut self, source: Arc<dyn ReadinessSource>) -> Self {
        self.config.readiness_source = Some(source);
        self
    }

    /// Start the thread.
    pub fn spawn(self, runtime: &Runtime) -> Result<EventThread> {
        EventThread::with_config(runtime, self.config, |_| {})
    }

    /// Start the thread and run `init` on it before the loop starts.
    pub fn spawn_with<F>(self, runtime: &Runtime, init: F) -> Result<EventThread>
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        EventThread::with_config(runtime, self.config, init)
    }
}

/// An OS thread running an event loop.
///
/// Dropping a running `EventThread` asks it to quit and joins it.
pub struct EventThread {
    handle: ThreadHandle,
    join: Option<JoinHandle<i32>>,
}

impl EventThread {
    /// Start an unnamed event thread.
    pub fn spawn(runtime: &Runtime) -> Result<Self> {
        Self::builder().spawn(runtime)
    }

    /// A builder for custom configuration.
    pub fn builder() -> EventThreadBuilder {
        EventThreadBuilder::new()
    }

    /// Start an event thread from `config`, running `init` first.
    pub fn with_config<F>(runtime: &Runtime, config: EventThreadConfig, init: F) -> Result<Self>
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        let mut builder = thread::Builder::new();
        if let Some(name) = config.name.clone() {
            builder = builder.name(name);
        }
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        let (ready_tx, ready_rx) = bounded(1);
        let rt = runtime.clone();
        let name = config.name;
        let source = config
            .readiness_source
            .unwrap_or_else(|| Arc::new(WakeupSource::new()));

        let join = builder
            .spawn(move || {
                let data = rt.adopt_current_thread(name, source);
                let handle = rt.current_thread();
                let event_loop = EventLoop::new(&rt);
                init(&rt);
                if ready_tx.send(handle.clone()).is_err() {
                    return -1;
                }
                drop(ready_tx);

                tracing::debug!(target: targets::RUNTIME, thread = ?data.id, "event thread started");
                event_loop.exec();
                let code = handle.exit_code();
                rt.flush_deferred_deletes();
                tracing::debug!(target: targets::RUNTIME, thread = ?data.id, code, "event thread finished");
                code
            })
            .map_err(|e| ThreadPoolError::SpawnFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(handle) => Ok(Self {
                handle,
                join: Some(join),
            }),
            Err(_) => {
                let reason = match join.join() {
                    Err(payload) => crate::dispatcher::panic_message(payload.as_ref()),
                    Ok(_) => "event thread exited during start-up".to_string(),
                };
                Err(ThreadPoolError::SpawnFailed(reason).into())
            }
        }
    }

    /// Handle to the running thread.
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    /// Whether the thread's loop has finished.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Ask the loop to return `code`.
    pub fn exit(&self, code: i32) {
        self.handle.exit(code);
    }

    /// Ask the loop to return 0.
    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Wait for the thread and return its exit code.
    ///
    /// Returns `None` if the thread panicked.
    pub fn join(mut self) -> Option<i32> {
        self.join.take().and_then(|j| j.join().ok())
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            if self.handle.is_current() {
                return;
            }
            self.handle.quit();
            if join.join().is_err() {
                tracing::error!(target: targets::RUNTIME, thread = ?self.handle.id(), "event thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventThread")
            .field("handle", &self.handle)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionType;
    use crate::meta::OBJECT_NAME_CHANGED_SIGNAL;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_spawn_and_exit_code() {
        let rt = Runtime::new();
        let thread = EventThread::builder().name("loop").spawn(&rt).unwrap();
        assert_eq!(thread.handle().name(), Some("loop"));
        assert!(!thread.handle().is_current());
        thread.exit(3);
        assert_eq!(thread.join(), Some(3));
    }

    #[test]
    fn test_init_runs_on_new_thread() {
        let rt = Runtime::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        let thread = EventThread::builder()
            .spawn_with(&rt, move |_| {
                *seen_in.lock() = Some(thread::current().id());
            })
            .unwrap();
        assert_eq!(*seen.lock(), Some(thread.handle().id()));
    }

    #[test]
    fn test_post_call_runs_on_thread() {
        let rt = Runtime::new();
        let thread = EventThread::spawn(&rt).unwrap();
        let obj = rt.create_plain(None).unwrap();
        rt.move_to_thread(obj, thread.handle()).unwrap();

        let (tx, rx) = bounded(1);
        assert!(rt.post_call(obj, move |ctx| {
            let _ = tx.send((thread::current().id(), ctx.object()));
        }));
        let (ran_on, target) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, thread.handle().id());
        assert_eq!(target, obj);
    }

    #[test]
    fn test_queued_slot_runs_on_thread() {
        let rt = Runtime::new();
        let thread = EventThread::spawn(&rt).unwrap();
        let sender = rt.create_plain(None).unwrap();
        let receiver = rt.create_plain(None).unwrap();
        rt.move_to_thread(receiver, thread.handle()).unwrap();

        let (tx, rx) = bounded(4);
        rt.connect_fn(
            sender,
            OBJECT_NAME_CHANGED_SIGNAL,
            Some(receiver),
            ConnectionType::Auto,
            move |_, args| {
                let name = args[0].downcast_ref::<String>().cloned();
                let _ = tx.send((thread::current().id(), name));
            },
        )
        .unwrap();

        rt.set_object_name(sender, "hello");
        let (ran_on, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, thread.handle().id());
        assert_eq!(name.as_deref(), Some("hello"));
    }

    #[test]
    fn test_deferred_deletes_flushed_on_exit() {
        let rt = Runtime::new();
        let thread = EventThread::spawn(&rt).unwrap();
        let obj = rt.create_plain(None).unwrap();
        rt.move_to_thread(obj, thread.handle()).unwrap();

        let (tx, rx) = bounded(1);
        rt.post_call(obj, move |ctx| {
            ctx.delete_later();
            ctx.runtime().current_thread().quit();
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(thread.join(), Some(0));
        assert!(!rt.contains(obj));
    }

    #[test]
    fn test_drop_quits_thread() {
        let rt = Runtime::new();
        let handle = {
            let thread = EventThread::spawn(&rt).unwrap();
            thread.handle().clone()
        };
        assert!(handle.is_finished());
    }
}
