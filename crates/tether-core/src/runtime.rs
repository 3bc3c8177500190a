//! The runtime context handle.
//!
//! A [`Runtime`] owns every process-wide service the object model needs:
//! the type registry, the table of known threads, the object arena, the
//! mutex pool guarding connection lists and a lazily started worker pool.
//! Handles are cheap to clone and all clones share the same state.
//!
//! Most programs use the lazily created [`Runtime::global`] instance.
//! Tests and embedders can create independent runtimes with
//! [`Runtime::new`] and tear them down with [`Runtime::shutdown`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::error::{Result, TetherError};
use crate::logging::targets;
use crate::object::ObjectRegistry;
use crate::pool_lock::MutexPool;
use crate::thread_data::ThreadData;
use crate::threadpool::ThreadPool;
use crate::types::TypeRegistry;

/// Global runtime instance.
static GLOBAL: OnceLock<Runtime> = OnceLock::new();

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) types: TypeRegistry,
    pub(crate) objects: RwLock<ObjectRegistry>,
    pub(crate) threads: RwLock<HashMap<ThreadId, Arc<ThreadData>>>,
    pub(crate) pool: MutexPool,
    workers: OnceLock<ThreadPool>,
    shut_down: AtomicBool,
}

/// Shared handle to the object runtime.
///
/// # Example
///
/// ```
/// use tether_core::Runtime;
///
/// let rt = Runtime::new();
/// let root = rt.create_plain(None).unwrap();
/// rt.set_object_name(root, "root");
/// assert_eq!(rt.object_name(root).as_deref(), Some("root"));
/// rt.shutdown();
/// ```
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create an independent runtime with default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create an independent runtime.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let pool = MutexPool::new(config.mutex_pool_size);
        tracing::debug!(
            target: targets::RUNTIME,
            mutex_pool = pool.len(),
            max_threads = config.thread_pool.max_thread_count,
            "runtime created"
        );
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                types: TypeRegistry::new(),
                objects: RwLock::new(ObjectRegistry::new()),
                threads: RwLock::new(HashMap::new()),
                pool,
                workers: OnceLock::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The process-wide runtime, created on first use.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(Runtime::new)
    }

    /// The global runtime if it has been created.
    pub fn try_global() -> Option<&'static Runtime> {
        GLOBAL.get()
    }

    /// Configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The type registry.
    pub fn types(&self) -> &TypeRegistry {
        &self.inner.types
    }

    /// The runtime's worker pool, started on first use.
    pub fn thread_pool(&self) -> &ThreadPool {
        self.inner
            .workers
            .get_or_init(|| ThreadPool::new(self.inner.config.thread_pool.clone()))
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(TetherError::RuntimeShutDown);
        }
        Ok(())
    }

    /// Whether two handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Tear the runtime down.
    ///
    /// Refuses new objects, destroys every root object owned by the calling
    /// thread or by a thread that has exited, waits for the worker pool to
    /// drain and clears user-registered types. Objects still owned by live
    /// threads are left for those threads to destroy. Calling this more than
    /// once has no further effect.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(target: targets::RUNTIME, "runtime shutting down");

        let mut skipped = 0usize;
        for root in self.root_objects() {
            let Some(node) = self.node(root) else {
                continue;
            };
            let data = node.thread_data();
            if data.is_current() || data.is_finished() {
                self.destroy_node(&node);
            } else {
                skipped += 1;
            }
        }
        if skipped > 0 {
            tracing::warn!(
                target: targets::RUNTIME,
                skipped,
                "objects owned by running threads survive shutdown"
            );
        }

        if let Some(pool) = self.inner.workers.get() {
            pool.shutdown();
        }
        self.inner.types.clear_user_types();
        tracing::debug!(target: targets::RUNTIME, "runtime shut down");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("objects", &self.inner.objects.read().len())
            .field("threads", &self.inner.threads.read().len())
            .field("mutex_pool", &self.inner.pool.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TetherError;
    use crate::object::ObjectError;

    #[test]
    fn test_handles_share_state() {
        let rt = Runtime::new();
        let other = rt.clone();
        let id = rt.create_plain(None).unwrap();
        assert!(other.contains(id));
        assert!(rt.ptr_eq(&other));
        assert!(!rt.ptr_eq(&Runtime::new()));
    }

    #[test]
    fn test_global_is_shared() {
        let a = Runtime::global();
        let b = Runtime::global();
        assert!(a.ptr_eq(b));
        assert!(Runtime::try_global().is_some());
    }

    #[test]
    fn test_config_applied() {
        let rt = Runtime::with_config(RuntimeConfig::default().with_mutex_pool_size(7));
        assert_eq!(rt.inner.pool.len(), 7);
        assert_eq!(rt.config().mutex_pool_size, 7);
    }

    #[test]
    fn test_shutdown_destroys_local_objects() {
        let rt = Runtime::new();
        let root = rt.create_plain(None).unwrap();
        let child = rt.create_plain(Some(root)).unwrap();
        rt.shutdown();

        assert!(rt.is_shut_down());
        assert!(!rt.contains(root));
        assert!(!rt.contains(child));
        assert_eq!(rt.object_count(), 0);
        assert!(matches!(
            rt.create_plain(None),
            Err(TetherError::RuntimeShutDown)
        ));
        // Idempotent.
        rt.shutdown();
    }

    #[test]
    fn test_destroyed_objects_are_invalid() {
        let rt = Runtime::new();
        let id = rt.create_plain(None).unwrap();
        rt.destroy(id).unwrap();
        assert!(matches!(
            rt.destroy(id),
            Err(TetherError::Object(ObjectError::InvalidObjectId))
        ));
    }

    #[test]
    fn test_shutdown_clears_user_types() {
        #[derive(Clone)]
        struct Payload;

        let rt = Runtime::new();
        let id = rt.types().register::<Payload>("Payload");
        assert!(id.is_valid());
        rt.shutdown();
        assert!(!rt.types().lookup("Payload").is_valid());
    }
}
