//! Thread-affinity checks.
//!
//! Affinity-bound operations (synchronous delivery, timers, notifiers,
//! reparenting, migration) must run on the thread that owns the object. The
//! runtime reports violations as [`TetherError::CrossThreadViolation`] rather
//! than panicking; [`ThreadAffinity`] offers the same check to user types that
//! want to guard their own state.
//!
//! ```
//! use tether_core::thread_check::ThreadAffinity;
//!
//! let affinity = ThreadAffinity::current();
//! assert!(affinity.is_same_thread());
//! assert!(affinity.check("update").is_ok());
//!
//! std::thread::spawn(move || {
//!     assert!(affinity.check("update").is_err());
//! })
//! .join()
//! .unwrap();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

use crate::error::{Result, TetherError};
use crate::logging::targets;

/// Whether violations are also logged when detected.
static LOG_VIOLATIONS: AtomicBool = AtomicBool::new(true);

/// Enable or disable logging of affinity violations.
///
/// Violations are still returned as errors either way.
pub fn set_violation_logging(enabled: bool) {
    LOG_VIOLATIONS.store(enabled, Ordering::SeqCst);
}

/// Fail with a cross-thread violation unless the caller runs on `expected`.
pub(crate) fn require_thread(operation: &'static str, expected: ThreadId) -> Result<()> {
    if std::thread::current().id() == expected {
        return Ok(());
    }
    let err = TetherError::cross_thread(operation, expected);
    if LOG_VIOLATIONS.load(Ordering::Relaxed) {
        tracing::warn!(target: targets::OBJECT, %err, "thread affinity violation");
    }
    Err(err)
}

/// Records the thread a value was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAffinity {
    thread_id: ThreadId,
}

impl ThreadAffinity {
    /// Affinity to the calling thread.
    pub fn current() -> Self {
        Self {
            thread_id: std::thread::current().id(),
        }
    }

    /// Affinity to a given thread.
    pub fn for_thread(thread_id: ThreadId) -> Self {
        Self { thread_id }
    }

    /// The owning thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Whether the caller runs on the owning thread.
    #[inline]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// `Ok` on the owning thread, a cross-thread violation elsewhere.
    pub fn check(&self, operation: &'static str) -> Result<()> {
        require_thread(operation, self.thread_id)
    }

    /// Panic in debug builds when called off the owning thread.
    #[inline]
    pub fn debug_assert_same_thread(&self) {
        debug_assert!(
            self.is_same_thread(),
            "accessed from {:?}, owned by {:?}",
            std::thread::current().id(),
            self.thread_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_thread_passes() {
        let affinity = ThreadAffinity::current();
        assert!(affinity.is_same_thread());
        assert!(affinity.check("op").is_ok());
        affinity.debug_assert_same_thread();
    }

    #[test]
    fn test_foreign_thread_fails() {
        let affinity = ThreadAffinity::current();
        let owner = affinity.thread_id();
        let result = std::thread::spawn(move || affinity.check("poke"))
            .join()
            .unwrap();
        match result {
            Err(TetherError::CrossThreadViolation {
                operation,
                expected,
                actual,
            }) => {
                assert_eq!(operation, "poke");
                assert_eq!(expected, owner);
                assert_ne!(actual, owner);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_for_thread() {
        let id = std::thread::spawn(|| std::thread::current().id())
            .join()
            .unwrap();
        let affinity = ThreadAffinity::for_thread(id);
        assert!(!affinity.is_same_thread());
        assert_eq!(affinity.thread_id(), id);
    }
}
