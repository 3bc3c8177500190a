//! Error types for Tether.
//!
//! Most runtime failures are reported as local `Option`/`bool` results and a
//! diagnostic log line. The enums here cover the cases where a caller can act
//! on the reason: connect failures, thread-affinity violations, timer and pool
//! misuse.

use std::thread::ThreadId;

use crate::meta::MetaError;
use crate::object::ObjectError;

/// The main error type for Tether operations.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Object-related error.
    #[error("Object error: {0}")]
    Object(#[from] ObjectError),
    /// Reflection or invocation error.
    #[error("Meta error: {0}")]
    Meta(#[from] MetaError),
    /// Signal/connection error.
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),
    /// Timer-related error.
    #[error("Timer error: {0}")]
    Timer(#[from] TimerError),
    /// Worker pool error.
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] ThreadPoolError),
    /// An affinity-bound operation was attempted from the wrong thread, or
    /// would join objects living on different threads.
    #[error("{operation} refused: expected thread {expected:?}, got {actual:?}")]
    CrossThreadViolation {
        /// The refused operation.
        operation: &'static str,
        /// The thread the operation is bound to.
        expected: ThreadId,
        /// The thread that attempted it.
        actual: ThreadId,
    },
    /// An object is pinned to its thread and cannot migrate.
    #[error("Object is pinned to its thread")]
    AffinityPinned,
    /// The runtime has been shut down.
    #[error("The runtime has been shut down")]
    RuntimeShutDown,
}

/// Signal and connection errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// Name, arity or parameter types did not resolve at connect time.
    #[error("Unresolved connection target: {reason}")]
    UnresolvedTarget {
        /// Human-readable reason.
        reason: String,
    },
    /// A queued dispatch needed to copy an argument whose type has no
    /// registered copy operation.
    #[error("Argument type '{type_name}' has no registered copy operation")]
    UnregisteredArgumentType {
        /// Name of the offending type.
        type_name: String,
    },
    /// A blocking queued call targeted the emitting thread.
    #[error("Blocking queued call to '{signal}' targets the emitting thread")]
    SelfDeadlock {
        /// The signal being emitted.
        signal: String,
    },
    /// A unique connection with the same receiver and target already exists.
    #[error("An identical connection already exists")]
    AlreadyConnected,
    /// The connection handle is invalid or already disconnected.
    #[error("Invalid or disconnected connection handle")]
    InvalidConnection,
}

impl SignalError {
    /// Create an unresolved-target error.
    pub fn unresolved(reason: impl Into<String>) -> Self {
        Self::UnresolvedTarget {
            reason: reason.into(),
        }
    }
}

/// Timer-specific errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The timer ID is invalid or has already been removed.
    #[error("Invalid or expired timer ID")]
    InvalidTimerId,
    /// The timer is registered for a different object.
    #[error("Timer belongs to another object")]
    WrongOwner,
}

/// Worker pool errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadPoolError {
    /// The global pool has already been initialized.
    #[error("The global thread pool is already initialized")]
    AlreadyInitialized,
    /// The OS refused to create a worker thread.
    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

/// A specialized Result type for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl TetherError {
    /// Create a cross-thread violation for `operation` bound to `expected`.
    pub(crate) fn cross_thread(operation: &'static str, expected: ThreadId) -> Self {
        Self::CrossThreadViolation {
            operation,
            expected,
            actual: std::thread::current().id(),
        }
    }
}
