//! Marshaled invocations for queued and blocking-queued connections.
//!
//! A queued dispatch owns deep copies of the emitted arguments. A blocking
//! dispatch borrows the emitter's arguments instead and parks the emitter on a
//! [`Semaphore`] until the receiving thread is done with them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::connection::Connection;
use crate::object::ObjectId;
use crate::types::{ArgRef, Value};

/// A counting semaphore.
#[derive(Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// A semaphore holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Take one permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take one permit, giving up after `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            let deadline = std::time::Instant::now() + timeout;
            while *permits == 0 {
                if self
                    .available
                    .wait_until(&mut permits, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Return one permit.
    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.available.notify_one();
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available())
            .finish()
    }
}

/// Releases a semaphore permit when dropped.
///
/// Dropping the blocking event without delivering it still wakes the emitter.
pub(crate) struct ReleaseOnDrop(Arc<Semaphore>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Arguments carried by a [`MetaCallEvent`].
pub(crate) enum ArgPack {
    /// Deep copies made at emission time.
    Owned(Vec<Value>),
    /// The emitter's own arguments; valid until `_release` fires.
    Borrowed {
        args: &'static [ArgRef<'static>],
        _release: ReleaseOnDrop,
    },
}

impl ArgPack {
    /// Copy the slot references out.
    pub(crate) fn slots(&self) -> Vec<ArgRef<'_>> {
        match self {
            Self::Owned(values) => values.iter().map(|v| &**v as ArgRef<'_>).collect(),
            Self::Borrowed { args, .. } => args.to_vec(),
        }
    }
}

/// A queued invocation of a connection's target.
pub struct MetaCallEvent {
    pub(crate) connection: Arc<Connection>,
    pub(crate) sender: ObjectId,
    pub(crate) args: ArgPack,
}

impl MetaCallEvent {
    pub(crate) fn queued(connection: Arc<Connection>, sender: ObjectId, args: Vec<Value>) -> Self {
        Self {
            connection,
            sender,
            args: ArgPack::Owned(args),
        }
    }

    /// Borrow `args` for a blocking call.
    ///
    /// # Safety
    ///
    /// The caller must keep `args` and everything it points to alive until
    /// `done` has been released once, which happens when the returned event is
    /// dropped.
    pub(crate) unsafe fn blocking(
        connection: Arc<Connection>,
        sender: ObjectId,
        args: &[ArgRef<'_>],
        done: Arc<Semaphore>,
    ) -> Self {
        // SAFETY: lifetime extension guarded by the caller's contract above.
        let args: &'static [ArgRef<'static>] = unsafe { std::mem::transmute(args) };
        Self {
            connection,
            sender,
            args: ArgPack::Borrowed {
                args,
                _release: ReleaseOnDrop(done),
            },
        }
    }

    /// The emitting object.
    pub fn sender(&self) -> ObjectId {
        self.sender
    }

    /// The signal that was emitted.
    pub fn signal(&self) -> usize {
        self.connection.signal
    }

    /// Whether the emitter is blocked waiting on this call.
    pub fn is_blocking(&self) -> bool {
        matches!(self.args, ArgPack::Borrowed { .. })
    }
}

impl fmt::Debug for MetaCallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaCallEvent")
            .field("sender", &self.sender)
            .field("signal", &self.connection.signal)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}
