//! Events delivered through the per-thread queues.

use std::fmt;

use crate::dispatcher::Descriptor;
use crate::invocation::MetaCallEvent;
use crate::meta::Context;
use crate::object::ObjectId;
use crate::timer::TimerId;
use crate::types::Value;

/// Priority of a posted event.
///
/// Higher priorities are delivered first; equal priorities keep post order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum EventPriority {
    /// Background work.
    Low = 0,
    /// Most events.
    #[default]
    Normal = 1,
    /// Events that should overtake normal traffic.
    High = 2,
    /// Shutdown and similar.
    Critical = 3,
}

/// A one-shot closure queued with [`Runtime::post_call`](crate::Runtime::post_call).
pub type CallFn = Box<dyn FnOnce(&Context) + Send>;

/// A unit of work delivered to an object.
pub enum Event {
    /// A queued or blocking-queued slot invocation.
    MetaCall(MetaCallEvent),
    /// A queued closure.
    Call(CallFn),
    /// Destroy the receiver once the scheduling frame has unwound.
    ///
    /// `level` is filled in when the event is posted.
    DeferredDelete {
        /// Loop plus scope level at post time, or 0.
        level: u32,
    },
    /// Ask the receiving thread's innermost event loop to exit.
    Quit,
    /// A timer owned by the receiver expired.
    Timer {
        /// The expired timer.
        id: TimerId,
    },
    /// A registered descriptor became ready.
    SocketActivated {
        /// The ready descriptor.
        descriptor: Descriptor,
    },
    /// A child was attached to the receiver.
    ChildAdded {
        /// The new child.
        child: ObjectId,
    },
    /// A child was detached from the receiver.
    ChildRemoved {
        /// The former child.
        child: ObjectId,
    },
    /// The receiver is about to move to another thread.
    ThreadChange,
    /// Application-defined event.
    User {
        /// Application-defined kind.
        kind: u32,
        /// Optional payload.
        payload: Option<Value>,
    },
}

/// Discriminant of an [`Event`], used for filtering and compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::MetaCall`].
    MetaCall,
    /// [`Event::Call`].
    Call,
    /// [`Event::DeferredDelete`].
    DeferredDelete,
    /// [`Event::Quit`].
    Quit,
    /// [`Event::Timer`].
    Timer,
    /// [`Event::SocketActivated`].
    SocketActivated,
    /// [`Event::ChildAdded`].
    ChildAdded,
    /// [`Event::ChildRemoved`].
    ChildRemoved,
    /// [`Event::ThreadChange`].
    ThreadChange,
    /// [`Event::User`] with this kind.
    User(u32),
}

impl Event {
    /// A user event without payload.
    pub fn user(kind: u32) -> Self {
        Self::User {
            kind,
            payload: None,
        }
    }

    /// A user event carrying `payload`.
    pub fn user_with_payload<T: std::any::Any + Send + Sync>(kind: u32, payload: T) -> Self {
        Self::User {
            kind,
            payload: Some(Box::new(payload)),
        }
    }

    /// A deferred-delete request.
    pub fn deferred_delete() -> Self {
        Self::DeferredDelete { level: 0 }
    }

    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MetaCall(_) => EventKind::MetaCall,
            Self::Call(_) => EventKind::Call,
            Self::DeferredDelete { .. } => EventKind::DeferredDelete,
            Self::Quit => EventKind::Quit,
            Self::Timer { .. } => EventKind::Timer,
            Self::SocketActivated { .. } => EventKind::SocketActivated,
            Self::ChildAdded { .. } => EventKind::ChildAdded,
            Self::ChildRemoved { .. } => EventKind::ChildRemoved,
            Self::ThreadChange => EventKind::ThreadChange,
            Self::User { kind, .. } => EventKind::User(*kind),
        }
    }

    /// Whether a second pending event of this kind for the same receiver
    /// is discarded at post time.
    pub fn is_compressible(&self) -> bool {
        matches!(self, Self::DeferredDelete { .. } | Self::Quit)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetaCall(call) => f.debug_tuple("MetaCall").field(call).finish(),
            Self::Call(_) => f.write_str("Call"),
            Self::DeferredDelete { level } => f
                .debug_struct("DeferredDelete")
                .field("level", level)
                .finish(),
            Self::Quit => f.write_str("Quit"),
            Self::Timer { id } => f.debug_struct("Timer").field("id", id).finish(),
            Self::SocketActivated { descriptor } => f
                .debug_struct("SocketActivated")
                .field("descriptor", descriptor)
                .finish(),
            Self::ChildAdded { child } => {
                f.debug_struct("ChildAdded").field("child", child).finish()
            }
            Self::ChildRemoved { child } => {
                f.debug_struct("ChildRemoved").field("child", child).finish()
            }
            Self::ThreadChange => f.write_str("ThreadChange"),
            Self::User { kind, payload } => f
                .debug_struct("User")
                .field("kind", kind)
                .field("payload", &payload.is_some())
                .finish(),
        }
    }
}

/// An event sitting in a thread's queue.
///
/// `event` is taken out on delivery; the empty entry stays behind until the
/// queue is compacted.
#[derive(Debug)]
pub(crate) struct PostedEvent {
    pub(crate) receiver: ObjectId,
    pub(crate) event: Option<Event>,
    pub(crate) priority: EventPriority,
    pub(crate) sequence: u64,
}
