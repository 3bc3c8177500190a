//! Core systems for Tether.
//!
//! Tether is a reflective object runtime with thread-aware messaging:
//!
//! - **Type Registry**: per-class [`MetaObject`] descriptors with methods,
//!   signals, slots and properties, plus a runtime table of copyable argument
//!   types.
//! - **Object Model**: an arena of objects forming a parent/child ownership
//!   tree, each bound to the thread it lives in.
//! - **Signals and Slots**: connections between a sender's signal and a
//!   receiver's method or a closure, delivered directly, through the
//!   receiver's event queue, or blocking until the receiver has run them.
//! - **Event Dispatch**: a per-thread priority queue with nested event loops,
//!   deferred deletion, timers and socket notifiers.
//! - **Worker Pool**: a task pool with idle expiry and priority queueing.
//!
//! # Signal/Slot Example
//!
//! ```
//! use tether_core::{ConnectionType, Runtime, OBJECT_NAME_CHANGED_SIGNAL};
//! use std::sync::{Arc, Mutex};
//!
//! let rt = Runtime::new();
//! let sender = rt.create_plain(None).unwrap();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let log = seen.clone();
//! rt.connect_fn(sender, OBJECT_NAME_CHANGED_SIGNAL, None, ConnectionType::Auto, move |_, args| {
//!     if let Some(name) = args[0].downcast_ref::<String>() {
//!         log.lock().unwrap().push(name.clone());
//!     }
//! })
//! .unwrap();
//!
//! rt.set_object_name(sender, "first");
//! rt.set_object_name(sender, "second");
//! assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
//! ```
//!
//! # Cross-thread Example
//!
//! ```
//! use tether_core::{ConnectionType, EventThread, Runtime, OBJECT_NAME_CHANGED_SIGNAL};
//! use std::time::Duration;
//!
//! let rt = Runtime::new();
//! let worker = EventThread::spawn(&rt).unwrap();
//! let sender = rt.create_plain(None).unwrap();
//! let receiver = rt.create_plain(None).unwrap();
//! rt.move_to_thread(receiver, worker.handle()).unwrap();
//!
//! let (tx, rx) = crossbeam_channel::bounded(1);
//! rt.connect_fn(sender, OBJECT_NAME_CHANGED_SIGNAL, Some(receiver), ConnectionType::Auto, move |_, _| {
//!     let _ = tx.send(std::thread::current().id());
//! })
//! .unwrap();
//!
//! rt.set_object_name(sender, "ping");
//! let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
//! assert_eq!(ran_on, worker.handle().id());
//! ```

mod config;
mod connection;
pub mod dispatcher;
mod error;
mod event;
mod event_thread;
mod invocation;
pub mod logging;
pub mod meta;
pub mod object;
mod pool_lock;
pub mod property;
mod queue;
mod runtime;
mod signal;
pub mod thread_check;
mod thread_data;
pub mod threadpool;
mod timer;
pub mod types;

pub use config::{DEFAULT_EXPIRY_TIMEOUT, RuntimeConfig, ThreadPoolConfig};
pub use connection::{ConnectionGuard, ConnectionHandle, ConnectionType, SlotFn};
pub use dispatcher::{Descriptor, EventLoop, ProcessEventsFlags, ReadinessSource, WakeupSource};
pub use error::{Result, SignalError, TetherError, ThreadPoolError, TimerError};
pub use event::{CallFn, Event, EventKind, EventPriority};
pub use event_thread::{EventThread, EventThreadBuilder, EventThreadConfig};
pub use invocation::MetaCallEvent;
pub use logging::{ObjectTreeDebug, TreeFormatOptions, TreeStyle};
pub use meta::{
    Access, ClassInfo, Context, DELETE_LATER_SLOT, DESTROYED_SIGNAL, EnumDescriptor, MetaArgs,
    MetaCall, MetaError, MetaMethod, MetaObject, MetaProperty, MetaResult, MethodDescriptor,
    MethodKind, OBJECT_META, OBJECT_NAME_CHANGED_SIGNAL, PropertyDescriptor, PropertyFlags,
};
pub use object::{NewObject, Object, ObjectError, ObjectId, ObjectResult, PlainObject};
pub use property::Property;
pub use runtime::Runtime;
pub use thread_check::ThreadAffinity;
pub use thread_data::ThreadHandle;
pub use threadpool::{CancellationToken, TaskBuilder, TaskHandle, TaskPriority, ThreadPool};
pub use timer::{TimerId, TimerKind};
pub use types::{ArgRef, MetaTypeId, TypeRegistry, Value};

static_assertions::assert_impl_all!(Runtime: Send, Sync, Clone);
static_assertions::assert_impl_all!(ObjectId: Send, Sync, Copy);
static_assertions::assert_impl_all!(ConnectionHandle: Send, Sync);
static_assertions::assert_impl_all!(ThreadHandle: Send, Sync);
static_assertions::assert_impl_all!(EventLoop: Send, Sync);
static_assertions::assert_impl_all!(ThreadPool: Send, Sync);
static_assertions::assert_impl_all!(Event: Send);
