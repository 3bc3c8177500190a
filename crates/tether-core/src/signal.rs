//! Signal emission.
//!
//! [`Runtime::emit`] walks the sender's connection list for one signal and
//! dispatches every live connection according to its [`ConnectionType`]:
//!
//! - **Direct**: the target runs on the emitting thread while the sender's
//!   pool mutex is released
//! - **Queued**: the arguments are deep-copied through the type registry and
//!   posted to the receiver's thread
//! - **BlockingQueued**: the emitter's own arguments are posted together with
//!   a semaphore and the emitter waits for it
//!
//! The list is frozen at its length when the emission starts, so connections
//! made by a target during the emission are not invoked until the next one.
//! Connections broken during the emission are skipped. The in-use count taken
//! for the duration keeps tombstoned entries in place until the emission
//! ends.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use tether_core::{ConnectionType, Runtime, OBJECT_NAME_CHANGED_SIGNAL};
//!
//! let rt = Runtime::new();
//! let obj = rt.create_plain(None).unwrap();
//! let calls = Arc::new(AtomicUsize::new(0));
//! let counter = calls.clone();
//! rt.connect_fn(obj, OBJECT_NAME_CHANGED_SIGNAL, None, ConnectionType::Auto, move |_, args| {
//!     assert_eq!(args[0].downcast_ref::<String>().unwrap(), "renamed");
//!     counter.fetch_add(1, Ordering::SeqCst);
//! })
//! .unwrap();
//!
//! rt.set_object_name(obj, "renamed");
//! assert_eq!(calls.load(Ordering::SeqCst), 1);
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionType, Target};
use crate::dispatcher::panic_message;
use crate::error::SignalError;
use crate::event::{Event, EventPriority};
use crate::invocation::{MetaCallEvent, Semaphore};
use crate::logging::targets;
use crate::meta::{Context, MetaArgs, MetaCall, DESTROYED_SIGNAL};
use crate::object::{ObjectId, ObjectNode};
use crate::pool_lock::PoolGuard;
use crate::runtime::Runtime;
use crate::types::{ArgRef, Value};

impl Runtime {
    /// Emit `signal` (absolute index) from `sender` with `args`.
    ///
    /// Does nothing when the sender is gone or its signals are blocked;
    /// `destroyed` is emitted even while blocked.
    #[tracing::instrument(level = "trace", target = "tether_core::signal", skip_all, fields(sender = ?sender, signal = signal))]
    pub fn emit(&self, sender: ObjectId, signal: usize, args: &[ArgRef<'_>]) {
        if let Some(node) = self.node(sender) {
            self.activate(&node, signal, args);
        }
    }

    pub(crate) fn activate(&self, node: &Arc<ObjectNode>, signal: usize, args: &[ArgRef<'_>]) {
        if signal != DESTROYED_SIGNAL && node.signals_blocked.load(Ordering::Acquire) {
            return;
        }
        if !node.summary.may_have(signal) {
            return;
        }

        let cell = &node.connections;
        let mut guard = self.inner.pool.lock(cell);
        let last = {
            let data = guard.data(cell);
            let len = data.list(signal).map_or(0, |list| list.len());
            if len == 0 {
                return;
            }
            data.in_use += 1;
            len
        };

        let current = std::thread::current().id();
        for index in 0..last {
            let connection = {
                let data = guard.data(cell);
                match data.list(signal).and_then(|list| list.get(index)) {
                    Some(c) if c.is_alive() => c.clone(),
                    _ => continue,
                }
            };
            let receiver = connection.receiver_node();
            if connection.receiver.is_some() && receiver.is_none() {
                continue;
            }
            let same_thread = receiver
                .as_ref()
                .is_none_or(|r| r.thread_data().id == current);

            match (connection.kind, same_thread) {
                (ConnectionType::Direct, _) | (ConnectionType::Auto, true) => {
                    guard.unlocked(|| {
                        self.invoke_target(&connection, receiver.as_ref(), node.id, args);
                    });
                }
                (ConnectionType::Queued, _) | (ConnectionType::Auto, false) => {
                    if let Some(receiver) = &receiver {
                        self.queue_call(node, &connection, receiver, args);
                    }
                }
                (ConnectionType::BlockingQueued, true) => {
                    let err = SignalError::SelfDeadlock {
                        signal: signal_name(node, signal),
                    };
                    tracing::error!(target: targets::SIGNAL, sender = ?node.id, %err, "blocking queued connection to the emitting thread, invoking directly");
                    guard.unlocked(|| {
                        self.invoke_target(&connection, receiver.as_ref(), node.id, args);
                    });
                }
                (ConnectionType::BlockingQueued, false) => {
                    if let Some(receiver) = &receiver {
                        self.blocking_call(&mut guard, node.id, &connection, receiver, args);
                    }
                }
            }
        }

        let removed = guard.data(cell).release(&node.summary);
        drop(guard);
        drop(removed);
    }

    fn queue_call(
        &self,
        sender: &ObjectNode,
        connection: &Arc<Connection>,
        receiver: &Arc<ObjectNode>,
        args: &[ArgRef<'_>],
    ) {
        let types = self.types();
        let mut copies: Vec<Value> = Vec::with_capacity(connection.arg_types.len());
        for (position, &type_id) in connection.arg_types.iter().enumerate() {
            let copy = args
                .get(position)
                .and_then(|arg| types.copy_construct(type_id, *arg));
            match copy {
                Some(value) => copies.push(value),
                None => {
                    let type_name = sender
                        .meta
                        .method(connection.signal)
                        .and_then(|m| m.descriptor.parameter_types.get(position).copied())
                        .unwrap_or("?")
                        .to_string();
                    let err = SignalError::UnregisteredArgumentType { type_name };
                    tracing::warn!(
                        target: targets::SIGNAL,
                        sender = ?sender.id,
                        signal = %signal_name(sender, connection.signal),
                        %err,
                        "queued dispatch dropped"
                    );
                    return;
                }
            }
        }
        let event = MetaCallEvent::queued(connection.clone(), sender.id, copies);
        self.post_to_node(receiver, Event::MetaCall(event), EventPriority::Normal);
    }

    fn blocking_call(
        &self,
        guard: &mut PoolGuard<'_>,
        sender: ObjectId,
        connection: &Arc<Connection>,
        receiver: &Arc<ObjectNode>,
        args: &[ArgRef<'_>],
    ) {
        let done = Arc::new(Semaphore::new(0));
        // SAFETY: `args` outlives the wait below, and the wait only returns
        // once the event holding the borrow has been dropped.
        let event = unsafe { MetaCallEvent::blocking(connection.clone(), sender, args, done.clone()) };
        guard.unlocked(|| {
            self.post_to_node(receiver, Event::MetaCall(event), EventPriority::Normal);
            done.acquire();
        });
    }

    /// Run a connection's target on the calling thread.
    fn invoke_target(
        &self,
        connection: &Connection,
        receiver: Option<&Arc<ObjectNode>>,
        sender: ObjectId,
        args: &[ArgRef<'_>],
    ) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match &connection.target {
            Target::Method(index) => {
                let Some(receiver) = receiver else {
                    return;
                };
                let ctx = Context::new(self.clone(), receiver.id, Some(sender));
                let mut meta_args = MetaArgs::new(args).with_context(&ctx);
                if let Err(err) = receiver.meta.invoke(
                    Some(receiver.instance_any()),
                    MetaCall::InvokeMethod,
                    *index,
                    &mut meta_args,
                ) {
                    tracing::warn!(
                        target: targets::SIGNAL,
                        receiver = ?receiver.id,
                        method = index,
                        %err,
                        "slot invocation failed"
                    );
                }
            }
            Target::Closure(f) => {
                let object = connection.receiver.unwrap_or(sender);
                let ctx = Context::new(self.clone(), object, Some(sender));
                f(&ctx, args);
            }
        }));
        if let Err(payload) = result {
            tracing::error!(
                target: targets::SIGNAL,
                ?sender,
                signal = connection.signal,
                panic = panic_message(&payload),
                "slot panicked"
            );
        }
    }

    /// Deliver a queued invocation on the receiver's thread.
    ///
    /// Calls for connections broken after posting are dropped.
    pub(crate) fn deliver_meta_call(&self, node: &Arc<ObjectNode>, call: MetaCallEvent) {
        if !call.connection.is_alive() {
            tracing::trace!(
                target: targets::SIGNAL,
                receiver = ?node.id,
                signal = call.connection.signal,
                "stale queued call dropped"
            );
            return;
        }
        let slots = call.args.slots();
        self.invoke_target(&call.connection, Some(node), call.sender, &slots);
    }
}

fn signal_name(node: &ObjectNode, signal: usize) -> String {
    node.meta
        .method(signal)
        .map_or_else(|| format!("#{signal}"), |m| m.signature())
}
