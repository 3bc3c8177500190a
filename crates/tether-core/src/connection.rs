//! Connection table.
//!
//! Every object keeps its connections in a pool cell guarded by the
//! runtime's mutex pool: one ordered list per signal for the connections it
//! sends, plus the list of connections it receives. A connection is shared
//! between the sender's list, the receiver's list and any queued invocation
//! still in flight.
//!
//! # Tombstones
//!
//! Disconnecting never removes an entry from a sender list that an emission
//! is walking. The connection is marked dead and unlinked from the receiver
//! right away, and the sender's list is compacted once no emission holds it.
//! Entries removed by compaction are dropped after the pool mutex has been
//! released, since dropping a closure target may run arbitrary code.
//!
//! # Connection Types
//!
//! - **Direct**: the target runs immediately on the emitting thread
//! - **Queued**: the arguments are copied and the call is posted to the
//!   receiver's thread
//! - **BlockingQueued**: like Queued, but the emitter waits until the target
//!   has run
//! - **Auto**: Direct when the receiver lives on the emitting thread, Queued
//!   otherwise (default)

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Result, SignalError};
use crate::logging::targets;
use crate::meta::{check_connect_args, parse_signature, Context, MetaMethod, MethodKind};
use crate::object::{ObjectError, ObjectId, ObjectNode};
use crate::runtime::Runtime;
use crate::types::{ArgRef, MetaTypeId};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Specifies how a connected target is invoked when the signal is emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Choose Direct or Queued by comparing the receiver's thread with the
    /// emitting thread at emission time.
    #[default]
    Auto,

    /// Invoke the target immediately on the emitting thread.
    Direct,

    /// Copy the arguments and post the invocation to the receiver's thread.
    ///
    /// Every argument type must have a registered copy operation.
    Queued,

    /// Like Queued, but block the emitting thread until the target has run.
    ///
    /// # Warning
    ///
    /// Emitting from the receiver's own thread can never complete. The
    /// runtime logs the mistake and invokes the target directly instead.
    BlockingQueued,
}

/// A closure target. Receives the invocation context and the emitted
/// arguments.
pub type SlotFn = dyn Fn(&Context, &[ArgRef<'_>]) + Send + Sync;

pub(crate) enum Target {
    /// Absolute method index on the receiver's class.
    Method(usize),
    Closure(Box<SlotFn>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(index) => f.debug_tuple("Method").field(index).finish(),
            Self::Closure(_) => f.write_str("Closure"),
        }
    }
}

/// One `(sender, signal, receiver, target, type)` wiring.
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) sender: ObjectId,
    sender_node: Weak<ObjectNode>,
    pub(crate) signal: usize,
    pub(crate) receiver: Option<ObjectId>,
    receiver_node: Option<Weak<ObjectNode>>,
    pub(crate) target: Target,
    pub(crate) kind: ConnectionType,
    /// Type ids of the arguments a queued dispatch has to copy.
    pub(crate) arg_types: Vec<MetaTypeId>,
    alive: AtomicBool,
}

impl Connection {
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn sender_node(&self) -> Option<Arc<ObjectNode>> {
        self.sender_node.upgrade()
    }

    pub(crate) fn receiver_node(&self) -> Option<Arc<ObjectNode>> {
        self.receiver_node.as_ref().and_then(Weak::upgrade)
    }

    fn matches(&self, receiver: Option<ObjectId>, method: Option<usize>) -> bool {
        receiver.is_none_or(|r| self.receiver == Some(r))
            && method.is_none_or(|m| matches!(self.target, Target::Method(i) if i == m))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("sender", &self.sender)
            .field("signal", &self.signal)
            .field("receiver", &self.receiver)
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Conservative "may have connections" summary for the first 64 signals.
///
/// Bits are set on connect and recomputed when a list is compacted, so the
/// summary never reports a connected signal as empty.
pub(crate) struct ConnectionSummary {
    mask: AtomicU64,
    overflow: AtomicBool,
}

impl ConnectionSummary {
    pub(crate) fn new() -> Self {
        Self {
            mask: AtomicU64::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    fn mark(&self, signal: usize) {
        if signal < 64 {
            self.mask.fetch_or(1 << signal, Ordering::Release);
        } else {
            self.overflow.store(true, Ordering::Release);
        }
    }

    pub(crate) fn may_have(&self, signal: usize) -> bool {
        if signal < 64 {
            self.mask.load(Ordering::Acquire) & (1 << signal) != 0
        } else {
            self.overflow.load(Ordering::Acquire)
        }
    }

    fn store(&self, mask: u64, overflow: bool) {
        self.mask.store(mask, Ordering::Release);
        self.overflow.store(overflow, Ordering::Release);
    }
}

/// Per-object connection lists. Only touched under the pool mutex.
#[derive(Default)]
pub(crate) struct ConnectionData {
    /// Outgoing connections, indexed by absolute signal index.
    signals: Vec<Vec<Arc<Connection>>>,
    /// Connections this object receives.
    incoming: Vec<Arc<Connection>>,
    /// Emissions currently walking the outgoing lists.
    pub(crate) in_use: u32,
    dirty: bool,
    /// The owner was torn down while an emission was running.
    orphaned: bool,
}

impl ConnectionData {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn list(&self, signal: usize) -> Option<&[Arc<Connection>]> {
        self.signals.get(signal).map(Vec::as_slice)
    }

    fn push_outgoing(&mut self, connection: Arc<Connection>) {
        let signal = connection.signal;
        if self.signals.len() <= signal {
            self.signals.resize_with(signal + 1, Vec::new);
        }
        self.signals[signal].push(connection);
    }

    fn remove_incoming(&mut self, connection: &Arc<Connection>) {
        self.incoming.retain(|c| !Arc::ptr_eq(c, connection));
    }

    fn first_alive_outgoing(&self) -> Option<Arc<Connection>> {
        self.signals
            .iter()
            .flatten()
            .find(|c| c.is_alive())
            .cloned()
    }

    fn alive_outgoing(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.signals.iter().flatten().filter(|c| c.is_alive())
    }

    /// Live outgoing connections.
    pub(crate) fn outgoing_count(&self) -> usize {
        self.alive_outgoing().count()
    }

    /// Live incoming connections.
    pub(crate) fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    /// Drop dead entries and refresh the summary. Returns the removed
    /// entries so the caller can release them outside the lock.
    fn compact(&mut self, summary: &ConnectionSummary) -> Vec<Arc<Connection>> {
        let mut removed = Vec::new();
        let mut mask = 0u64;
        let mut overflow = false;
        for (signal, list) in self.signals.iter_mut().enumerate() {
            let (alive, dead): (Vec<_>, Vec<_>) = list.drain(..).partition(|c| c.is_alive());
            removed.extend(dead);
            *list = alive;
            if !list.is_empty() {
                if signal < 64 {
                    mask |= 1 << signal;
                } else {
                    overflow = true;
                }
            }
        }
        summary.store(mask, overflow);
        self.dirty = false;
        removed
    }

    /// Called when an emission leaves the lists.
    pub(crate) fn release(&mut self, summary: &ConnectionSummary) -> Vec<Arc<Connection>> {
        self.in_use = self.in_use.saturating_sub(1);
        if self.in_use > 0 {
            return Vec::new();
        }
        if self.orphaned {
            self.orphaned = false;
            self.dirty = false;
            summary.store(0, false);
            return self.signals.drain(..).flatten().collect();
        }
        if self.dirty {
            return self.compact(summary);
        }
        Vec::new()
    }
}

/// A handle to an established connection.
///
/// Handles do not keep the connection alive. Dropping a handle does not
/// disconnect; use [`ConnectionGuard`] for that.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    connection: Weak<Connection>,
}

impl ConnectionHandle {
    fn new(connection: &Arc<Connection>) -> Self {
        Self {
            id: connection.id,
            connection: Arc::downgrade(connection),
        }
    }

    /// Process-unique id of the connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection is still established.
    pub fn is_connected(&self) -> bool {
        self.connection.upgrade().is_some_and(|c| c.is_alive())
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Disconnects its connection when dropped.
pub struct ConnectionGuard {
    runtime: Runtime,
    handle: Option<ConnectionHandle>,
}

impl ConnectionGuard {
    /// Tie `handle` to the guard's lifetime.
    pub fn new(runtime: &Runtime, handle: ConnectionHandle) -> Self {
        Self {
            runtime: runtime.clone(),
            handle: Some(handle),
        }
    }

    /// The guarded connection.
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Release the connection without disconnecting it.
    pub fn release(mut self) -> Option<ConnectionHandle> {
        self.handle.take()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.disconnect(&handle);
        }
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

struct Request {
    sender: Arc<ObjectNode>,
    signal: usize,
    receiver: Option<Arc<ObjectNode>>,
    target: Target,
    kind: ConnectionType,
    arg_types: Vec<MetaTypeId>,
    unique: bool,
}

impl Runtime {
    fn resolve_signal(&self, sender: &ObjectNode, signal: usize) -> Result<MetaMethod> {
        match sender.meta.method(signal) {
            Some(method) if method.kind() == MethodKind::Signal => Ok(method),
            _ => Err(SignalError::unresolved(format!(
                "class '{}' has no signal at index {signal}",
                sender.meta.class_name
            ))
            .into()),
        }
    }

    fn argument_types(&self, sender: &ObjectNode, signal: usize, count: usize) -> Vec<MetaTypeId> {
        (0..count)
            .map(|position| {
                sender
                    .meta
                    .register_argument_type(signal, position, self.types())
            })
            .collect()
    }

    /// Connect `signal` of `sender` to method `method` of `receiver`.
    ///
    /// Both indices are absolute. The signal must carry at least as many
    /// arguments as the method takes, with matching types.
    pub fn connect(
        &self,
        sender: ObjectId,
        signal: usize,
        receiver: ObjectId,
        method: usize,
        kind: ConnectionType,
    ) -> Result<ConnectionHandle> {
        self.connect_method(sender, signal, receiver, method, kind, false)
            .inspect_err(|err| {
                tracing::warn!(target: targets::SIGNAL, ?sender, signal, ?receiver, method, %err, "connect failed");
            })
    }

    /// Like [`connect`](Self::connect), but fails with
    /// [`SignalError::AlreadyConnected`] when the same receiver and method
    /// are already connected to this signal.
    pub fn connect_unique(
        &self,
        sender: ObjectId,
        signal: usize,
        receiver: ObjectId,
        method: usize,
        kind: ConnectionType,
    ) -> Result<ConnectionHandle> {
        self.connect_method(sender, signal, receiver, method, kind, true)
    }

    /// Connect by signature, e.g. `"value_changed(i32)"` to `"set_value(i32)"`.
    ///
    /// The receiver's signature may name a slot, a method or another signal.
    pub fn connect_by_name(
        &self,
        sender: ObjectId,
        signal: &str,
        receiver: ObjectId,
        method: &str,
        kind: ConnectionType,
    ) -> Result<ConnectionHandle> {
        let resolved = (|| -> Result<(usize, usize)> {
            let sender_meta = self.meta_object_of(sender).ok_or(ObjectError::InvalidObjectId)?;
            let receiver_meta = self
                .meta_object_of(receiver)
                .ok_or(ObjectError::InvalidObjectId)?;
            if parse_signature(signal).is_none() || parse_signature(method).is_none() {
                return Err(SignalError::unresolved(format!(
                    "malformed signature '{signal}' or '{method}'"
                ))
                .into());
            }
            let signal_index = sender_meta.index_of_signal(signal).ok_or_else(|| {
                SignalError::unresolved(format!(
                    "no signal '{signal}' on '{}'",
                    sender_meta.class_name
                ))
            })?;
            let method_index = receiver_meta.index_of_method(method).ok_or_else(|| {
                SignalError::unresolved(format!(
                    "no method '{method}' on '{}'",
                    receiver_meta.class_name
                ))
            })?;
            Ok((signal_index, method_index))
        })();
        match resolved {
            Ok((signal_index, method_index)) => {
                self.connect(sender, signal_index, receiver, method_index, kind)
            }
            Err(err) => {
                tracing::warn!(target: targets::SIGNAL, ?sender, signal, ?receiver, method, %err, "connect failed");
                Err(err)
            }
        }
    }

    fn connect_method(
        &self,
        sender: ObjectId,
        signal: usize,
        receiver: ObjectId,
        method: usize,
        kind: ConnectionType,
        unique: bool,
    ) -> Result<ConnectionHandle> {
        let sender_node = self.node(sender).ok_or(ObjectError::InvalidObjectId)?;
        let receiver_node = self.node(receiver).ok_or(ObjectError::InvalidObjectId)?;
        let signal_method = self.resolve_signal(&sender_node, signal)?;
        let target = receiver_node.meta.method(method).ok_or_else(|| {
            SignalError::unresolved(format!(
                "class '{}' has no method at index {method}",
                receiver_node.meta.class_name
            ))
        })?;
        if target.kind() == MethodKind::Constructor {
            return Err(SignalError::unresolved("constructors cannot be connected").into());
        }
        if !check_connect_args(signal_method.descriptor, target.descriptor) {
            return Err(SignalError::unresolved(format!(
                "incompatible arguments: {} -> {}",
                signal_method.signature(),
                target.signature()
            ))
            .into());
        }

        let arg_types = self.argument_types(&sender_node, signal, target.arity());
        self.link(Request {
            sender: sender_node,
            signal,
            receiver: Some(receiver_node),
            target: Target::Method(method),
            kind,
            arg_types,
            unique,
        })
    }

    /// Connect `signal` of `sender` to a closure.
    ///
    /// With a `context` object, the closure runs on the context's thread
    /// according to `kind` and is disconnected when the context is destroyed.
    /// Without one, the closure always runs directly on the emitting thread.
    pub fn connect_fn<F>(
        &self,
        sender: ObjectId,
        signal: usize,
        context: Option<ObjectId>,
        kind: ConnectionType,
        f: F,
    ) -> Result<ConnectionHandle>
    where
        F: Fn(&Context, &[ArgRef<'_>]) + Send + Sync + 'static,
    {
        let sender_node = self.node(sender).ok_or(ObjectError::InvalidObjectId)?;
        let signal_method = self.resolve_signal(&sender_node, signal)?;
        let receiver = match context {
            Some(id) => Some(self.node(id).ok_or(ObjectError::InvalidObjectId)?),
            None => None,
        };
        let kind = if receiver.is_some() {
            kind
        } else {
            ConnectionType::Direct
        };
        let arg_types = self.argument_types(&sender_node, signal, signal_method.arity());
        self.link(Request {
            sender: sender_node,
            signal,
            receiver,
            target: Target::Closure(Box::new(f)),
            kind,
            arg_types,
            unique: false,
        })
    }

    fn link(&self, request: Request) -> Result<ConnectionHandle> {
        let Request {
            sender,
            signal,
            receiver,
            target,
            kind,
            arg_types,
            unique,
        } = request;
        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sender: sender.id,
            sender_node: Arc::downgrade(&sender),
            signal,
            receiver: receiver.as_ref().map(|r| r.id),
            receiver_node: receiver.as_ref().map(Arc::downgrade),
            target,
            kind,
            arg_types,
            alive: AtomicBool::new(true),
        });

        let pool = &self.inner.pool;
        match &receiver {
            Some(receiver) => {
                let mut guard = pool.lock_pair(&sender.connections, &receiver.connections);
                if sender.is_deleting() || receiver.is_deleting() {
                    return Err(ObjectError::InvalidObjectId.into());
                }
                let (sender_data, receiver_data) =
                    guard.both(&sender.connections, &receiver.connections);
                if unique {
                    let duplicate = sender_data.list(signal).is_some_and(|list| {
                        list.iter().any(|c| {
                            c.is_alive()
                                && c.receiver == connection.receiver
                                && matches!((&c.target, &connection.target),
                                    (Target::Method(a), Target::Method(b)) if a == b)
                        })
                    });
                    if duplicate {
                        return Err(SignalError::AlreadyConnected.into());
                    }
                }
                sender_data.push_outgoing(connection.clone());
                match receiver_data {
                    Some(receiver_data) => receiver_data.incoming.push(connection.clone()),
                    None => sender_data.incoming.push(connection.clone()),
                }
            }
            None => {
                let mut guard = pool.lock(&sender.connections);
                if sender.is_deleting() {
                    return Err(ObjectError::InvalidObjectId.into());
                }
                guard.data(&sender.connections).push_outgoing(connection.clone());
            }
        }
        sender.summary.mark(signal);
        tracing::trace!(
            target: targets::SIGNAL,
            id = connection.id,
            sender = ?connection.sender,
            signal,
            receiver = ?connection.receiver,
            ?kind,
            "connected"
        );
        Ok(ConnectionHandle::new(&connection))
    }

    /// Break a connection. Returns `false` if it was already broken.
    ///
    /// Queued invocations already posted for it are dropped on delivery.
    pub fn disconnect(&self, handle: &ConnectionHandle) -> bool {
        match handle.connection.upgrade() {
            Some(connection) => self.unlink(&connection),
            None => false,
        }
    }

    /// Tombstone `connection`, unlink it from the receiver and compact the
    /// sender's list if no emission is using it.
    pub(crate) fn unlink(&self, connection: &Arc<Connection>) -> bool {
        let Some(sender) = connection.sender_node() else {
            return connection.alive.swap(false, Ordering::AcqRel);
        };
        let pool = &self.inner.pool;
        let removed = match connection.receiver_node() {
            Some(receiver) => {
                let mut guard = pool.lock_pair(&sender.connections, &receiver.connections);
                if !connection.alive.swap(false, Ordering::AcqRel) {
                    return false;
                }
                let (sender_data, receiver_data) =
                    guard.both(&sender.connections, &receiver.connections);
                match receiver_data {
                    Some(receiver_data) => receiver_data.remove_incoming(connection),
                    None => sender_data.remove_incoming(connection),
                }
                sender_data.dirty = true;
                if sender_data.in_use == 0 {
                    sender_data.compact(&sender.summary)
                } else {
                    Vec::new()
                }
            }
            None => {
                let mut guard = pool.lock(&sender.connections);
                if !connection.alive.swap(false, Ordering::AcqRel) {
                    return false;
                }
                let data = guard.data(&sender.connections);
                data.dirty = true;
                if data.in_use == 0 {
                    data.compact(&sender.summary)
                } else {
                    Vec::new()
                }
            }
        };
        drop(removed);
        tracing::trace!(target: targets::SIGNAL, id = connection.id, "disconnected");
        true
    }

    fn outgoing_matching(
        &self,
        sender: &ObjectNode,
        signal: Option<usize>,
        receiver: Option<ObjectId>,
        method: Option<usize>,
    ) -> Vec<Arc<Connection>> {
        let mut guard = self.inner.pool.lock(&sender.connections);
        let data = guard.data(&sender.connections);
        data.alive_outgoing()
            .filter(|c| signal.is_none_or(|s| c.signal == s) && c.matches(receiver, method))
            .cloned()
            .collect()
    }

    /// Break every connection of `sender` matching the given filters.
    ///
    /// `None` matches anything. Returns the number of connections broken.
    pub fn disconnect_matching(
        &self,
        sender: ObjectId,
        signal: Option<usize>,
        receiver: Option<ObjectId>,
        method: Option<usize>,
    ) -> usize {
        let Some(node) = self.node(sender) else {
            return 0;
        };
        let matching = self.outgoing_matching(&node, signal, receiver, method);
        matching.iter().filter(|c| self.unlink(c)).count()
    }

    /// Break every connection `sender` emits on.
    pub fn disconnect_all(&self, sender: ObjectId) -> usize {
        self.disconnect_matching(sender, None, None, None)
    }

    /// Number of live connections on `signal` of `sender`.
    pub fn receivers(&self, sender: ObjectId, signal: usize) -> usize {
        self.node(sender)
            .map_or(0, |node| self.outgoing_matching(&node, Some(signal), None, None).len())
    }

    /// Whether `signal` of `sender` has any live connection.
    pub fn is_signal_connected(&self, sender: ObjectId, signal: usize) -> bool {
        self.receivers(sender, signal) > 0
    }

    /// Live `(outgoing, incoming)` connection counts of an object.
    pub fn connection_counts(&self, id: ObjectId) -> (usize, usize) {
        self.node(id).map_or((0, 0), |node| {
            let mut guard = self.inner.pool.lock(&node.connections);
            let data = guard.data(&node.connections);
            (data.outgoing_count(), data.incoming_count())
        })
    }

    /// Break every connection `node` sends or receives.
    ///
    /// Outgoing first, then incoming. A running emission on `node` leaves its
    /// lists in place and frees them when it finishes.
    pub(crate) fn sever_connections(&self, node: &Arc<ObjectNode>) {
        let pool = &self.inner.pool;
        loop {
            let next = {
                let mut guard = pool.lock(&node.connections);
                guard.data(&node.connections).first_alive_outgoing()
            };
            let Some(connection) = next else { break };
            self.unlink(&connection);
        }
        loop {
            let next = {
                let mut guard = pool.lock(&node.connections);
                guard.data(&node.connections).incoming.first().cloned()
            };
            let Some(connection) = next else { break };
            if !self.unlink(&connection) {
                // Already dead but still listed; drop the stale entry.
                let mut guard = pool.lock(&node.connections);
                guard.data(&node.connections).remove_incoming(&connection);
            }
        }
        let removed = {
            let mut guard = pool.lock(&node.connections);
            let data = guard.data(&node.connections);
            if data.in_use > 0 {
                data.orphaned = true;
                Vec::new()
            } else {
                data.compact(&node.summary)
            }
        };
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{DELETE_LATER_SLOT, DESTROYED_SIGNAL, OBJECT_NAME_CHANGED_SIGNAL};
    use parking_lot::Mutex;

    #[test]
    fn test_summary_marks_and_recomputes() {
        let summary = ConnectionSummary::new();
        assert!(!summary.may_have(3));
        summary.mark(3);
        summary.mark(70);
        assert!(summary.may_have(3));
        assert!(summary.may_have(99));
        summary.store(0, false);
        assert!(!summary.may_have(3));
        assert!(!summary.may_have(70));
    }

    #[test]
    fn test_connect_and_disconnect() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let b = rt.create_plain(None).unwrap();
        let handle = rt
            .connect(a, DESTROYED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        assert!(handle.is_connected());
        assert_eq!(rt.receivers(a, DESTROYED_SIGNAL), 1);
        assert_eq!(rt.connection_counts(b), (0, 1));

        assert!(rt.disconnect(&handle));
        assert!(!rt.disconnect(&handle));
        assert!(!handle.is_connected());
        assert_eq!(rt.connection_counts(a), (0, 0));
        assert_eq!(rt.connection_counts(b), (0, 0));
    }

    #[test]
    fn test_connect_rejects_non_signal_and_bad_args() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let b = rt.create_plain(None).unwrap();
        let not_a_signal = rt.connect(a, DELETE_LATER_SLOT, b, DELETE_LATER_SLOT, ConnectionType::Auto);
        assert!(matches!(
            not_a_signal,
            Err(crate::TetherError::Signal(SignalError::UnresolvedTarget { .. }))
        ));
        // String signal into an ObjectId signal.
        let mismatch = rt.connect(
            a,
            OBJECT_NAME_CHANGED_SIGNAL,
            b,
            DESTROYED_SIGNAL,
            ConnectionType::Auto,
        );
        assert!(mismatch.is_err());
        assert!(rt.connect(a, 99, b, DELETE_LATER_SLOT, ConnectionType::Auto).is_err());
    }

    #[test]
    fn test_connect_unique() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let b = rt.create_plain(None).unwrap();
        rt.connect_unique(a, DESTROYED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        let again =
            rt.connect_unique(a, DESTROYED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Auto);
        assert!(matches!(
            again,
            Err(crate::TetherError::Signal(SignalError::AlreadyConnected))
        ));
        assert_eq!(rt.receivers(a, DESTROYED_SIGNAL), 1);
        rt.connect(a, DESTROYED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        assert_eq!(rt.receivers(a, DESTROYED_SIGNAL), 2);
    }

    #[test]
    fn test_connect_by_name() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let b = rt.create_plain(None).unwrap();
        rt.connect_by_name(a, "destroyed(ObjectId)", b, "delete_later()", ConnectionType::Auto)
            .unwrap();
        assert!(rt
            .connect_by_name(a, "missing()", b, "delete_later()", ConnectionType::Auto)
            .is_err());
        assert!(rt
            .connect_by_name(a, "destroyed(ObjectId", b, "delete_later()", ConnectionType::Auto)
            .is_err());
    }

    #[test]
    fn test_closure_connection_receives_args() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rt.connect_fn(a, OBJECT_NAME_CHANGED_SIGNAL, None, ConnectionType::Queued, move |ctx, args| {
            let name = args[0].downcast_ref::<String>().cloned().unwrap_or_default();
            sink.lock().push((ctx.sender(), name));
        })
        .unwrap();
        rt.set_object_name(a, "first");
        assert_eq!(*seen.lock(), vec![(Some(a), "first".to_string())]);
    }

    #[test]
    fn test_disconnect_matching() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let b = rt.create_plain(None).unwrap();
        let c = rt.create_plain(None).unwrap();
        rt.connect(a, DESTROYED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        rt.connect(a, DESTROYED_SIGNAL, c, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        rt.connect(a, OBJECT_NAME_CHANGED_SIGNAL, c, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();

        assert_eq!(rt.disconnect_matching(a, None, Some(c), None), 2);
        assert_eq!(rt.receivers(a, DESTROYED_SIGNAL), 1);
        assert_eq!(rt.disconnect_all(a), 1);
        assert!(!rt.is_signal_connected(a, DESTROYED_SIGNAL));
    }

    #[test]
    fn test_destroy_severs_both_directions() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let b = rt.create_plain(None).unwrap();
        let forward = rt
            .connect(a, OBJECT_NAME_CHANGED_SIGNAL, b, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        let backward = rt
            .connect(b, OBJECT_NAME_CHANGED_SIGNAL, a, DELETE_LATER_SLOT, ConnectionType::Auto)
            .unwrap();
        rt.destroy(b).unwrap();
        assert!(!forward.is_connected());
        assert!(!backward.is_connected());
        assert_eq!(rt.connection_counts(a), (0, 0));
    }

    #[test]
    fn test_closure_dropped_on_disconnect() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let handle = rt
            .connect_fn(a, DESTROYED_SIGNAL, None, ConnectionType::Direct, move |_, _| {
                let _ = &flag;
            })
            .unwrap();
        rt.disconnect(&handle);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_guard_disconnects_on_drop() {
        let rt = Runtime::new();
        let a = rt.create_plain(None).unwrap();
        let handle = rt
            .connect_fn(a, DESTROYED_SIGNAL, None, ConnectionType::Direct, |_, _| {})
            .unwrap();
        {
            let _guard = ConnectionGuard::new(&rt, handle.clone());
        }
        assert!(!handle.is_connected());

        let kept = rt
            .connect_fn(a, DESTROYED_SIGNAL, None, ConnectionType::Direct, |_, _| {})
            .unwrap();
        let released = ConnectionGuard::new(&rt, kept).release().unwrap();
        assert!(released.is_connected());
    }
}
