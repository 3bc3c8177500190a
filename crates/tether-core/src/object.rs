//! Object model for Tether.
//!
//! Objects live in an arena owned by the [`Runtime`] and are addressed by
//! [`ObjectId`]. The arena records the ownership tree (a parent owns its
//! children exclusively), object names, dynamic properties and affinity
//! pinning. Each entry points at an [`ObjectNode`] carrying the user instance,
//! its [`MetaObject`], the owning thread and the object's connection data.
//!
//! # Ownership and destruction
//!
//! Destroying an object first emits `destroyed`, severs every connection it
//! sends or receives, then destroys its children one by one. Each child slot
//! in the parent's list is cleared before that child's teardown starts, so a
//! child never observes a half-destroyed sibling list. Pending events, timers
//! and notifiers of the object are dropped last.
//!
//! # Thread affinity
//!
//! An object belongs to the thread that created it. Reparenting only joins
//! objects of the same thread, and [`Runtime::move_to_thread`] migrates whole
//! parentless subtrees together with their queued events and timers.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};

use crate::connection::{ConnectionData, ConnectionSummary};
use crate::error::{Result, TetherError};
use crate::event::Event;
use crate::logging::targets;
use crate::meta::{
    Context, MetaArgs, MetaCall, MetaError, MetaObject, DESTROYED_SIGNAL,
    OBJECT_META, OBJECT_NAME_CHANGED_SIGNAL,
};
use crate::pool_lock::PoolCell;
use crate::runtime::Runtime;
use crate::thread_check::require_thread;
use crate::thread_data::{ThreadData, ThreadHandle};
use crate::types::{ArgRef, Value};

new_key_type! {
    /// A unique identifier for an object in the runtime.
    ///
    /// `ObjectId`s are stable handles that remain valid even as the object
    /// tree changes. They become invalid when the object is destroyed and are
    /// never reused for another object.
    pub struct ObjectId;
}

impl ObjectId {
    /// Convert the ObjectId to a raw u64 value.
    ///
    /// The raw value can be converted back using [`ObjectId::from_raw`].
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }

    /// Create an ObjectId from a raw u64 value.
    ///
    /// This does not check that the object exists.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from(slotmap::KeyData::from_ffi(raw))
    }
}

/// Errors that can occur during object operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// The object ID is invalid or has been destroyed.
    #[error("Invalid or destroyed object ID")]
    InvalidObjectId,
    /// Attempted to set an object as its own parent or ancestor.
    #[error("Cannot set an object as its own parent or ancestor")]
    CircularParentage,
    /// Only parentless objects can move to another thread.
    #[error("Cannot move an object that has a parent")]
    HasParent,
    /// The target thread has already exited.
    #[error("The target thread has finished")]
    ThreadFinished,
    /// A dynamic property held a value of another type.
    #[error("Property type mismatch: expected {expected}")]
    PropertyTypeMismatch {
        /// The requested type name.
        expected: &'static str,
    },
}

/// Result type for object operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Behavior every object type provides.
///
/// `#[derive(Object)]` from `tether-macros` implements this trait together
/// with the type's [`MetaObject`].
pub trait Object: Any + Send + Sync {
    /// The static descriptor of the concrete type.
    fn meta_object(&self) -> &'static MetaObject;

    /// Handle an event delivered to this object.
    ///
    /// Return `true` when the event was handled. Unhandled
    /// [`Event::Quit`] exits the innermost loop of the object's thread.
    fn event(&self, _ctx: &Context, _event: &mut Event) -> bool {
        false
    }
}

/// An object with only the root class's members.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainObject;

impl Object for PlainObject {
    fn meta_object(&self) -> &'static MetaObject {
        &OBJECT_META
    }
}

/// A freshly constructed instance, as returned by the
/// [`MetaCall::CreateInstance`] seam.
#[derive(Clone)]
pub struct NewObject {
    instance: Arc<dyn Object>,
    any: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl NewObject {
    /// Wrap a value for insertion into the runtime.
    pub fn new<T: Object>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            instance: value.clone(),
            any: value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The class name of the wrapped instance.
    pub fn class_name(&self) -> &'static str {
        self.instance.meta_object().class_name
    }
}

impl fmt::Debug for NewObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewObject")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Runtime-side state of one object.
pub(crate) struct ObjectNode {
    pub(crate) id: ObjectId,
    pub(crate) instance: Arc<dyn Object>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
    pub(crate) meta: &'static MetaObject,
    pub(crate) type_name: &'static str,
    thread: RwLock<Arc<ThreadData>>,
    pub(crate) signals_blocked: AtomicBool,
    pub(crate) posted_events: AtomicUsize,
    pub(crate) deleting: AtomicBool,
    pub(crate) delete_later_called: AtomicBool,
    pub(crate) connections: PoolCell<ConnectionData>,
    pub(crate) summary: ConnectionSummary,
}

impl ObjectNode {
    pub(crate) fn thread_data(&self) -> Arc<ThreadData> {
        self.thread.read().clone()
    }

    pub(crate) fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    /// Borrow the instance as a reflection target.
    pub(crate) fn instance_any(&self) -> &dyn Any {
        &*self.any
    }
}

impl fmt::Debug for ObjectNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectNode")
            .field("id", &self.id)
            .field("class", &self.meta.class_name)
            .field("deleting", &self.is_deleting())
            .finish()
    }
}

/// Internal data stored in the arena for each object.
struct ObjectData {
    node: Arc<ObjectNode>,
    name: String,
    parent: Option<ObjectId>,
    /// Slots are cleared while the parent is being destroyed.
    children: Vec<Option<ObjectId>>,
    dynamic_properties: HashMap<String, Arc<dyn Any + Send + Sync>>,
    pinned: bool,
}

impl ObjectData {
    fn children(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.children.iter().flatten().copied()
    }
}

/// The arena of live objects and their relationships.
pub(crate) struct ObjectRegistry {
    objects: SlotMap<ObjectId, ObjectData>,
}

impl ObjectRegistry {
    pub(crate) fn new() -> Self {
        Self {
            objects: SlotMap::with_key(),
        }
    }

    fn insert(&mut self, make: impl FnOnce(ObjectId) -> Arc<ObjectNode>) -> ObjectId {
        self.objects.insert_with_key(|id| ObjectData {
            node: make(id),
            name: String::new(),
            parent: None,
            children: Vec::new(),
            dynamic_properties: HashMap::new(),
            pinned: false,
        })
    }

    fn data(&self, id: ObjectId) -> ObjectResult<&ObjectData> {
        self.objects.get(id).ok_or(ObjectError::InvalidObjectId)
    }

    fn data_mut(&mut self, id: ObjectId) -> ObjectResult<&mut ObjectData> {
        self.objects.get_mut(id).ok_or(ObjectError::InvalidObjectId)
    }

    pub(crate) fn node(&self, id: ObjectId) -> Option<Arc<ObjectNode>> {
        self.objects.get(id).map(|d| d.node.clone())
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if `potential_ancestor` is `id` or one of its ancestors.
    fn is_ancestor_of(&self, potential_ancestor: ObjectId, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == potential_ancestor {
                return true;
            }
            current = self.objects.get(current_id).and_then(|d| d.parent);
        }
        false
    }

    /// Relink `id` under `new_parent`. Returns the previous parent.
    fn set_parent(
        &mut self,
        id: ObjectId,
        new_parent: Option<ObjectId>,
    ) -> ObjectResult<Option<ObjectId>> {
        self.data(id)?;
        if let Some(parent_id) = new_parent {
            self.data(parent_id)?;
            if self.is_ancestor_of(id, parent_id) {
                return Err(ObjectError::CircularParentage);
            }
        }

        let old_parent = self.data(id)?.parent;
        if let Some(old_parent_id) = old_parent {
            if let Some(parent_data) = self.objects.get_mut(old_parent_id) {
                parent_data.children.retain(|&child| child != Some(id));
            }
        }
        self.data_mut(id)?.parent = new_parent;
        if let Some(parent_id) = new_parent {
            self.data_mut(parent_id)?.children.push(Some(id));
        }
        Ok(old_parent)
    }

    pub(crate) fn parent(&self, id: ObjectId) -> ObjectResult<Option<ObjectId>> {
        self.data(id).map(|d| d.parent)
    }

    pub(crate) fn children(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        self.data(id).map(|d| d.children().collect())
    }

    pub(crate) fn name(&self, id: ObjectId) -> ObjectResult<&str> {
        self.data(id).map(|d| d.name.as_str())
    }

    pub(crate) fn type_name(&self, id: ObjectId) -> ObjectResult<&'static str> {
        self.data(id).map(|d| d.node.type_name)
    }

    pub(crate) fn class_name(&self, id: ObjectId) -> ObjectResult<&'static str> {
        self.data(id).map(|d| d.node.meta.class_name)
    }

    fn find_child_by_name(&self, id: ObjectId, name: &str) -> ObjectResult<Option<ObjectId>> {
        Ok(self
            .data(id)?
            .children()
            .find(|&child| self.objects.get(child).is_some_and(|d| d.name == name)))
    }

    fn find_children_by_type(&self, id: ObjectId, target: TypeId) -> ObjectResult<Vec<ObjectId>> {
        Ok(self
            .data(id)?
            .children()
            .filter(|&child| {
                self.objects
                    .get(child)
                    .is_some_and(|d| (*d.node.any).type_id() == target)
            })
            .collect())
    }

    fn find_descendants_by_name(
        &self,
        id: ObjectId,
        name: &str,
        result: &mut Vec<ObjectId>,
    ) -> ObjectResult<()> {
        for child_id in self.children(id)? {
            if self.objects.get(child_id).is_some_and(|d| d.name == name) {
                result.push(child_id);
            }
            self.find_descendants_by_name(child_id, name, result)?;
        }
        Ok(())
    }

    pub(crate) fn root_objects(&self) -> Vec<ObjectId> {
        self.objects
            .iter()
            .filter(|(_, data)| data.parent.is_none())
            .map(|(id, _)| id)
            .collect()
    }

    fn siblings(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        match self.data(id)?.parent {
            Some(parent_id) => Ok(self
                .data(parent_id)?
                .children()
                .filter(|&child| child != id)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    fn sibling_index(&self, id: ObjectId) -> ObjectResult<Option<usize>> {
        match self.data(id)?.parent {
            Some(parent_id) => Ok(self.data(parent_id)?.children().position(|c| c == id)),
            None => Ok(None),
        }
    }

    fn ancestors(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        let mut result = Vec::new();
        let mut current = self.data(id)?.parent;
        while let Some(current_id) = current {
            result.push(current_id);
            current = self.objects.get(current_id).and_then(|d| d.parent);
        }
        Ok(result)
    }

    pub(crate) fn preorder(&self, id: ObjectId, result: &mut Vec<ObjectId>) -> ObjectResult<()> {
        let data = self.data(id)?;
        result.push(id);
        for child_id in data.children() {
            self.preorder(child_id, result)?;
        }
        Ok(())
    }

    fn postorder(&self, id: ObjectId, result: &mut Vec<ObjectId>) -> ObjectResult<()> {
        let data = self.data(id)?;
        for child_id in data.children() {
            self.postorder(child_id, result)?;
        }
        result.push(id);
        Ok(())
    }

    fn breadth_first(&self, id: ObjectId) -> ObjectResult<Vec<ObjectId>> {
        self.data(id)?;
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current_id) = queue.pop_front() {
            result.push(current_id);
            if let Some(data) = self.objects.get(current_id) {
                queue.extend(data.children());
            }
        }
        Ok(result)
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub(crate) fn node(&self, id: ObjectId) -> Option<Arc<ObjectNode>> {
        self.inner.objects.read().node(id)
    }

    pub(crate) fn with_objects<R>(&self, f: impl FnOnce(&ObjectRegistry) -> R) -> R {
        f(&self.inner.objects.read())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Insert `value` as a new object owned by the calling thread.
    ///
    /// A `parent` must live on the calling thread.
    pub fn create<T: Object>(&self, value: T, parent: Option<ObjectId>) -> Result<ObjectId> {
        self.insert_object(NewObject::new(value), parent)
    }

    /// Create an object with no members beyond the root class.
    pub fn create_plain(&self, parent: Option<ObjectId>) -> Result<ObjectId> {
        self.create(PlainObject, parent)
    }

    /// Construct an instance of `meta` through its constructor seam.
    ///
    /// The first constructor declared by `meta` whose arity matches `args`
    /// is used.
    pub fn create_instance(
        &self,
        meta: &'static MetaObject,
        args: &[ArgRef<'_>],
        parent: Option<ObjectId>,
    ) -> Result<ObjectId> {
        let index = meta
            .methods
            .iter()
            .position(|m| {
                m.kind == crate::meta::MethodKind::Constructor && m.arity() == args.len()
            })
            .map(|local| meta.method_offset() + local)
            .ok_or(MetaError::NotCreatable(meta.class_name))?;
        let mut call_args = MetaArgs::new(args).with_types(self.types());
        meta.invoke(None, MetaCall::CreateInstance, index, &mut call_args)?;
        let created = call_args
            .take_return_as::<NewObject>()
            .ok_or(MetaError::NotCreatable(meta.class_name))?;
        self.insert_object(created, parent)
    }

    fn insert_object(&self, created: NewObject, parent: Option<ObjectId>) -> Result<ObjectId> {
        self.ensure_running()?;
        let thread = self.current_thread_data();
        if let Some(parent) = parent {
            let parent_node = self.node(parent).ok_or(ObjectError::InvalidObjectId)?;
            let parent_thread = parent_node.thread_data();
            if !Arc::ptr_eq(&parent_thread, &thread) {
                return Err(TetherError::cross_thread("create child", parent_thread.id));
            }
        }

        let NewObject {
            instance,
            any,
            type_name,
        } = created;
        let meta = instance.meta_object();
        let id = {
            let mut objects = self.inner.objects.write();
            let id = objects.insert(|id| {
                Arc::new(ObjectNode {
                    id,
                    instance,
                    any,
                    meta,
                    type_name,
                    thread: RwLock::new(thread.clone()),
                    signals_blocked: AtomicBool::new(false),
                    posted_events: AtomicUsize::new(0),
                    deleting: AtomicBool::new(false),
                    delete_later_called: AtomicBool::new(false),
                    connections: PoolCell::new(ConnectionData::new()),
                    summary: ConnectionSummary::new(),
                })
            });
            if let Some(parent) = parent {
                objects.set_parent(id, Some(parent))?;
            }
            id
        };
        tracing::trace!(target: targets::OBJECT, ?id, class = meta.class_name, "object created");

        if let Some(parent) = parent {
            let _ = self.send_event(parent, Event::ChildAdded { child: id });
        }
        Ok(id)
    }

    /// Destroy an object and its whole subtree immediately.
    ///
    /// Must run on the object's thread, unless that thread has exited.
    pub fn destroy(&self, id: ObjectId) -> Result<()> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let data = node.thread_data();
        if !data.is_current() && !data.is_finished() {
            require_thread("destroy", data.id)?;
        }
        self.destroy_node(&node);
        Ok(())
    }

    pub(crate) fn destroy_node(&self, node: &Arc<ObjectNode>) {
        if node.deleting.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = node.id;
        tracing::trace!(target: targets::OBJECT, ?id, class = node.meta.class_name, "destroying object");

        self.emit(id, DESTROYED_SIGNAL, &[&id]);
        self.sever_connections(node);

        let mut index = 0;
        loop {
            let child = {
                let mut objects = self.inner.objects.write();
                let Ok(data) = objects.data_mut(id) else {
                    break;
                };
                let Some(slot) = data.children.get_mut(index) else {
                    break;
                };
                index += 1;
                slot.take()
            };
            if let Some(child) = child.and_then(|c| self.node(c)) {
                self.destroy_node(&child);
            }
        }

        let notify_parent = {
            let mut objects = self.inner.objects.write();
            let parent = objects.objects.get(id).and_then(|d| d.parent);
            match parent.and_then(|p| objects.objects.get_mut(p)) {
                Some(parent_data) if !parent_data.node.is_deleting() => {
                    parent_data.children.retain(|&c| c != Some(id));
                    Some(parent_data.node.clone())
                }
                _ => None,
            }
        };
        if let Some(parent) = notify_parent {
            let data = parent.thread_data();
            if data.is_current() {
                self.deliver(&data, &parent, Event::ChildRemoved { child: id });
            }
        }

        self.remove_posted_events_for(node, None);
        let data = node.thread_data();
        data.timers.lock().unregister_object(id);
        self.unregister_notifiers_of(&data, id);

        let removed = self.inner.objects.write().objects.remove(id);
        drop(removed);
        tracing::trace!(target: targets::OBJECT, ?id, "object destroyed");
    }

    /// Whether `id` refers to a live object.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.objects.read().contains(id)
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.inner.objects.read().len()
    }

    /// Objects without a parent.
    pub fn root_objects(&self) -> Vec<ObjectId> {
        self.inner.objects.read().root_objects()
    }

    /// The instance behind `id`, if it is a `T`.
    pub fn get<T: Object>(&self, id: ObjectId) -> Option<Arc<T>> {
        let node = self.node(id)?;
        node.any.clone().downcast::<T>().ok()
    }

    /// The descriptor of the object's class.
    pub fn meta_object_of(&self, id: ObjectId) -> Option<&'static MetaObject> {
        self.node(id).map(|n| n.meta)
    }

    /// Whether the object's class is `meta` or derives from it.
    pub fn inherits(&self, id: ObjectId, meta: &MetaObject) -> bool {
        self.node(id).is_some_and(|n| n.meta.inherits(meta))
    }

    // =========================================================================
    // Tree
    // =========================================================================

    /// Reparent `id`. Passing `None` makes it a root object.
    ///
    /// Both objects must live on the calling thread. The old parent receives
    /// [`Event::ChildRemoved`], the new one [`Event::ChildAdded`].
    pub fn set_parent(&self, id: ObjectId, parent: Option<ObjectId>) -> Result<()> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let thread = node.thread_data();
        require_thread("set_parent", thread.id)?;
        if let Some(parent) = parent {
            let parent_node = self.node(parent).ok_or(ObjectError::InvalidObjectId)?;
            if !Arc::ptr_eq(&parent_node.thread_data(), &thread) {
                return Err(TetherError::cross_thread(
                    "set_parent",
                    parent_node.thread_data().id,
                ));
            }
        }

        let old_parent = self.inner.objects.write().set_parent(id, parent)?;
        if old_parent == parent {
            return Ok(());
        }
        tracing::trace!(target: targets::OBJECT, ?id, ?old_parent, new_parent = ?parent, "reparented");
        if let Some(old) = old_parent {
            let _ = self.send_event(old, Event::ChildRemoved { child: id });
        }
        if let Some(new) = parent {
            let _ = self.send_event(new, Event::ChildAdded { child: id });
        }
        Ok(())
    }

    /// The parent of `id`.
    pub fn parent(&self, id: ObjectId) -> Option<ObjectId> {
        self.inner.objects.read().parent(id).ok().flatten()
    }

    /// Children of `id` in insertion order.
    pub fn children(&self, id: ObjectId) -> Vec<ObjectId> {
        self.inner.objects.read().children(id).unwrap_or_default()
    }

    /// First direct child named `name`.
    pub fn find_child_by_name(&self, id: ObjectId, name: &str) -> Option<ObjectId> {
        self.inner
            .objects
            .read()
            .find_child_by_name(id, name)
            .ok()
            .flatten()
    }

    /// Direct children whose instance is a `T`.
    pub fn find_children_by_type<T: Object>(&self, id: ObjectId) -> Vec<ObjectId> {
        self.inner
            .objects
            .read()
            .find_children_by_type(id, TypeId::of::<T>())
            .unwrap_or_default()
    }

    /// All descendants named `name`, depth first.
    pub fn find_descendants_by_name(&self, id: ObjectId, name: &str) -> Vec<ObjectId> {
        let mut result = Vec::new();
        let _ = self
            .inner
            .objects
            .read()
            .find_descendants_by_name(id, name, &mut result);
        result
    }

    /// Other children of the same parent.
    pub fn siblings(&self, id: ObjectId) -> Vec<ObjectId> {
        self.inner.objects.read().siblings(id).unwrap_or_default()
    }

    /// Position of `id` among its siblings.
    pub fn sibling_index(&self, id: ObjectId) -> Option<usize> {
        self.inner.objects.read().sibling_index(id).ok().flatten()
    }

    /// Ancestors from the immediate parent up to the root.
    pub fn ancestors(&self, id: ObjectId) -> Vec<ObjectId> {
        self.inner.objects.read().ancestors(id).unwrap_or_default()
    }

    /// Subtree of `id`, parents before children.
    pub fn depth_first_preorder(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut result = Vec::new();
        let _ = self.inner.objects.read().preorder(id, &mut result);
        result
    }

    /// Subtree of `id`, children before parents.
    pub fn depth_first_postorder(&self, id: ObjectId) -> Vec<ObjectId> {
        let mut result = Vec::new();
        let _ = self.inner.objects.read().postorder(id, &mut result);
        result
    }

    /// Subtree of `id`, level by level.
    pub fn breadth_first(&self, id: ObjectId) -> Vec<ObjectId> {
        self.inner
            .objects
            .read()
            .breadth_first(id)
            .unwrap_or_default()
    }

    // =========================================================================
    // Names and dynamic properties
    // =========================================================================

    /// The object's name.
    pub fn object_name(&self, id: ObjectId) -> Option<String> {
        self.inner.objects.read().name(id).ok().map(str::to_owned)
    }

    /// Rename the object, emitting `object_name_changed` when it changes.
    pub fn set_object_name(&self, id: ObjectId, name: impl Into<String>) -> bool {
        let name = name.into();
        let changed = {
            let mut objects = self.inner.objects.write();
            match objects.data_mut(id) {
                Ok(data) if data.name != name => {
                    data.name = name.clone();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(id, OBJECT_NAME_CHANGED_SIGNAL, &[&name]);
        }
        changed
    }

    /// Rust type name of the instance.
    pub fn type_name(&self, id: ObjectId) -> Option<&'static str> {
        self.inner.objects.read().type_name(id).ok()
    }

    /// Store a dynamic property, replacing any previous value.
    pub fn set_dynamic_property<T: Any + Send + Sync>(
        &self,
        id: ObjectId,
        name: impl Into<String>,
        value: T,
    ) -> Result<()> {
        let mut objects = self.inner.objects.write();
        let data = objects.data_mut(id)?;
        data.dynamic_properties.insert(name.into(), Arc::new(value));
        Ok(())
    }

    /// Read a dynamic property.
    pub fn dynamic_property<T: Any + Send + Sync>(
        &self,
        id: ObjectId,
        name: &str,
    ) -> Result<Option<Arc<T>>> {
        let objects = self.inner.objects.read();
        let Some(value) = objects.data(id)?.dynamic_properties.get(name).cloned() else {
            return Ok(None);
        };
        drop(objects);
        value
            .downcast::<T>()
            .map(Some)
            .map_err(|_| {
                ObjectError::PropertyTypeMismatch {
                    expected: std::any::type_name::<T>(),
                }
                .into()
            })
    }

    /// Remove a dynamic property. Returns whether it existed.
    pub fn remove_dynamic_property(&self, id: ObjectId, name: &str) -> Result<bool> {
        let removed = self
            .inner
            .objects
            .write()
            .data_mut(id)?
            .dynamic_properties
            .remove(name);
        Ok(removed.is_some())
    }

    /// Names of all dynamic properties, sorted.
    pub fn dynamic_property_names(&self, id: ObjectId) -> Vec<String> {
        let objects = self.inner.objects.read();
        let mut names: Vec<String> = objects
            .data(id)
            .map(|d| d.dynamic_properties.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    // =========================================================================
    // Signals and affinity flags
    // =========================================================================

    /// Block or unblock signal emission. Returns the previous state.
    ///
    /// `destroyed` is emitted regardless.
    pub fn block_signals(&self, id: ObjectId, block: bool) -> bool {
        self.node(id)
            .is_some_and(|n| n.signals_blocked.swap(block, Ordering::AcqRel))
    }

    /// Whether emission from `id` is blocked.
    pub fn signals_blocked(&self, id: ObjectId) -> bool {
        self.node(id)
            .is_some_and(|n| n.signals_blocked.load(Ordering::Acquire))
    }

    /// Pin or unpin an object to its current thread.
    pub fn set_pinned(&self, id: ObjectId, pinned: bool) -> Result<()> {
        self.inner.objects.write().data_mut(id)?.pinned = pinned;
        Ok(())
    }

    /// Whether the object refuses to migrate.
    pub fn is_pinned(&self, id: ObjectId) -> bool {
        self.inner
            .objects
            .read()
            .data(id)
            .is_ok_and(|d| d.pinned)
    }

    /// Move a parentless object and its subtree to `target`.
    ///
    /// Pending events and timers follow the objects. Every migrating object
    /// receives [`Event::ThreadChange`] on its old thread first.
    pub fn move_to_thread(&self, id: ObjectId, target: &ThreadHandle) -> Result<()> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let from = node.thread_data();
        let to = target.data.clone();
        if Arc::ptr_eq(&from, &to) {
            return Ok(());
        }
        if !from.is_current() && !from.is_finished() {
            require_thread("move_to_thread", from.id)?;
        }
        if to.is_finished() {
            return Err(ObjectError::ThreadFinished.into());
        }

        let subtree = {
            let objects = self.inner.objects.read();
            let data = objects.data(id)?;
            if data.parent.is_some() {
                return Err(ObjectError::HasParent.into());
            }
            let mut subtree = Vec::new();
            objects.preorder(id, &mut subtree)?;
            let mut nodes = Vec::with_capacity(subtree.len());
            for member in subtree {
                let data = objects.data(member)?;
                if data.pinned {
                    return Err(TetherError::AffinityPinned);
                }
                nodes.push(data.node.clone());
            }
            nodes
        };

        for member in &subtree {
            self.deliver(&from, member, Event::ThreadChange);
        }

        let moving: HashSet<ObjectId> = subtree.iter().map(|n| n.id).collect();
        {
            let from_first = Arc::as_ptr(&from) < Arc::as_ptr(&to);
            let (first, second) = if from_first { (&from, &to) } else { (&to, &from) };
            let mut first_queue = first.queue.lock();
            let mut second_queue = second.queue.lock();
            let (from_queue, to_queue) = if from_first {
                (&mut *first_queue, &mut *second_queue)
            } else {
                (&mut *second_queue, &mut *first_queue)
            };
            let events = from_queue.extract_for(&moving);
            to_queue.adopt(events);
            to_queue.can_wait = false;
            for member in &subtree {
                *member.thread.write() = to.clone();
            }
        }

        let timers = from.timers.lock().extract_for(&moving);
        to.timers.lock().adopt(timers);

        let notifiers: Vec<_> = {
            let mut table = from.notifiers.lock();
            let moved: Vec<_> = table
                .iter()
                .filter(|(_, owner)| moving.contains(owner))
                .map(|(d, o)| (*d, *o))
                .collect();
            for (descriptor, _) in &moved {
                table.remove(descriptor);
            }
            moved
        };
        for (descriptor, owner) in notifiers {
            from.source.unregister(descriptor);
            to.notifiers.lock().insert(descriptor, owner);
            to.source.register(descriptor);
        }

        tracing::debug!(
            target: targets::OBJECT,
            ?id,
            objects = subtree.len(),
            from = ?from.id,
            to = ?to.id,
            "moved to thread"
        );
        to.wake();
        Ok(())
    }

    // =========================================================================
    // Reflection
    // =========================================================================

    fn seam_call(
        &self,
        node: &ObjectNode,
        call: MetaCall,
        index: usize,
        args: &[ArgRef<'_>],
    ) -> Result<Option<Value>> {
        let ctx = Context::new(self.clone(), node.id, None);
        let mut meta_args = MetaArgs::new(args).with_context(&ctx);
        node.meta
            .invoke(Some(node.instance_any()), call, index, &mut meta_args)?;
        Ok(meta_args.take_return())
    }

    /// Invoke method `index` (absolute) synchronously on the calling thread.
    pub fn invoke_method(
        &self,
        id: ObjectId,
        index: usize,
        args: &[ArgRef<'_>],
    ) -> Result<Option<Value>> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let method = node.meta.method(index).ok_or(MetaError::InvalidIndex {
            class: node.meta.class_name,
            index,
        })?;
        if args.len() < method.arity() {
            return Err(MetaError::MissingArgument(args.len()).into());
        }
        self.seam_call(&node, MetaCall::InvokeMethod, index, args)
    }

    /// Invoke the method matching `signature` synchronously.
    pub fn invoke_method_by_signature(
        &self,
        id: ObjectId,
        signature: &str,
        args: &[ArgRef<'_>],
    ) -> Result<Option<Value>> {
        let meta = self.meta_object_of(id).ok_or(ObjectError::InvalidObjectId)?;
        let index = meta
            .index_of_method(signature)
            .ok_or(MetaError::NoSuchMethod(signature.to_string()))?;
        self.invoke_method(id, index, args)
    }

    fn property_index(&self, node: &ObjectNode, name: &str) -> Result<usize> {
        node.meta
            .index_of_property(name)
            .ok_or_else(|| MetaError::NoSuchProperty(name.to_string()).into())
    }

    /// Read a declared property by name.
    pub fn read_property(&self, id: ObjectId, name: &str) -> Result<Value> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let index = self.property_index(&node, name)?;
        self.seam_call(&node, MetaCall::ReadProperty, index, &[])?
            .ok_or_else(|| MetaError::PropertyAccess(name.to_string()).into())
    }

    /// Write a declared property by name.
    pub fn write_property(&self, id: ObjectId, name: &str, value: ArgRef<'_>) -> Result<()> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let index = self.property_index(&node, name)?;
        let writable = node.meta.property(index).is_some_and(|p| p.descriptor.is_writable());
        if !writable {
            return Err(MetaError::PropertyAccess(name.to_string()).into());
        }
        self.seam_call(&node, MetaCall::WriteProperty, index, &[value])?;
        Ok(())
    }

    /// Reset a resettable property to its default.
    pub fn reset_property(&self, id: ObjectId, name: &str) -> Result<()> {
        let node = self.node(id).ok_or(ObjectError::InvalidObjectId)?;
        let index = self.property_index(&node, name)?;
        let resettable = node
            .meta
            .property(index)
            .is_some_and(|p| p.descriptor.is_resettable());
        if !resettable {
            return Err(MetaError::PropertyAccess(name.to_string()).into());
        }
        self.seam_call(&node, MetaCall::ResetProperty, index, &[])?;
        Ok(())
    }
}
