//! Per-type reflection descriptors and the generic invocation seam.
//!
//! Every object type exposes one `static` [`MetaObject`] describing its
//! methods, signals, slots, properties, enums and class info, plus a link to
//! its superclass descriptor. Tables are local to each class; absolute indices
//! are obtained by adding the summed counts of the superclass chain
//! (see [`MetaObject::method_offset`]).
//!
//! All reflection-driven behavior funnels through a single function per type,
//! [`StaticMetaCall`], selected by a [`MetaCall`] kind. The runtime never calls
//! per-member thunks; it calls [`MetaObject::invoke`] with an absolute index and
//! lets the chain walk route the call to the class that declares the member.
//!
//! Descriptors are normally generated by `#[derive(Object)]` from the
//! `tether-macros` crate, but they are plain data and can be written by hand:
//!
//! ```
//! use tether_core::meta::{MetaObject, MethodDescriptor, OBJECT_META};
//!
//! static METHODS: [MethodDescriptor; 1] = [MethodDescriptor::signal("ticked", &["u64"])];
//!
//! static CLOCK_META: MetaObject = MetaObject {
//!     class_name: "Clock",
//!     superclass: Some(&OBJECT_META),
//!     methods: &METHODS,
//!     properties: &[],
//!     enums: &[],
//!     class_info: &[],
//!     static_call: None,
//!     upcast: None,
//! };
//!
//! let ticked = CLOCK_META.index_of_signal("ticked(u64)").unwrap();
//! assert_eq!(ticked, CLOCK_META.method_offset());
//! ```

use std::any::Any;
use std::fmt;

use crate::logging::targets;
use crate::object::ObjectId;
use crate::runtime::Runtime;
use crate::types::{normalize_type_name, ArgRef, MetaTypeId, TypeRegistry, Value};

/// Errors raised by the invocation seam.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    /// The absolute index does not name a member of the class chain.
    #[error("Index {index} is out of range for class '{class}'")]
    InvalidIndex {
        /// Most-derived class the call was made on.
        class: &'static str,
        /// The offending index.
        index: usize,
    },
    /// The class declares members but provides no invocation seam.
    #[error("Class '{0}' has no invocation seam")]
    NoStaticCall(&'static str),
    /// The instance handed to the seam is not of the expected class.
    #[error("Instance is not a '{0}'")]
    InstanceMismatch(&'static str),
    /// An argument slot holds a value of the wrong type.
    #[error("Argument {position} is not a '{expected}'")]
    ArgumentMismatch {
        /// Zero-based argument position.
        position: usize,
        /// Expected Rust type name.
        expected: &'static str,
    },
    /// Fewer argument slots were supplied than the member requires.
    #[error("Missing argument {0}")]
    MissingArgument(usize),
    /// The call needs a [`Context`] (slot invocation, signal emission).
    #[error("Call requires an invocation context")]
    MissingContext,
    /// No method matches the signature.
    #[error("No method matching '{0}'")]
    NoSuchMethod(String),
    /// No property with this name exists in the class chain.
    #[error("No property named '{0}'")]
    NoSuchProperty(String),
    /// The property does not support the requested access.
    #[error("Property '{0}' does not support this access")]
    PropertyAccess(String),
    /// The class has no constructor matching the request.
    #[error("Class '{0}' cannot be instantiated dynamically")]
    NotCreatable(&'static str),
    /// The seam does not implement this call kind for the given member.
    #[error("{0:?} is not supported for this member")]
    Unsupported(MetaCall),
}

/// Result alias for seam operations.
pub type MetaResult<T> = std::result::Result<T, MetaError>;

/// Kind of a method table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// An invokable method that is neither a signal nor a slot.
    Method,
    /// A notification point; invoking it emits.
    Signal,
    /// A connectable target.
    Slot,
    /// A factory reachable through [`MetaCall::CreateInstance`].
    Constructor,
}

/// Declared access of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    /// Only callable by the declaring type.
    Private,
    /// Callable by the declaring type and its subclasses.
    Protected,
    /// Callable by anyone.
    #[default]
    Public,
}

/// The call kinds accepted by the invocation seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaCall {
    /// Store the property value into the return slot.
    ReadProperty,
    /// Assign argument 0 to the property.
    WriteProperty,
    /// Restore the property's default.
    ResetProperty,
    /// Call a method, slot or signal with the argument slots.
    InvokeMethod,
    /// Run a constructor, returning a [`NewObject`](crate::object::NewObject).
    CreateInstance,
    /// Map a method name (argument 0, `String`) to a local index.
    IndexOfMethod,
    /// Register the type of parameter `argument 0` (`usize`) of a method and
    /// return its [`MetaTypeId`].
    RegisterArgumentType,
}

/// The per-type invocation seam.
///
/// Arguments are the instance (absent for constructors and static lookups),
/// the call kind, the class-local member index and the argument slots.
pub type StaticMetaCall =
    fn(Option<&dyn Any>, MetaCall, usize, &mut MetaArgs<'_>) -> MetaResult<()>;

/// Maps an instance of a class to the embedded instance of its superclass.
pub type Upcast = fn(&dyn Any) -> Option<&dyn Any>;

/// Descriptor of one method, signal, slot or constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Method name without parameters.
    pub name: &'static str,
    /// What kind of member this is.
    pub kind: MethodKind,
    /// Declared access.
    pub access: Access,
    /// Parameter type names in declaration order.
    pub parameter_types: &'static [&'static str],
    /// Return type name, if the method returns a value.
    pub return_type: Option<&'static str>,
}

impl MethodDescriptor {
    const fn with_kind(
        name: &'static str,
        kind: MethodKind,
        parameter_types: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind,
            access: Access::Public,
            parameter_types,
            return_type: None,
        }
    }

    /// A signal descriptor.
    pub const fn signal(name: &'static str, parameter_types: &'static [&'static str]) -> Self {
        Self::with_kind(name, MethodKind::Signal, parameter_types)
    }

    /// A slot descriptor.
    pub const fn slot(name: &'static str, parameter_types: &'static [&'static str]) -> Self {
        Self::with_kind(name, MethodKind::Slot, parameter_types)
    }

    /// A plain invokable method descriptor.
    pub const fn method(name: &'static str, parameter_types: &'static [&'static str]) -> Self {
        Self::with_kind(name, MethodKind::Method, parameter_types)
    }

    /// A constructor descriptor.
    pub const fn constructor(parameter_types: &'static [&'static str]) -> Self {
        Self::with_kind("new", MethodKind::Constructor, parameter_types)
    }

    /// Set the return type.
    pub const fn returning(mut self, return_type: &'static str) -> Self {
        self.return_type = Some(return_type);
        self
    }

    /// Set the access level.
    pub const fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Number of parameters.
    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }

    /// Normalized `name(T1,T2)` form.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameter_types
            .iter()
            .map(|t| normalize_type_name(t))
            .collect();
        format!("{}({})", self.name, params.join(","))
    }

    /// Resolve the parameter types through `types`.
    ///
    /// Unregistered names map to [`MetaTypeId::INVALID`].
    pub fn parameter_type_ids(&self, types: &TypeRegistry) -> Vec<MetaTypeId> {
        self.parameter_types.iter().map(|t| types.lookup(t)).collect()
    }

    fn matches(&self, name: &str, params: &[String]) -> bool {
        self.name == name
            && self.parameter_types.len() == params.len()
            && self
                .parameter_types
                .iter()
                .zip(params)
                .all(|(declared, wanted)| normalize_type_name(declared) == *wanted)
    }
}

/// Capability flags of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PropertyFlags(u8);

impl PropertyFlags {
    /// No capabilities.
    pub const NONE: Self = Self(0);
    /// The property can be read.
    pub const READABLE: Self = Self(1);
    /// The property can be written.
    pub const WRITABLE: Self = Self(1 << 1);
    /// The property can be reset to a default.
    pub const RESETTABLE: Self = Self(1 << 2);

    /// Combine two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PropertyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Descriptor of one property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyDescriptor {
    /// Property name.
    pub name: &'static str,
    /// Value type name.
    pub type_name: &'static str,
    /// Read/write/reset capabilities.
    pub flags: PropertyFlags,
    /// Class-local index of the notify signal.
    pub notify: Option<usize>,
}

impl PropertyDescriptor {
    /// A read-only property.
    pub const fn read_only(name: &'static str, type_name: &'static str) -> Self {
        Self {
            name,
            type_name,
            flags: PropertyFlags::READABLE,
            notify: None,
        }
    }

    /// A readable and writable property.
    pub const fn read_write(name: &'static str, type_name: &'static str) -> Self {
        Self {
            name,
            type_name,
            flags: PropertyFlags::READABLE.union(PropertyFlags::WRITABLE),
            notify: None,
        }
    }

    /// Attach a notify signal by class-local method index.
    pub const fn with_notify(mut self, local_signal: usize) -> Self {
        self.notify = Some(local_signal);
        self
    }

    /// Mark the property resettable.
    pub const fn resettable(mut self) -> Self {
        self.flags = self.flags.union(PropertyFlags::RESETTABLE);
        self
    }

    /// Whether the property can be read.
    pub fn is_readable(&self) -> bool {
        self.flags.contains(PropertyFlags::READABLE)
    }

    /// Whether the property can be written.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PropertyFlags::WRITABLE)
    }

    /// Whether the property can be reset.
    pub fn is_resettable(&self) -> bool {
        self.flags.contains(PropertyFlags::RESETTABLE)
    }
}

/// Descriptor of an enum or flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumDescriptor {
    /// Enum name.
    pub name: &'static str,
    /// Whether values combine as bit flags.
    pub is_flag: bool,
    /// Keys and their values, in declaration order.
    pub keys: &'static [(&'static str, i64)],
}

impl EnumDescriptor {
    /// Value of `key`.
    pub fn value_of(&self, key: &str) -> Option<i64> {
        self.keys.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// First key with `value`.
    pub fn key_of(&self, value: i64) -> Option<&'static str> {
        self.keys.iter().find(|(_, v)| *v == value).map(|(k, _)| *k)
    }

    /// For flag enums, the `|`-joined keys covering `value`.
    pub fn keys_of(&self, value: i64) -> Option<String> {
        if !self.is_flag {
            return self.key_of(value).map(str::to_string);
        }
        let mut remaining = value;
        let mut parts = Vec::new();
        for (key, bits) in self.keys {
            if *bits != 0 && value & bits == *bits {
                parts.push(*key);
                remaining &= !bits;
            }
        }
        (remaining == 0).then(|| parts.join("|"))
    }
}

/// A key/value annotation attached to a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassInfo {
    /// Annotation key.
    pub name: &'static str,
    /// Annotation value.
    pub value: &'static str,
}

/// Reflection descriptor of one class.
///
/// Always stored in a `static`; all methods take `&'static self` so resolved
/// handles ([`MetaMethod`], [`MetaProperty`]) can outlive the call.
pub struct MetaObject {
    /// Class name.
    pub class_name: &'static str,
    /// Superclass descriptor, `None` only for the root class.
    pub superclass: Option<&'static MetaObject>,
    /// Local method table: signals, slots, methods and constructors.
    pub methods: &'static [MethodDescriptor],
    /// Local property table.
    pub properties: &'static [PropertyDescriptor],
    /// Local enum table.
    pub enums: &'static [EnumDescriptor],
    /// Local class annotations.
    pub class_info: &'static [ClassInfo],
    /// The invocation seam for local members.
    pub static_call: Option<StaticMetaCall>,
    /// Maps an instance of this class to its superclass part.
    pub upcast: Option<Upcast>,
}

impl fmt::Debug for MetaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaObject")
            .field("class_name", &self.class_name)
            .field("superclass", &self.superclass.map(|s| s.class_name))
            .field("methods", &self.methods.len())
            .field("properties", &self.properties.len())
            .finish()
    }
}

impl PartialEq for MetaObject {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for MetaObject {}

/// A resolved method: owning class, absolute index and descriptor.
#[derive(Debug, Clone, Copy)]
pub struct MetaMethod {
    /// The class declaring the method.
    pub owner: &'static MetaObject,
    /// Absolute index in the most-derived class's numbering.
    pub index: usize,
    /// The method's descriptor.
    pub descriptor: &'static MethodDescriptor,
}

impl MetaMethod {
    /// Method name.
    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    /// Method kind.
    pub fn kind(&self) -> MethodKind {
        self.descriptor.kind
    }

    /// Number of parameters.
    pub fn arity(&self) -> usize {
        self.descriptor.arity()
    }

    /// Normalized signature.
    pub fn signature(&self) -> String {
        self.descriptor.signature()
    }
}

/// A resolved property.
#[derive(Debug, Clone, Copy)]
pub struct MetaProperty {
    /// The class declaring the property.
    pub owner: &'static MetaObject,
    /// Absolute property index.
    pub index: usize,
    /// The property's descriptor.
    pub descriptor: &'static PropertyDescriptor,
}

impl MetaProperty {
    /// Property name.
    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    /// Absolute index of the notify signal.
    pub fn notify_signal(&self) -> Option<usize> {
        self.descriptor
            .notify
            .map(|local| self.owner.method_offset() + local)
    }
}

impl MetaObject {
    /// Iterate from this class up to the root.
    pub fn chain(&'static self) -> impl Iterator<Item = &'static MetaObject> {
        std::iter::successors(Some(self), |m| m.superclass)
    }

    /// Whether this class is `other` or derives from it.
    pub fn inherits(&'static self, other: &MetaObject) -> bool {
        self.chain().any(|m| std::ptr::eq(m, other))
    }

    /// Number of methods declared by all superclasses.
    pub fn method_offset(&self) -> usize {
        self.superclass.map_or(0, |s| s.method_count())
    }

    /// Total methods including superclasses.
    pub fn method_count(&self) -> usize {
        self.method_offset() + self.methods.len()
    }

    /// Number of properties declared by all superclasses.
    pub fn property_offset(&self) -> usize {
        self.superclass.map_or(0, |s| s.property_count())
    }

    /// Total properties including superclasses.
    pub fn property_count(&self) -> usize {
        self.property_offset() + self.properties.len()
    }

    /// Number of enums declared by all superclasses.
    pub fn enum_offset(&self) -> usize {
        self.superclass.map_or(0, |s| s.enum_count())
    }

    /// Total enums including superclasses.
    pub fn enum_count(&self) -> usize {
        self.enum_offset() + self.enums.len()
    }

    /// Number of class-info entries declared by all superclasses.
    pub fn class_info_offset(&self) -> usize {
        self.superclass.map_or(0, |s| s.class_info_count())
    }

    /// Total class-info entries including superclasses.
    pub fn class_info_count(&self) -> usize {
        self.class_info_offset() + self.class_info.len()
    }

    /// The method at absolute `index`.
    pub fn method(&'static self, index: usize) -> Option<MetaMethod> {
        let owner = self.chain().find(|m| index >= m.method_offset())?;
        let descriptor = owner.methods.get(index - owner.method_offset())?;
        Some(MetaMethod {
            owner,
            index,
            descriptor,
        })
    }

    /// The property at absolute `index`.
    pub fn property(&'static self, index: usize) -> Option<MetaProperty> {
        let owner = self.chain().find(|m| index >= m.property_offset())?;
        let descriptor = owner.properties.get(index - owner.property_offset())?;
        Some(MetaProperty {
            owner,
            index,
            descriptor,
        })
    }

    /// The enum at absolute `index`.
    pub fn enumerator(&'static self, index: usize) -> Option<&'static EnumDescriptor> {
        let owner = self.chain().find(|m| index >= m.enum_offset())?;
        owner.enums.get(index - owner.enum_offset())
    }

    fn find_method(
        &'static self,
        signature: &str,
        kind: Option<MethodKind>,
    ) -> Option<usize> {
        let (name, params) = parse_signature(signature)?;
        self.chain().find_map(|m| {
            m.methods
                .iter()
                .position(|d| kind.is_none_or(|k| d.kind == k) && d.matches(&name, &params))
                .map(|local| m.method_offset() + local)
        })
    }

    /// Resolve `name(T1,T2)` against this class, then its superclasses.
    ///
    /// Matching is by name, arity and normalized parameter type names; the
    /// most-derived declaration wins.
    pub fn index_of_method(&'static self, signature: &str) -> Option<usize> {
        self.find_method(signature, None)
    }

    /// Like [`index_of_method`](Self::index_of_method), restricted to signals.
    pub fn index_of_signal(&'static self, signature: &str) -> Option<usize> {
        self.find_method(signature, Some(MethodKind::Signal))
    }

    /// Like [`index_of_method`](Self::index_of_method), restricted to slots.
    pub fn index_of_slot(&'static self, signature: &str) -> Option<usize> {
        self.find_method(signature, Some(MethodKind::Slot))
    }

    /// Like [`index_of_method`](Self::index_of_method), restricted to constructors.
    pub fn index_of_constructor(&'static self, signature: &str) -> Option<usize> {
        let (_, params) = parse_signature(signature)?;
        self.methods
            .iter()
            .position(|d| d.kind == MethodKind::Constructor && d.matches(d.name, &params))
            .map(|local| self.method_offset() + local)
    }

    /// Resolve a method by name and parameter type ids.
    ///
    /// A parameter matches when its declared type resolves to the same id, or
    /// when both sides are unregistered and share a normalized name.
    pub fn index_of_method_by_types(
        &'static self,
        name: &str,
        parameter_types: &[MetaTypeId],
        types: &TypeRegistry,
    ) -> Option<usize> {
        self.chain().find_map(|m| {
            m.methods
                .iter()
                .position(|d| {
                    d.name == name
                        && d.arity() == parameter_types.len()
                        && d.parameter_type_ids(types)
                            .iter()
                            .zip(parameter_types)
                            .all(|(a, b)| a.is_valid() && a == b)
                })
                .map(|local| m.method_offset() + local)
        })
    }

    /// Resolve a bare method name through each class's seam.
    ///
    /// Classes without a seam fall back to a scan of their descriptors.
    pub fn index_of_method_by_name(&'static self, name: &str) -> Option<usize> {
        let key = name.to_string();
        self.chain().find_map(|m| {
            let local = match m.static_call {
                Some(call) => {
                    let slots: [ArgRef<'_>; 1] = [&key];
                    let mut args = MetaArgs::new(&slots);
                    call(None, MetaCall::IndexOfMethod, 0, &mut args).ok()?;
                    args.take_return_as::<usize>()
                }
                None => m.methods.iter().position(|d| d.name == name),
            };
            local.map(|l| m.method_offset() + l)
        })
    }

    /// Absolute index of the property named `name`.
    pub fn index_of_property(&'static self, name: &str) -> Option<usize> {
        self.chain().find_map(|m| {
            m.properties
                .iter()
                .position(|p| p.name == name)
                .map(|local| m.property_offset() + local)
        })
    }

    /// Absolute index of the enum named `name`.
    pub fn index_of_enum(&'static self, name: &str) -> Option<usize> {
        self.chain().find_map(|m| {
            m.enums
                .iter()
                .position(|e| e.name == name)
                .map(|local| m.enum_offset() + local)
        })
    }

    /// Value of the class-info entry `name`, most-derived first.
    pub fn class_info_value(&'static self, name: &str) -> Option<&'static str> {
        self.chain()
            .find_map(|m| m.class_info.iter().find(|c| c.name == name))
            .map(|c| c.value)
    }

    fn offset_for(&self, call: MetaCall) -> usize {
        match call {
            MetaCall::ReadProperty | MetaCall::WriteProperty | MetaCall::ResetProperty => {
                self.property_offset()
            }
            MetaCall::InvokeMethod
            | MetaCall::IndexOfMethod
            | MetaCall::RegisterArgumentType
            | MetaCall::CreateInstance => self.method_offset(),
        }
    }

    fn count_for(&self, call: MetaCall) -> usize {
        match call {
            MetaCall::ReadProperty | MetaCall::WriteProperty | MetaCall::ResetProperty => {
                self.property_count()
            }
            _ => self.method_count(),
        }
    }

    /// Route a call with an absolute index to the declaring class's seam.
    ///
    /// The instance is narrowed through each class's upcast while walking up.
    /// Constructors are local to the class they are called on.
    pub fn invoke(
        &'static self,
        instance: Option<&dyn Any>,
        call: MetaCall,
        index: usize,
        args: &mut MetaArgs<'_>,
    ) -> MetaResult<()> {
        if index >= self.count_for(call) {
            return Err(MetaError::InvalidIndex {
                class: self.class_name,
                index,
            });
        }
        if call == MetaCall::CreateInstance && index < self.method_offset() {
            return Err(MetaError::NotCreatable(self.class_name));
        }

        let mut meta = self;
        let mut instance = instance;
        loop {
            let offset = meta.offset_for(call);
            if index >= offset {
                let static_call = meta
                    .static_call
                    .ok_or(MetaError::NoStaticCall(meta.class_name))?;
                return static_call(instance, call, index - offset, args);
            }
            instance = match (instance, meta.upcast) {
                (Some(inst), Some(up)) => up(inst),
                (inst, None) => inst,
                (None, Some(_)) => None,
            };
            meta = meta.superclass.ok_or(MetaError::InvalidIndex {
                class: self.class_name,
                index,
            })?;
        }
    }

    /// Register the type of parameter `position` of method `index`.
    ///
    /// Falls back to a name lookup when the seam cannot register it.
    pub fn register_argument_type(
        &'static self,
        index: usize,
        position: usize,
        types: &TypeRegistry,
    ) -> MetaTypeId {
        let method = match self.method(index) {
            Some(m) => m,
            None => return MetaTypeId::INVALID,
        };
        let known = method
            .descriptor
            .parameter_types
            .get(position)
            .map_or(MetaTypeId::INVALID, |name| types.lookup(name));
        if known.is_valid() {
            return known;
        }
        let slots: [ArgRef<'_>; 1] = [&position];
        let mut args = MetaArgs::new(&slots).with_types(types);
        match self.invoke(None, MetaCall::RegisterArgumentType, index, &mut args) {
            Ok(()) => args
                .take_return_as::<MetaTypeId>()
                .unwrap_or(MetaTypeId::INVALID),
            Err(err) => {
                tracing::debug!(
                    target: targets::META,
                    class = self.class_name,
                    index,
                    position,
                    %err,
                    "argument type registration failed"
                );
                MetaTypeId::INVALID
            }
        }
    }
}

/// Whether a signal's parameters can feed a target's parameters.
///
/// The signal may carry more arguments than the target consumes; the shared
/// prefix must agree type by type.
pub fn check_connect_args(signal: &MethodDescriptor, target: &MethodDescriptor) -> bool {
    signal.arity() >= target.arity()
        && signal
            .parameter_types
            .iter()
            .zip(target.parameter_types)
            .all(|(s, t)| normalize_type_name(s) == normalize_type_name(t))
}

/// Split `name(T1, T2)` into the name and normalized parameter types.
///
/// Commas nested in `<>`, `()` or `[]` do not split parameters.
pub fn parse_signature(signature: &str) -> Option<(String, Vec<String>)> {
    let sig = normalize_type_name(signature);
    let open = sig.find('(')?;
    if open == 0 || !sig.ends_with(')') {
        return None;
    }
    let name = sig[..open].to_string();
    let inner = &sig[open + 1..sig.len() - 1];
    if inner.is_empty() {
        return Some((name, Vec::new()));
    }

    let mut params = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '<' | '(' | '[' => depth += 1,
            '>' | ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                params.push(inner[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
        if depth < 0 {
            return None;
        }
    }
    params.push(inner[start..].to_string());
    if depth != 0 || params.iter().any(String::is_empty) {
        return None;
    }
    Some((name, params))
}

/// Normalize a signature to `name(T1,T2)` form.
pub fn normalize_signature(signature: &str) -> Option<String> {
    parse_signature(signature).map(|(name, params)| format!("{}({})", name, params.join(",")))
}

/// Invocation context handed to slots, signals and event handlers.
///
/// Carries the runtime, the object the call is made on and, for calls
/// triggered by an emission, the sender.
#[derive(Clone)]
pub struct Context {
    runtime: Runtime,
    object: ObjectId,
    sender: Option<ObjectId>,
}

impl Context {
    /// Create a context for calls on `object`.
    pub fn new(runtime: Runtime, object: ObjectId, sender: Option<ObjectId>) -> Self {
        Self {
            runtime,
            object,
            sender,
        }
    }

    /// The runtime the object lives in.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The object the call is made on.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// The object whose signal triggered this call.
    pub fn sender(&self) -> Option<ObjectId> {
        self.sender
    }

    /// Emit signal `signal` (absolute index) from this object.
    pub fn emit(&self, signal: usize, args: &[ArgRef<'_>]) {
        self.runtime.emit(self.object, signal, args);
    }

    /// Schedule this object for deferred deletion.
    pub fn delete_later(&self) {
        self.runtime.delete_later(self.object);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("object", &self.object)
            .field("sender", &self.sender)
            .finish()
    }
}

/// Argument slots and return slot of one seam call.
pub struct MetaArgs<'a> {
    args: &'a [ArgRef<'a>],
    ret: Option<Value>,
    context: Option<&'a Context>,
    types: Option<&'a TypeRegistry>,
}

impl<'a> MetaArgs<'a> {
    /// Wrap borrowed argument slots.
    pub fn new(args: &'a [ArgRef<'a>]) -> Self {
        Self {
            args,
            ret: None,
            context: None,
            types: None,
        }
    }

    /// Attach an invocation context.
    pub fn with_context(mut self, context: &'a Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Attach a type registry for argument registration.
    pub fn with_types(mut self, types: &'a TypeRegistry) -> Self {
        self.types = Some(types);
        self
    }

    /// Number of argument slots.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether there are no argument slots.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// All argument slots.
    pub fn slots(&self) -> &'a [ArgRef<'a>] {
        self.args
    }

    /// Argument `position`, downcast to `T`.
    pub fn arg<T: Any>(&self, position: usize) -> MetaResult<&'a T> {
        let slot: ArgRef<'a> = self
            .args
            .get(position)
            .copied()
            .ok_or(MetaError::MissingArgument(position))?;
        slot.downcast_ref::<T>().ok_or(MetaError::ArgumentMismatch {
            position,
            expected: std::any::type_name::<T>(),
        })
    }

    /// The invocation context.
    pub fn context(&self) -> MetaResult<&'a Context> {
        self.context.ok_or(MetaError::MissingContext)
    }

    /// The type registry, taken from the context when not set directly.
    pub fn types(&self) -> MetaResult<&'a TypeRegistry> {
        match (self.types, self.context) {
            (Some(types), _) => Ok(types),
            (None, Some(ctx)) => Ok(ctx.runtime().types()),
            (None, None) => Err(MetaError::MissingContext),
        }
    }

    /// Store a return value.
    pub fn set_return<T: Any + Send + Sync>(&mut self, value: T) {
        self.ret = Some(Box::new(value));
    }

    /// Store an already erased return value.
    pub fn set_return_value(&mut self, value: Value) {
        self.ret = Some(value);
    }

    /// Take the return value.
    pub fn take_return(&mut self) -> Option<Value> {
        self.ret.take()
    }

    /// Take the return value as `T`. A value of another type is discarded.
    pub fn take_return_as<T: Any>(&mut self) -> Option<T> {
        self.ret.take()?.downcast::<T>().ok().map(|b| *b)
    }
}

/// Absolute index of the root `destroyed(ObjectId)` signal.
pub const DESTROYED_SIGNAL: usize = 0;
/// Absolute index of the root `object_name_changed(String)` signal.
pub const OBJECT_NAME_CHANGED_SIGNAL: usize = 1;
/// Absolute index of the root `delete_later()` slot.
pub const DELETE_LATER_SLOT: usize = 2;

static OBJECT_METHODS: [MethodDescriptor; 3] = [
    MethodDescriptor::signal("destroyed", &["ObjectId"]),
    MethodDescriptor::signal("object_name_changed", &["String"]),
    MethodDescriptor::slot("delete_later", &[]),
];

static OBJECT_PROPERTIES: [PropertyDescriptor; 1] =
    [PropertyDescriptor::read_write("object_name", "String").with_notify(OBJECT_NAME_CHANGED_SIGNAL)];

fn object_static_call(
    _instance: Option<&dyn Any>,
    call: MetaCall,
    local: usize,
    args: &mut MetaArgs<'_>,
) -> MetaResult<()> {
    match call {
        MetaCall::InvokeMethod => {
            let ctx = args.context()?;
            match local {
                DESTROYED_SIGNAL | OBJECT_NAME_CHANGED_SIGNAL => ctx.emit(local, args.slots()),
                DELETE_LATER_SLOT => ctx.delete_later(),
                _ => return Err(MetaError::Unsupported(call)),
            }
            Ok(())
        }
        MetaCall::ReadProperty if local == 0 => {
            let ctx = args.context()?;
            let name = ctx.runtime().object_name(ctx.object()).unwrap_or_default();
            args.set_return(name);
            Ok(())
        }
        MetaCall::WriteProperty if local == 0 => {
            let ctx = args.context()?;
            let name = args.arg::<String>(0)?;
            ctx.runtime().set_object_name(ctx.object(), name.clone());
            Ok(())
        }
        MetaCall::IndexOfMethod => {
            let name = args.arg::<String>(0)?;
            if let Some(local) = OBJECT_METHODS.iter().position(|m| m.name == name) {
                args.set_return(local);
            }
            Ok(())
        }
        MetaCall::RegisterArgumentType => {
            let types = args.types()?;
            let position = *args.arg::<usize>(0)?;
            let id = match (local, position) {
                (DESTROYED_SIGNAL, 0) => types.register::<ObjectId>("ObjectId"),
                (OBJECT_NAME_CHANGED_SIGNAL, 0) => types.register::<String>("String"),
                _ => MetaTypeId::INVALID,
            };
            args.set_return(id);
            Ok(())
        }
        _ => Err(MetaError::Unsupported(call)),
    }
}

/// Descriptor of the root class every object type derives from.
pub static OBJECT_META: MetaObject = MetaObject {
    class_name: "Object",
    superclass: None,
    methods: &OBJECT_METHODS,
    properties: &OBJECT_PROPERTIES,
    enums: &[],
    class_info: &[],
    static_call: Some(object_static_call),
    upcast: None,
};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Base {
        level: Mutex<i32>,
    }

    struct Derived {
        base: Base,
        label: Mutex<String>,
    }

    static BASE_METHODS: [MethodDescriptor; 3] = [
        MethodDescriptor::signal("level_changed", &["i32"]),
        MethodDescriptor::slot("set_level", &["i32"]),
        MethodDescriptor::method("level", &[]).returning("i32"),
    ];

    static BASE_PROPERTIES: [PropertyDescriptor; 1] =
        [PropertyDescriptor::read_write("level", "i32").with_notify(0)];

    static BASE_ENUMS: [EnumDescriptor; 1] = [EnumDescriptor {
        name: "Mode",
        is_flag: true,
        keys: &[("Read", 1), ("Write", 2)],
    }];

    fn base_call(
        instance: Option<&dyn Any>,
        call: MetaCall,
        local: usize,
        args: &mut MetaArgs<'_>,
    ) -> MetaResult<()> {
        let this = instance.and_then(|i| i.downcast_ref::<Base>());
        match (call, local) {
            (MetaCall::InvokeMethod, 1) | (MetaCall::WriteProperty, 0) => {
                let this = this.ok_or(MetaError::InstanceMismatch("Base"))?;
                *this.level.lock() = *args.arg::<i32>(0)?;
                Ok(())
            }
            (MetaCall::InvokeMethod, 2) | (MetaCall::ReadProperty, 0) => {
                let this = this.ok_or(MetaError::InstanceMismatch("Base"))?;
                args.set_return(*this.level.lock());
                Ok(())
            }
            (MetaCall::IndexOfMethod, _) => {
                let name = args.arg::<String>(0)?;
                if let Some(i) = BASE_METHODS.iter().position(|m| m.name == name) {
                    args.set_return(i);
                }
                Ok(())
            }
            _ => Err(MetaError::Unsupported(call)),
        }
    }

    static BASE_META: MetaObject = MetaObject {
        class_name: "Base",
        superclass: Some(&OBJECT_META),
        methods: &BASE_METHODS,
        properties: &BASE_PROPERTIES,
        enums: &BASE_ENUMS,
        class_info: &[ClassInfo {
            name: "author",
            value: "base",
        }],
        static_call: Some(base_call),
        upcast: None,
    };

    static DERIVED_METHODS: [MethodDescriptor; 2] = [
        MethodDescriptor::slot("set_level", &["i32"]),
        MethodDescriptor::slot("set_label", &["String"]),
    ];

    static DERIVED_PROPERTIES: [PropertyDescriptor; 1] =
        [PropertyDescriptor::read_only("label", "String")];

    fn derived_call(
        instance: Option<&dyn Any>,
        call: MetaCall,
        local: usize,
        args: &mut MetaArgs<'_>,
    ) -> MetaResult<()> {
        let this = instance
            .and_then(|i| i.downcast_ref::<Derived>())
            .ok_or(MetaError::InstanceMismatch("Derived"))?;
        match (call, local) {
            (MetaCall::InvokeMethod, 0) => {
                *this.base.level.lock() = *args.arg::<i32>(0)? * 10;
                Ok(())
            }
            (MetaCall::InvokeMethod, 1) => {
                *this.label.lock() = args.arg::<String>(0)?.clone();
                Ok(())
            }
            (MetaCall::ReadProperty, 0) => {
                args.set_return(this.label.lock().clone());
                Ok(())
            }
            _ => Err(MetaError::Unsupported(call)),
        }
    }

    fn derived_upcast(instance: &dyn Any) -> Option<&dyn Any> {
        instance
            .downcast_ref::<Derived>()
            .map(|d| &d.base as &dyn Any)
    }

    static DERIVED_META: MetaObject = MetaObject {
        class_name: "Derived",
        superclass: Some(&BASE_META),
        methods: &DERIVED_METHODS,
        properties: &DERIVED_PROPERTIES,
        enums: &[],
        class_info: &[ClassInfo {
            name: "author",
            value: "derived",
        }],
        static_call: Some(derived_call),
        upcast: Some(derived_upcast),
    };

    fn derived() -> Derived {
        Derived {
            base: Base {
                level: Mutex::new(0),
            },
            label: Mutex::new(String::new()),
        }
    }

    #[test]
    fn test_offsets_sum_superclass_counts() {
        assert_eq!(OBJECT_META.method_offset(), 0);
        assert_eq!(BASE_META.method_offset(), 3);
        assert_eq!(DERIVED_META.method_offset(), 6);
        assert_eq!(DERIVED_META.method_count(), 8);
        assert_eq!(DERIVED_META.property_offset(), 2);
        assert_eq!(DERIVED_META.enum_offset(), 1);
    }

    #[test]
    fn test_most_derived_match_wins() {
        assert_eq!(DERIVED_META.index_of_slot("set_level(i32)"), Some(6));
        assert_eq!(BASE_META.index_of_slot("set_level(i32)"), Some(4));
        assert_eq!(DERIVED_META.index_of_signal("level_changed( i32 )"), Some(3));
        assert_eq!(DERIVED_META.index_of_signal("destroyed(ObjectId)"), Some(0));
    }

    #[test]
    fn test_unresolved_returns_none() {
        assert_eq!(DERIVED_META.index_of_slot("set_level(u8)"), None);
        assert_eq!(DERIVED_META.index_of_slot("set_level()"), None);
        assert_eq!(DERIVED_META.index_of_signal("set_level(i32)"), None);
        assert_eq!(DERIVED_META.index_of_method("set_level"), None);
        assert!(DERIVED_META.method(99).is_none());
    }

    #[test]
    fn test_method_lookup_by_absolute_index() {
        let m = DERIVED_META.method(4).unwrap();
        assert_eq!(m.name(), "set_level");
        assert!(std::ptr::eq(m.owner, &BASE_META));
        assert_eq!(m.signature(), "set_level(i32)");
    }

    #[test]
    fn test_invoke_routes_to_declaring_class() {
        let obj = derived();
        let value = 3i32;
        let slots: [ArgRef<'_>; 1] = [&value];

        let mut args = MetaArgs::new(&slots);
        DERIVED_META
            .invoke(Some(&obj), MetaCall::InvokeMethod, 6, &mut args)
            .unwrap();
        assert_eq!(*obj.base.level.lock(), 30);

        let mut args = MetaArgs::new(&slots);
        DERIVED_META
            .invoke(Some(&obj), MetaCall::InvokeMethod, 4, &mut args)
            .unwrap();
        assert_eq!(*obj.base.level.lock(), 3);
    }

    #[test]
    fn test_invoke_reads_properties_through_chain() {
        let obj = derived();
        *obj.base.level.lock() = 7;
        *obj.label.lock() = "x".into();

        let mut args = MetaArgs::new(&[]);
        DERIVED_META
            .invoke(Some(&obj), MetaCall::ReadProperty, 1, &mut args)
            .unwrap();
        assert_eq!(args.take_return_as::<i32>(), Some(7));

        let idx = DERIVED_META.index_of_property("label").unwrap();
        let mut args = MetaArgs::new(&[]);
        DERIVED_META
            .invoke(Some(&obj), MetaCall::ReadProperty, idx, &mut args)
            .unwrap();
        assert_eq!(args.take_return_as::<String>().as_deref(), Some("x"));
    }

    #[test]
    fn test_invoke_invalid_index() {
        let obj = derived();
        let mut args = MetaArgs::new(&[]);
        let err = DERIVED_META
            .invoke(Some(&obj), MetaCall::InvokeMethod, 8, &mut args)
            .unwrap_err();
        assert!(matches!(err, MetaError::InvalidIndex { index: 8, .. }));
    }

    #[test]
    fn test_argument_mismatch() {
        let obj = derived();
        let wrong = "no";
        let slots: [ArgRef<'_>; 1] = [&wrong];
        let mut args = MetaArgs::new(&slots);
        let err = DERIVED_META
            .invoke(Some(&obj), MetaCall::InvokeMethod, 6, &mut args)
            .unwrap_err();
        assert!(matches!(err, MetaError::ArgumentMismatch { position: 0, .. }));
    }

    #[test]
    fn test_root_slot_requires_context() {
        let mut args = MetaArgs::new(&[]);
        let err = OBJECT_META
            .invoke(None, MetaCall::InvokeMethod, DELETE_LATER_SLOT, &mut args)
            .unwrap_err();
        assert_eq!(err, MetaError::MissingContext);
    }

    #[test]
    fn test_index_of_method_by_name_uses_seam() {
        assert_eq!(DERIVED_META.index_of_method_by_name("level"), Some(5));
        assert_eq!(DERIVED_META.index_of_method_by_name("delete_later"), Some(2));
        assert_eq!(DERIVED_META.index_of_method_by_name("nothing"), None);
    }

    #[test]
    fn test_index_of_method_by_types() {
        let types = TypeRegistry::new();
        let i32_id = types.lookup("i32");
        assert_eq!(
            DERIVED_META.index_of_method_by_types("set_level", &[i32_id], &types),
            Some(6)
        );
        assert_eq!(
            DERIVED_META.index_of_method_by_types("set_level", &[types.lookup("u8")], &types),
            None
        );
    }

    #[test]
    fn test_register_argument_type_uses_known_names() {
        let types = TypeRegistry::new();
        let id = DERIVED_META.register_argument_type(3, 0, &types);
        assert_eq!(id, types.lookup("i32"));
        assert_eq!(
            DERIVED_META.register_argument_type(3, 5, &types),
            MetaTypeId::INVALID
        );
    }

    #[test]
    fn test_notify_signal_is_absolute() {
        let prop = DERIVED_META.property(1).unwrap();
        assert_eq!(prop.name(), "level");
        assert_eq!(prop.notify_signal(), Some(3));
        assert!(prop.descriptor.is_writable());
        assert!(!DERIVED_META.property(2).unwrap().descriptor.is_writable());
    }

    #[test]
    fn test_enums_and_class_info() {
        let mode = DERIVED_META.enumerator(0).unwrap();
        assert_eq!(mode.value_of("Write"), Some(2));
        assert_eq!(mode.keys_of(3).as_deref(), Some("Read|Write"));
        assert_eq!(mode.keys_of(4), None);
        assert_eq!(DERIVED_META.class_info_value("author"), Some("derived"));
        assert_eq!(DERIVED_META.class_info_count(), 2);
    }

    #[test]
    fn test_inherits() {
        assert!(DERIVED_META.inherits(&BASE_META));
        assert!(DERIVED_META.inherits(&OBJECT_META));
        assert!(!BASE_META.inherits(&DERIVED_META));
    }

    #[test]
    fn test_parse_signature() {
        assert_eq!(
            parse_signature("moved(HashMap<String, i32>, u8)"),
            Some((
                "moved".to_string(),
                vec!["HashMap<String,i32>".to_string(), "u8".to_string()]
            ))
        );
        assert_eq!(parse_signature("tick()"), Some(("tick".to_string(), vec![])));
        assert_eq!(parse_signature("tick"), None);
        assert_eq!(parse_signature("(i32)"), None);
        assert_eq!(parse_signature("f(i32,)"), None);
        assert_eq!(
            normalize_signature("f( Vec<u8> , bool )").as_deref(),
            Some("f(Vec<u8>,bool)")
        );
    }

    #[test]
    fn test_check_connect_args() {
        let signal = MethodDescriptor::signal("s", &["i32", "String"]);
        assert!(check_connect_args(&signal, &MethodDescriptor::slot("a", &[])));
        assert!(check_connect_args(&signal, &MethodDescriptor::slot("b", &["i32"])));
        assert!(!check_connect_args(&signal, &MethodDescriptor::slot("c", &["String"])));
        assert!(!check_connect_args(
            &signal,
            &MethodDescriptor::slot("d", &["i32", "String", "u8"])
        ));
    }
}
