//! Type-erasure service.
//!
//! Queued connections have to copy their arguments into the receiving thread's
//! event queue without knowing the concrete types at the emission site. The
//! [`TypeRegistry`] maps type names to [`MetaTypeId`]s and stores, per type, an
//! erased copy operation and the Rust [`TypeId`] used to validate values.
//!
//! Types are registered either explicitly or lazily through the
//! `RegisterArgumentType` call of a type's invocation seam.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::logging::targets;
use crate::object::ObjectId;

/// An owned, type-erased value.
pub type Value = Box<dyn Any + Send + Sync>;

/// A borrowed, type-erased argument.
pub type ArgRef<'a> = &'a (dyn Any + Send + Sync);

/// Identifier of a registered type. `MetaTypeId::INVALID` marks "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MetaTypeId(u32);

impl MetaTypeId {
    /// The id returned for names that do not resolve.
    pub const INVALID: Self = Self(0);

    /// Whether this id refers to a registered type.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The raw numeric value.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MetaTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type CopyFn = fn(ArgRef<'_>) -> Option<Value>;

fn copy_value<T: Any + Clone + Send + Sync>(src: ArgRef<'_>) -> Option<Value> {
    src.downcast_ref::<T>().map(|v| Box::new(v.clone()) as Value)
}

/// Strip whitespace so `Vec< u8 >` and `Vec<u8>` name the same type.
pub fn normalize_type_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

struct TypeEntry {
    name: String,
    rust_type: TypeId,
    copy: Option<CopyFn>,
}

#[derive(Default)]
struct TypeTable {
    /// Entry for id `n` lives at index `n - 1`.
    entries: Vec<TypeEntry>,
    by_name: HashMap<String, MetaTypeId>,
    by_rust: HashMap<TypeId, MetaTypeId>,
    builtin_count: usize,
}

impl TypeTable {
    fn entry(&self, id: MetaTypeId) -> Option<&TypeEntry> {
        if !id.is_valid() {
            return None;
        }
        self.entries.get(id.0 as usize - 1)
    }

    fn insert(&mut self, name: &str, rust_type: TypeId, copy: Option<CopyFn>) -> MetaTypeId {
        let name = normalize_type_name(name);

        if let Some(&existing) = self.by_rust.get(&rust_type) {
            match self.by_name.get(&name) {
                Some(&named) if named != existing => {
                    tracing::warn!(
                        target: targets::META,
                        name = %name,
                        "type name already registered for a different type"
                    );
                }
                Some(_) => {}
                None => {
                    self.by_name.insert(name, existing);
                }
            }
            return existing;
        }

        if self.by_name.contains_key(&name) {
            tracing::warn!(
                target: targets::META,
                name = %name,
                "type name already registered for a different type"
            );
            return MetaTypeId::INVALID;
        }

        self.entries.push(TypeEntry {
            name: name.clone(),
            rust_type,
            copy,
        });
        let id = MetaTypeId(self.entries.len() as u32);
        self.by_name.insert(name, id);
        self.by_rust.insert(rust_type, id);
        id
    }
}

/// The process-wide table of erased argument types.
///
/// A `TypeRegistry` is owned by a [`Runtime`](crate::Runtime); builtin scalar
/// and string types are always present.
pub struct TypeRegistry {
    inner: RwLock<TypeTable>,
}

macro_rules! register_builtins {
    ($table:expr; $($ty:ty => $name:literal),* $(,)?) => {
        $( $table.insert($name, TypeId::of::<$ty>(), Some(copy_value::<$ty> as CopyFn)); )*
    };
}

impl TypeRegistry {
    /// Create a registry containing the builtin types.
    pub fn new() -> Self {
        let mut table = TypeTable::default();
        register_builtins!(table;
            bool => "bool",
            char => "char",
            i8 => "i8",
            i16 => "i16",
            i32 => "i32",
            i64 => "i64",
            isize => "isize",
            u8 => "u8",
            u16 => "u16",
            u32 => "u32",
            u64 => "u64",
            usize => "usize",
            f32 => "f32",
            f64 => "f64",
            String => "String",
            &'static str => "&'staticstr",
            Vec<u8> => "Vec<u8>",
            Vec<String> => "Vec<String>",
            ObjectId => "ObjectId",
        );
        table.builtin_count = table.entries.len();
        Self {
            inner: RwLock::new(table),
        }
    }

    /// Register a copyable type under `name`.
    ///
    /// Registering the same Rust type twice returns the existing id and adds
    /// `name` as an alias. A name already taken by another type yields
    /// [`MetaTypeId::INVALID`].
    pub fn register<T: Any + Clone + Send + Sync>(&self, name: &str) -> MetaTypeId {
        let id = self
            .inner
            .write()
            .insert(name, TypeId::of::<T>(), Some(copy_value::<T> as CopyFn));
        tracing::trace!(target: targets::META, name, %id, "registered type");
        id
    }

    /// Register a type that can be named but not copied.
    ///
    /// Such types work for direct and blocking connections only; a queued
    /// dispatch carrying one is dropped.
    pub fn register_opaque<T: Any + Send + Sync>(&self, name: &str) -> MetaTypeId {
        self.inner.write().insert(name, TypeId::of::<T>(), None)
    }

    /// Make `alias` resolve to an already registered type.
    pub fn register_alias(&self, alias: &str, id: MetaTypeId) -> bool {
        let mut table = self.inner.write();
        if table.entry(id).is_none() {
            return false;
        }
        let alias = normalize_type_name(alias);
        match table.by_name.get(&alias) {
            Some(&existing) => existing == id,
            None => {
                table.by_name.insert(alias, id);
                true
            }
        }
    }

    /// Resolve a type name. Unknown names return [`MetaTypeId::INVALID`].
    pub fn lookup(&self, name: &str) -> MetaTypeId {
        let name = normalize_type_name(name);
        self.inner
            .read()
            .by_name
            .get(&name)
            .copied()
            .unwrap_or(MetaTypeId::INVALID)
    }

    /// The id registered for the Rust type `T`, if any.
    pub fn id_of<T: Any>(&self) -> MetaTypeId {
        self.inner
            .read()
            .by_rust
            .get(&TypeId::of::<T>())
            .copied()
            .unwrap_or(MetaTypeId::INVALID)
    }

    /// The canonical name of a registered type.
    pub fn name_of(&self, id: MetaTypeId) -> Option<String> {
        self.inner.read().entry(id).map(|e| e.name.clone())
    }

    /// Whether values of this type can be deep-copied.
    pub fn is_copyable(&self, id: MetaTypeId) -> bool {
        self.inner.read().entry(id).is_some_and(|e| e.copy.is_some())
    }

    /// Deep-copy `src` as a value of type `id`.
    ///
    /// Returns `None` when the type is unknown, has no copy operation, or
    /// `src` is not actually of that type.
    pub fn copy_construct(&self, id: MetaTypeId, src: ArgRef<'_>) -> Option<Value> {
        let copy = self.inner.read().entry(id)?.copy?;
        copy(src)
    }

    /// Release a value previously produced for type `id`.
    ///
    /// Returns `false` if `value` is not of that type; the value is released
    /// either way.
    pub fn destroy(&self, id: MetaTypeId, value: Value) -> bool {
        let expected = self.inner.read().entry(id).map(|e| e.rust_type);
        let matches = expected == Some((*value).type_id());
        drop(value);
        matches
    }

    /// Number of registered types, builtins included.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the registry holds no types at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every non-builtin registration. Part of runtime shutdown.
    pub fn clear_user_types(&self) {
        let mut table = self.inner.write();
        let keep = table.builtin_count;
        table.entries.truncate(keep);
        table.by_name.retain(|_, id| (id.0 as usize) <= keep);
        table.by_rust.retain(|_, id| (id.0 as usize) <= keep);
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.len())
            .finish()
    }
}
