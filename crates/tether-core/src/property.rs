//! Interior-mutable property cells.
//!
//! Object types are shared between threads behind `Arc`, so their state is
//! mutated through `&self`. [`Property<T>`] is the cell `#[derive(Object)]`
//! generates accessors for: the generated setter writes through
//! [`Property::set`] and emits the notify signal only when the value actually
//! changed.
//!
//! ```
//! use tether_core::Property;
//!
//! let level = Property::new(3);
//! assert!(!level.set(3));
//! assert!(level.set(4));
//! assert_eq!(level.replace(5), Some(4));
//! assert_eq!(level.get(), 5);
//! ```

use std::fmt;

use parking_lot::RwLock;

/// A value cell with change detection.
pub struct Property<T> {
    value: RwLock<T>,
}

impl<T> Property<T> {
    /// Create a property holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            value: RwLock::new(value),
        }
    }

    /// Access the value without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    /// Overwrite the value without comparing.
    pub fn set_silent(&self, value: T) {
        *self.value.write() = value;
    }

    /// Consume the property, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Clone> Property<T> {
    /// A clone of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }
}

impl<T: PartialEq> Property<T> {
    /// Store `value`, returning whether it differed from the old one.
    pub fn set(&self, value: T) -> bool {
        let mut current = self.value.write();
        if *current == value {
            return false;
        }
        *current = value;
        true
    }

    /// Store `value`, returning the previous value if it changed.
    pub fn replace(&self, value: T) -> Option<T> {
        let mut current = self.value.write();
        if *current == value {
            return None;
        }
        Some(std::mem::replace(&mut *current, value))
    }

    /// Modify the value in place, returning whether it changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool
    where
        T: Clone,
    {
        let mut current = self.value.write();
        let before = current.clone();
        f(&mut current);
        *current != before
    }
}

impl<T: PartialEq + Default> Property<T> {
    /// Restore `T::default()`, returning whether the value changed.
    pub fn reset(&self) -> bool {
        self.set(T::default())
    }
}

impl<T: Default> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|v| f.debug_tuple("Property").field(v).finish())
    }
}

impl<T> From<T> for Property<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
