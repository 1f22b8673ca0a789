//! Shared capability handles with value equality.
//!
//! Capabilities (resolver, socket factory, proxy selector, ...) are trait
//! objects. Two handles compare equal when they point at the same object, or
//! when the concrete types match and the values are `Eq`. That lets two
//! separately built client configurations with equal settings share pooled
//! connections.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// Object-safe equality and hashing for capability trait objects.
///
/// Implemented for every `Eq + Hash + Debug` type; capability traits list it as
/// a supertrait so `dyn Trait` can be compared.
pub trait CapabilityEq: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    fn dyn_eq(&self, other: &dyn Any) -> bool;

    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> CapabilityEq for T
where
    T: Any + Eq + Hash + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|other| self == other)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Shared handle to a capability.
pub struct Cap<T: ?Sized>(Arc<T>);

impl<T: ?Sized> Cap<T> {
    /// Wrap an existing shared capability.
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self(inner)
    }

    /// Check whether both handles point at the same object.
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: ?Sized> From<Arc<T>> for Cap<T> {
    fn from(inner: Arc<T>) -> Self {
        Self(inner)
    }
}

impl<T: ?Sized> Clone for Cap<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> Deref for Cap<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized + CapabilityEq> PartialEq for Cap<T> {
    fn eq(&self, other: &Self) -> bool {
        let this: &T = &self.0;
        let that: &T = &other.0;
        self.same_instance(other) || this.dyn_eq(that.as_any())
    }
}

impl<T: ?Sized + CapabilityEq> Eq for Cap<T> {}

impl<T: ?Sized + CapabilityEq> Hash for Cap<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let this: &T = &self.0;
        this.dyn_hash(state);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Cap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    trait Greeter: CapabilityEq {
        fn greet(&self) -> String;
    }

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Fixed(&'static str);

    impl Greeter for Fixed {
        fn greet(&self) -> String {
            self.0.to_string()
        }
    }

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Other(&'static str);

    impl Greeter for Other {
        fn greet(&self) -> String {
            self.0.to_string()
        }
    }

    fn cap(g: impl Greeter) -> Cap<dyn Greeter> {
        let arc: Arc<dyn Greeter> = Arc::new(g);
        Cap::from_arc(arc)
    }

    fn hash_of(c: &Cap<dyn Greeter>) -> u64 {
        let mut h = DefaultHasher::new();
        c.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_structural_equality() {
        let a = cap(Fixed("hi"));
        let b = cap(Fixed("hi"));
        assert!(!a.same_instance(&b));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.greet(), "hi");
    }

    #[test]
    fn test_different_types_never_equal() {
        let a = cap(Fixed("hi"));
        let b = cap(Other("hi"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_values_not_equal() {
        assert_ne!(cap(Fixed("hi")), cap(Fixed("bye")));
    }

    #[test]
    fn test_clone_is_same_instance() {
        let a = cap(Fixed("hi"));
        let b = a.clone();
        assert!(a.same_instance(&b));
        assert_eq!(a, b);
    }
}
