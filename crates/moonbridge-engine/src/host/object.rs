//! Type-erased host object instances

use super::key::TypeKey;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A shared host object with its type identity.
///
/// Cloning is cheap and shares the instance.
#[derive(Clone)]
pub struct HostObject {
    key: TypeKey,
    inner: Arc<dyn Any + Send + Sync>,
}

impl HostObject {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wrap an already shared value
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            key: TypeKey::of::<T>(),
            inner: value,
        }
    }

    /// Runtime type of the instance
    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    /// Shared handle to the instance, if it is a `T`
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    /// Borrow the instance, if it is a `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// True when both wrap the same instance
    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject<{}>", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
    }

    #[test]
    fn test_downcast() {
        let obj = HostObject::new(Point { x: 4 });
        assert_eq!(obj.type_key(), TypeKey::of::<Point>());
        assert_eq!(obj.downcast_ref::<Point>(), Some(&Point { x: 4 }));
        assert!(obj.downcast::<String>().is_none());

        let same = obj.clone();
        assert!(same.ptr_eq(&obj));
        assert!(!HostObject::new(Point { x: 4 }).ptr_eq(&obj));
    }
}
