//! Catalog of host types known to the bridge

use super::descriptor::HostType;
use super::key::TypeKey;
use dashmap::DashMap;
use std::sync::Arc;

/// Host types registered by loaded modules, keyed by [`TypeKey`]
#[derive(Default)]
pub struct TypeCatalog {
    types: DashMap<TypeKey, Arc<HostType>>,
}

impl TypeCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type; the first registration for a key is kept.
    /// Returns false if the key was already present.
    pub fn insert(&self, ty: Arc<HostType>) -> bool {
        match self.types.entry(ty.key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ty);
                true
            }
        }
    }

    /// Descriptor for `key`
    pub fn get(&self, key: TypeKey) -> Option<Arc<HostType>> {
        self.types.get(&key).map(|entry| entry.clone())
    }

    /// Whether `key` is registered
    pub fn contains(&self, key: TypeKey) -> bool {
        self.types.contains_key(&key)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Remove every type (for unload)
    pub fn clear(&self) {
        self.types.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;

    #[test]
    fn test_first_registration_wins() {
        let catalog = TypeCatalog::new();
        assert!(catalog.insert(HostType::builder::<A>("First").build()));
        assert!(!catalog.insert(HostType::builder::<A>("Second").build()));
        assert_eq!(catalog.get(TypeKey::of::<A>()).unwrap().name(), "First");
        assert_eq!(catalog.len(), 1);
    }
}
