//! Mapping between VM metatable ids and host types

use crate::host::TypeKey;
use crate::vm::TypeId;
use dashmap::DashMap;

/// Bidirectional TypeId ↔ TypeKey map.
///
/// Entries are added when a type is first projected and stay until unload.
#[derive(Default)]
pub struct TypeMap {
    by_id: DashMap<TypeId, TypeKey>,
    by_key: DashMap<TypeKey, TypeId>,
    /// Metatable name to owning type
    names: DashMap<String, TypeKey>,
}

impl TypeMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` for `key` unless `key` is already mapped; returns the id
    /// in effect for `key`
    pub fn insert(&self, id: TypeId, key: TypeKey) -> TypeId {
        let id = *self.by_key.entry(key).or_insert(id);
        self.by_id.entry(id).or_insert(key);
        id
    }

    /// Reserve the metatable name `name` for `key`; false when another type
    /// owns it
    pub fn claim_name(&self, name: &str, key: TypeKey) -> bool {
        *self.names.entry(name.to_string()).or_insert(key) == key
    }

    /// Host type projected under `id`
    pub fn key_of(&self, id: TypeId) -> Option<TypeKey> {
        self.by_id.get(&id).map(|entry| *entry)
    }

    /// VM type id of a projected host type
    pub fn id_of(&self, key: TypeKey) -> Option<TypeId> {
        self.by_key.get(&key).map(|entry| *entry)
    }

    /// Number of projected types
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Check if no type has been projected
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Forget every mapping
    pub fn clear(&self) {
        self.by_id.clear();
        self.by_key.clear();
        self.names.clear();
    }
}
