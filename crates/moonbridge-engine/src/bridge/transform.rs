//! Transformer Registry
//!
//! Converters for host types that no primitive rule covers. A converter
//! implements [`Transformer`] for its `Target` type; the target's
//! [`TypeKey`] is the registry key. Registration is first-wins and entries
//! are never removed while the module is loaded.

use super::marshal;
use super::Bridge;
use crate::error::{BridgeError, BridgeResult, Direction};
use crate::host::{HostList, HostMap, HostObject, TypeKey};
use crate::vm::LuaApi;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

/// Bidirectional converter for `Target`.
///
/// Both directions default to `NotImplemented`; implement the ones the type
/// supports.
pub trait Transformer: Send + Sync + 'static {
    /// Host type handled by this converter
    type Target: Any + Send + Sync;

    /// Push `value` onto the VM stack, returning the number of values pushed
    fn convert(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        value: &Self::Target,
    ) -> BridgeResult<i32> {
        let _ = (bridge, vm, value);
        Err(not_implemented::<Self::Target>(Direction::ToVm))
    }

    /// Read the value at `idx`; `None` when the VM value has the wrong shape.
    /// Removes a consumed value unless `keep` is set.
    fn try_parse(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        idx: i32,
        keep: bool,
    ) -> BridgeResult<Option<Self::Target>> {
        let _ = (bridge, vm, idx, keep);
        Err(not_implemented::<Self::Target>(Direction::FromVm))
    }
}

fn not_implemented<T: Any>(direction: Direction) -> BridgeError {
    BridgeError::NotImplemented {
        transformer: TypeKey::of::<T>().short_name(),
        direction,
    }
}

/// Type-erased [`Transformer`]
pub trait DynTransformer: Send + Sync {
    /// Registry key
    fn target(&self) -> TypeKey;

    /// Push a host object of the target type
    fn convert_object(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        value: &HostObject,
    ) -> BridgeResult<i32>;

    /// Parse into a host object of the target type
    fn parse_object(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        idx: i32,
        keep: bool,
    ) -> BridgeResult<Option<HostObject>>;
}

impl<T: Transformer> DynTransformer for T {
    fn target(&self) -> TypeKey {
        TypeKey::of::<T::Target>()
    }

    fn convert_object(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        value: &HostObject,
    ) -> BridgeResult<i32> {
        let typed = value.downcast_ref::<T::Target>().ok_or_else(|| {
            BridgeError::mismatch(self.target().short_name(), value.type_key().short_name())
        })?;
        self.convert(bridge, vm, typed)
    }

    fn parse_object(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        idx: i32,
        keep: bool,
    ) -> BridgeResult<Option<HostObject>> {
        Ok(self.try_parse(bridge, vm, idx, keep)?.map(HostObject::new))
    }
}

/// Registry of transformers keyed by target type
#[derive(Default)]
pub struct TransformerRegistry {
    transformers: DashMap<TypeKey, Arc<dyn DynTransformer>>,
}

impl TransformerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transformer` for its target type. A target that already has
    /// a transformer keeps it; returns false in that case.
    pub fn register(&self, transformer: Arc<dyn DynTransformer>) -> bool {
        let key = transformer.target();
        match self.transformers.entry(key) {
            Entry::Occupied(_) => {
                tracing::warn!(target_type = %key, "transformer already registered, ignoring");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(transformer);
                tracing::debug!(target_type = %key, "transformer registered");
                true
            }
        }
    }

    /// Register a typed transformer
    pub fn register_transformer<T: Transformer>(&self, transformer: T) -> bool {
        self.register(Arc::new(transformer))
    }

    /// Register a batch found at startup; returns how many were accepted
    pub fn discover<I>(&self, transformers: I) -> usize
    where
        I: IntoIterator<Item = Arc<dyn DynTransformer>>,
    {
        transformers
            .into_iter()
            .filter(|t| self.register(t.clone()))
            .count()
    }

    /// Transformer for `key`
    pub fn lookup(&self, key: TypeKey) -> Option<Arc<dyn DynTransformer>> {
        self.transformers.get(&key).map(|entry| entry.clone())
    }

    /// Whether `key` has a transformer
    pub fn contains(&self, key: TypeKey) -> bool {
        self.transformers.contains_key(&key)
    }

    /// Number of registered transformers
    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Drop every transformer (for unload)
    pub fn clear(&self) {
        self.transformers.clear();
    }
}

// ============================================================================
// Built-in transformers
// ============================================================================

/// `HostList` ↔ array table
pub struct ListTransformer;

impl Transformer for ListTransformer {
    type Target = HostList;

    fn convert(&self, bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &HostList) -> BridgeResult<i32> {
        marshal::write_list(bridge, vm, value)?;
        Ok(1)
    }

    fn try_parse(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        idx: i32,
        keep: bool,
    ) -> BridgeResult<Option<HostList>> {
        if vm.type_of(idx) != crate::vm::LuaType::Table {
            return Ok(None);
        }
        let list = marshal::read_list(bridge, vm, idx, 0)?;
        if !keep {
            vm.remove(idx)?;
        }
        Ok(Some(list))
    }
}

/// `HostMap` ↔ table with string keys
pub struct MapTransformer;

impl Transformer for MapTransformer {
    type Target = HostMap;

    fn convert(&self, bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &HostMap) -> BridgeResult<i32> {
        marshal::write_map(bridge, vm, value)?;
        Ok(1)
    }

    fn try_parse(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        idx: i32,
        keep: bool,
    ) -> BridgeResult<Option<HostMap>> {
        if vm.type_of(idx) != crate::vm::LuaType::Table {
            return Ok(None);
        }
        let map = marshal::read_map(bridge, vm, idx, 0)?;
        if !keep {
            vm.remove(idx)?;
        }
        Ok(Some(map))
    }
}

/// The transformers every bridge starts with
pub fn builtins() -> Vec<Arc<dyn DynTransformer>> {
    let list: Arc<dyn DynTransformer> = Arc::new(ListTransformer);
    let map: Arc<dyn DynTransformer> = Arc::new(MapTransformer);
    vec![list, map]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::vm::State;

    struct Celsius(f64);

    struct CelsiusAsNumber;

    impl Transformer for CelsiusAsNumber {
        type Target = Celsius;

        fn convert(&self, _: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &Celsius) -> BridgeResult<i32> {
            vm.push_number(value.0);
            Ok(1)
        }
    }

    struct CelsiusAsString;

    impl Transformer for CelsiusAsString {
        type Target = Celsius;

        fn convert(&self, _: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &Celsius) -> BridgeResult<i32> {
            vm.push_string(&format!("{}C", value.0));
            Ok(1)
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let bridge = Bridge::new(BridgeConfig::default());
        let registry = TransformerRegistry::new();
        assert!(registry.register_transformer(CelsiusAsNumber));
        assert!(!registry.register_transformer(CelsiusAsString));
        assert_eq!(registry.len(), 1);

        let mut vm = State::new();
        let transformer = registry.lookup(TypeKey::of::<Celsius>()).unwrap();
        transformer
            .convert_object(&bridge, &mut vm, &HostObject::new(Celsius(21.5)))
            .unwrap();
        assert_eq!(vm.to_number(-1), Some(21.5));
    }

    #[test]
    fn test_missing_direction_is_not_implemented() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.push_number(3.0);
        let err = CelsiusAsNumber.parse_object(&bridge, &mut vm, -1, false).unwrap_err();
        assert_eq!(
            err,
            BridgeError::NotImplemented {
                transformer: "Celsius".into(),
                direction: Direction::FromVm,
            }
        );
    }

    #[test]
    fn test_discover_counts_accepted() {
        let registry = TransformerRegistry::new();
        let mut batch = builtins();
        batch.push(Arc::new(MapTransformer));
        assert_eq!(registry.discover(batch), 2);
        assert!(registry.contains(TypeKey::of::<HostMap>()));
        assert!(registry.contains(TypeKey::of::<HostList>()));
    }
}
