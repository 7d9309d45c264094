//! Reference Objects
//!
//! Host-side proxies for values that stay inside the VM. Each object owns one
//! VM reference slot, registered with the [`HandleRegistry`] so that the
//! unload sweep reclaims slots nobody freed. Clones share the slot.
//!
//! Reference objects are `Send`, so they can travel to worker threads, but
//! [`push`](RefSlot::push), [`free`](RefSlot::free) and
//! [`FunctionRef::call`] must only run on the VM thread. Work finishing
//! elsewhere goes through the task scheduler.

use super::handles::{HandleRegistry, TrackId};
use super::marshal;
use super::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostMap, HostValue, TypeKey};
use crate::vm::{LuaApi, LuaType, RefId, MULTRET};
use std::fmt;
use std::sync::Arc;

struct SlotInner {
    reference: RefId,
    track: TrackId,
    registry: Arc<HandleRegistry>,
}

/// One tracked VM reference slot
#[derive(Clone)]
pub struct RefSlot {
    inner: Arc<SlotInner>,
}

impl RefSlot {
    /// Claim a slot for the value at `idx`.
    ///
    /// With `copy` the value stays where it is; otherwise it is moved off the
    /// stack into the slot.
    fn claim(bridge: &Bridge, vm: &mut dyn LuaApi, idx: i32, copy: bool) -> BridgeResult<Self> {
        let idx = marshal::absolute(vm, idx);
        vm.push_value(idx)?;
        if !copy {
            vm.remove(idx)?;
        }
        let reference = vm.reference_create()?;
        let registry = bridge.handles().clone();
        let track = registry.track(reference);
        tracing::trace!(%reference, "reference slot claimed");
        Ok(Self {
            inner: Arc::new(SlotInner {
                reference,
                track,
                registry,
            }),
        })
    }

    /// The VM slot
    pub fn ref_id(&self) -> RefId {
        self.inner.reference
    }

    /// Whether the slot has not been freed or swept
    pub fn is_live(&self) -> bool {
        self.inner.registry.is_tracked(self.inner.track)
    }

    /// Whether other clones of this reference exist
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.inner) > 1
    }

    /// Push the referenced value
    pub fn push(&self, vm: &mut dyn LuaApi) -> BridgeResult<()> {
        if !self.is_live() {
            return Err(BridgeError::InvalidHandle(self.inner.reference.to_string()));
        }
        vm.reference_push(self.inner.reference)?;
        Ok(())
    }

    /// Release the slot. Freeing twice fails with `ReferenceReleased` and
    /// leaves the VM untouched.
    pub fn free(&self, vm: &mut dyn LuaApi) -> BridgeResult<()> {
        match self.inner.registry.untrack(self.inner.track) {
            Some(reference) => {
                vm.reference_free(reference);
                tracing::trace!(%reference, "reference slot freed");
                Ok(())
            }
            None => {
                tracing::warn!(reference = %self.inner.reference, "reference freed twice");
                Err(BridgeError::ReferenceReleased(self.inner.reference.to_string()))
            }
        }
    }
}

impl fmt::Debug for RefSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.reference)
    }
}

fn check_type(vm: &dyn LuaApi, idx: i32, expected: LuaType, name: &str) -> BridgeResult<()> {
    let actual = vm.type_of(idx);
    if actual != expected {
        return Err(BridgeError::mismatch(name, actual.name()));
    }
    Ok(())
}

macro_rules! reference_common {
    ($ty:ident) => {
        impl $ty {
            /// The VM slot
            pub fn ref_id(&self) -> RefId {
                self.slot.ref_id()
            }

            /// Whether the slot is still live
            pub fn is_live(&self) -> bool {
                self.slot.is_live()
            }

            /// Whether other clones of this reference exist
            pub fn is_shared(&self) -> bool {
                self.slot.is_shared()
            }

            /// Push the referenced value
            pub fn push(&self, vm: &mut dyn LuaApi) -> BridgeResult<()> {
                self.slot.push(vm)
            }

            /// Release the slot
            pub fn free(&self, vm: &mut dyn LuaApi) -> BridgeResult<()> {
                self.slot.free(vm)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($ty), self.slot)
            }
        }
    };
}

/// Reference to a VM function
#[derive(Clone)]
pub struct FunctionRef {
    slot: RefSlot,
}

reference_common!(FunctionRef);

impl FunctionRef {
    /// Reference the function at `idx`; anything else is a TypeMismatch and
    /// claims no slot
    pub fn from_stack(
        bridge: &Bridge,
        vm: &mut dyn LuaApi,
        idx: i32,
        copy: bool,
    ) -> BridgeResult<Self> {
        check_type(vm, idx, LuaType::Function, "FunctionRef")?;
        Ok(Self {
            slot: RefSlot::claim(bridge, vm, idx, copy)?,
        })
    }

    /// Call the function with `args` and pull one result per entry of
    /// `returns`. The stack is left as it was.
    pub fn call(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        args: &[HostValue],
        returns: &[TypeKey],
    ) -> BridgeResult<Vec<HostValue>> {
        let base = vm.top();
        let outcome = self.call_inner(bridge, vm, args, returns.len() as i32).and_then(|count| {
            returns
                .iter()
                .take(count)
                .enumerate()
                .map(|(i, declared)| marshal::pull(bridge, vm, *declared, base + 1 + i as i32, true))
                .collect()
        });
        vm.set_top(base);
        outcome
    }

    /// Call the function with `args` and pull every result dynamically
    pub fn call_multi(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        args: &[HostValue],
    ) -> BridgeResult<Vec<HostValue>> {
        let base = vm.top();
        let outcome = self.call_inner(bridge, vm, args, MULTRET).and_then(|count| {
            (0..count)
                .map(|i| marshal::pull_any(bridge, vm, base + 1 + i as i32, true))
                .collect()
        });
        vm.set_top(base);
        outcome
    }

    /// Push, call and report how many results are on the stack
    fn call_inner(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
        args: &[HostValue],
        nresults: i32,
    ) -> BridgeResult<usize> {
        let base = vm.top();
        self.push(vm)?;
        let mut nargs = 0;
        for arg in args {
            nargs += marshal::push_dynamic(bridge, vm, arg)?;
        }
        vm.call(nargs, nresults)?;
        Ok((vm.top() - base) as usize)
    }
}

/// Reference to a VM table
#[derive(Clone)]
pub struct TableRef {
    slot: RefSlot,
}

reference_common!(TableRef);

impl TableRef {
    /// Reference the table at `idx`; anything else is a TypeMismatch and
    /// claims no slot
    pub fn from_stack(
        bridge: &Bridge,
        vm: &mut dyn LuaApi,
        idx: i32,
        copy: bool,
    ) -> BridgeResult<Self> {
        check_type(vm, idx, LuaType::Table, "TableRef")?;
        Ok(Self {
            slot: RefSlot::claim(bridge, vm, idx, copy)?,
        })
    }

    /// Key/value pairs of the table, pulled dynamically
    pub fn entries(
        &self,
        bridge: &Arc<Bridge>,
        vm: &mut dyn LuaApi,
    ) -> BridgeResult<Vec<(HostValue, HostValue)>> {
        let base = vm.top();
        let outcome = self.push(vm).and_then(|()| {
            let table = vm.top();
            let mut entries = Vec::new();
            vm.push_nil();
            while vm.next(table)? {
                let key = marshal::pull_any(bridge, vm, -2, true)?;
                let value = marshal::pull_any(bridge, vm, -1, true)?;
                entries.push((key, value));
                vm.pop(1);
            }
            Ok(entries)
        });
        vm.set_top(base);
        outcome
    }

    /// Convert the table into a host map, recursively
    pub fn to_map(&self, bridge: &Arc<Bridge>, vm: &mut dyn LuaApi) -> BridgeResult<HostMap> {
        let base = vm.top();
        let outcome = self
            .push(vm)
            .and_then(|()| marshal::read_map(bridge, vm, -1, 0));
        vm.set_top(base);
        outcome
    }
}

/// Reference to a VM value of any type
#[derive(Clone)]
pub struct LuaReference {
    slot: RefSlot,
}

reference_common!(LuaReference);

impl LuaReference {
    /// Reference whatever value is at `idx`
    pub fn from_stack(
        bridge: &Bridge,
        vm: &mut dyn LuaApi,
        idx: i32,
        copy: bool,
    ) -> BridgeResult<Self> {
        if vm.type_of(idx) == LuaType::None {
            return Err(BridgeError::Vm(crate::vm::LuaError::InvalidIndex(idx)));
        }
        Ok(Self {
            slot: RefSlot::claim(bridge, vm, idx, copy)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::vm::{LuaError, LuaResult, NativeFn, State};
    use std::rc::Rc;

    #[test]
    fn test_function_ref_rejects_other_types() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.push_number(1.0);

        let err = FunctionRef::from_stack(&bridge, &mut vm, -1, true).unwrap_err();
        assert_eq!(err, BridgeError::mismatch("FunctionRef", "number"));
        assert_eq!(vm.live_references(), 0);
        assert_eq!(bridge.handles().tracked_references(), 0);
    }

    #[test]
    fn test_copy_keeps_value_on_stack() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.create_table();

        let copied = TableRef::from_stack(&bridge, &mut vm, 1, true).unwrap();
        assert_eq!(vm.top(), 1);
        let moved = TableRef::from_stack(&bridge, &mut vm, 1, false).unwrap();
        assert_eq!(vm.top(), 0);
        assert_ne!(copied.ref_id(), moved.ref_id());
        assert_eq!(bridge.handles().tracked_references(), 2);
    }

    #[test]
    fn test_double_free() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.push_string("value");
        let reference = LuaReference::from_stack(&bridge, &mut vm, -1, false).unwrap();

        reference.push(&mut vm).unwrap();
        assert_eq!(vm.to_str(-1).as_deref(), Some("value"));

        reference.free(&mut vm).unwrap();
        assert!(!reference.is_live());
        assert!(matches!(
            reference.free(&mut vm),
            Err(BridgeError::ReferenceReleased(_))
        ));
        assert!(matches!(
            reference.push(&mut vm),
            Err(BridgeError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_call_with_returns() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        let concat: NativeFn = Rc::new(|vm: &mut dyn LuaApi| -> LuaResult<i32> {
            let a = vm.to_str(1).unwrap_or_default();
            let b = vm.to_number(2).unwrap_or_default();
            vm.push_string(&format!("{}{}", a, b));
            vm.push_bool(true);
            Ok(2)
        });
        vm.push_function(concat);
        let func = FunctionRef::from_stack(&bridge, &mut vm, -1, false).unwrap();

        let args = [HostValue::String("n".into()), HostValue::Number(4.0)];
        let results = func
            .call(&bridge, &mut vm, &args, &[TypeKey::of::<String>()])
            .unwrap();
        assert_eq!(results, vec![HostValue::String("n4".into())]);
        assert_eq!(vm.top(), 0);

        let all = func.call_multi(&bridge, &mut vm, &args).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1], HostValue::Bool(true));
    }

    #[test]
    fn test_call_error_propagates() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.push_function(Rc::new(|_: &mut dyn LuaApi| -> LuaResult<i32> {
            Err(LuaError::Runtime("callback failed".into()))
        }));
        let func = FunctionRef::from_stack(&bridge, &mut vm, -1, false).unwrap();

        let err = func.call(&bridge, &mut vm, &[], &[]).unwrap_err();
        assert_eq!(err, BridgeError::Vm(LuaError::Runtime("callback failed".into())));
        assert_eq!(vm.top(), 0);
    }

    #[test]
    fn test_table_entries() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.create_table();
        vm.push_number(1.0);
        vm.set_field(-2, "a").unwrap();
        vm.push_string("x");
        vm.set_field(-2, "b").unwrap();
        let table = TableRef::from_stack(&bridge, &mut vm, -1, false).unwrap();

        let entries = table.entries(&bridge, &mut vm).unwrap();
        assert_eq!(
            entries,
            vec![
                (HostValue::String("a".into()), HostValue::Number(1.0)),
                (HostValue::String("b".into()), HostValue::String("x".into())),
            ]
        );
        let map = table.to_map(&bridge, &mut vm).unwrap();
        assert_eq!(map.get("b"), Some(&HostValue::String("x".into())));
        assert_eq!(vm.top(), 0);
    }
}
