//! Object Projection & Dispatch
//!
//! A projected host type is a named metatable. Instances are userdata whose
//! payload is a [`Handle`] into the handle registry; the metatable carries a
//! thunk per exposed instance method plus `__index`, `__newindex`, `__gc` and
//! `__tostring`.
//!
//! Dispatching an instance method:
//!
//! 1. position 1 must be a userdata of the method's type; it is copied into a
//!    reference slot that serves as the call's back-reference,
//! 2. declared parameters are pulled from position 2 on,
//! 3. the reflected invoker runs,
//! 4. the stack is cleared and the return value pushed,
//! 5. the back-reference is cleared and its slot freed, on every exit path.

use super::finder;
use super::handles::Handle;
use super::marshal;
use super::{Bridge, CallContext};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostObject, HostType, HostValue, MethodInfo};
use crate::vm::{LuaApi, LuaResult, NativeFn, RefId, TypeId};
use indexmap::IndexMap;
use std::rc::Rc;
use std::sync::Arc;

/// Exposed instance methods grouped by script-visible name
enum MethodGroup {
    Single(usize),
    Overloaded(String),
}

fn method_groups(ty: &HostType) -> BridgeResult<IndexMap<String, MethodGroup>> {
    let mut members: IndexMap<String, Vec<&MethodInfo>> = IndexMap::new();
    let mut first_index: IndexMap<String, usize> = IndexMap::new();
    for (index, method) in ty.methods().iter().enumerate() {
        if method.is_static || !method.is_exposed() {
            continue;
        }
        let name = method.exposed_name().to_string();
        first_index.entry(name.clone()).or_insert(index);
        members.entry(name).or_default().push(method);
    }

    let mut groups = IndexMap::new();
    for (name, methods) in members {
        let overloaded = methods
            .iter()
            .any(|m| m.exposure.as_ref().map(|e| e.overloaded).unwrap_or(false));
        let same_host_name = methods.iter().all(|m| m.name == methods[0].name);
        let group = if overloaded && same_host_name {
            MethodGroup::Overloaded(methods[0].name.clone())
        } else if methods.len() == 1 {
            MethodGroup::Single(first_index[&name])
        } else {
            return Err(BridgeError::AmbiguousMethod {
                type_name: ty.name().to_string(),
                method: name,
            });
        };
        groups.insert(name, group);
    }
    Ok(groups)
}

/// Project `ty`, returning its metatable id. A type that is already projected
/// keeps its metatable and id.
pub fn project(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, ty: &Arc<HostType>) -> BridgeResult<TypeId> {
    if let Some(id) = bridge.types().id_of(ty.key()) {
        return Ok(id);
    }
    let groups = method_groups(ty)?;

    let base = vm.top();
    let outcome = install_metatable(bridge, vm, ty, groups);
    vm.set_top(base);
    let id = outcome?;
    tracing::debug!(type_name = ty.display_name(), type_id = %id, "type projected");
    Ok(id)
}

fn install_metatable(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    ty: &Arc<HostType>,
    groups: IndexMap<String, MethodGroup>,
) -> BridgeResult<TypeId> {
    let name = metatable_name(bridge, ty)?;
    let id = vm.create_metatable(&name)?;
    let id = bridge.types().insert(id, ty.key());
    let mt = vm.top();

    if ty.has_properties() {
        vm.push_function(index_thunk(bridge.clone(), ty.clone(), id));
    } else {
        vm.push_value(mt)?;
    }
    vm.set_field(mt, "__index")?;
    vm.push_function(newindex_thunk(bridge.clone(), ty.clone()));
    vm.set_field(mt, "__newindex")?;
    vm.push_function(gc_thunk(bridge.clone()));
    vm.set_field(mt, "__gc")?;
    vm.push_function(tostring_thunk(ty.clone()));
    vm.set_field(mt, "__tostring")?;

    for (name, group) in groups {
        let thunk = match group {
            MethodGroup::Single(index) => method_thunk(bridge.clone(), ty.clone(), index),
            MethodGroup::Overloaded(host_name) => {
                overload_thunk(bridge.clone(), ty.clone(), host_name)
            }
        };
        vm.push_function(thunk);
        vm.set_field(mt, &name)?;
    }
    Ok(id)
}

/// Name of the metatable for `ty`: its display name, unless another type
/// already owns that name, then its qualified name, then its Rust path
fn metatable_name(bridge: &Bridge, ty: &HostType) -> BridgeResult<String> {
    let qualified = ty.qualified_name();
    let name = [ty.display_name(), qualified.as_str(), ty.key().name()]
        .into_iter()
        .find(|name| bridge.types().claim_name(name, ty.key()))
        .map(str::to_string)
        .ok_or_else(|| {
            BridgeError::Config(format!(
                "metatable name {} is already used by another type",
                ty.display_name()
            ))
        });
    name
}

/// Push `object` as a userdata of the projected type `ty`, projecting the
/// type first if needed
pub fn push_object(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    ty: &Arc<HostType>,
    object: HostObject,
) -> BridgeResult<Handle> {
    let id = project(bridge, vm, ty)?;
    let handle = bridge.handles().insert(object);
    if let Err(err) = vm.push_userdata(id, handle.to_bits()) {
        bridge.handles().release(handle);
        return Err(err.into());
    }
    tracing::trace!(type_name = ty.display_name(), %handle, "object pushed");
    Ok(handle)
}

// ============================================================================
// Thunks
// ============================================================================

pub(crate) fn method_thunk(bridge: Arc<Bridge>, ty: Arc<HostType>, index: usize) -> NativeFn {
    Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
        Ok(dispatch(&bridge, vm, &ty, index)?)
    })
}

/// Instance method thunk resolving among the overloads of `name`
pub(crate) fn overload_thunk(bridge: Arc<Bridge>, ty: Arc<HostType>, name: String) -> NativeFn {
    Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
        let index = finder::resolve(&bridge, vm, &ty, &name, false, 2)?;
        Ok(dispatch(&bridge, vm, &ty, index)?)
    })
}

fn index_thunk(bridge: Arc<Bridge>, ty: Arc<HostType>, id: TypeId) -> NativeFn {
    Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
        let getter = vm
            .to_str(2)
            .and_then(|key| ty.property(&key))
            .and_then(|p| p.getter.clone());
        if let Some(getter) = getter {
            let (index, _) = ty.find_method(&getter, &[]).ok_or_else(|| {
                BridgeError::PropertyNotFound {
                    type_name: ty.display_name().to_string(),
                    property: vm.to_str(2).unwrap_or_default(),
                }
            })?;
            vm.set_top(1);
            return Ok(dispatch(&bridge, vm, &ty, index)?);
        }
        vm.push_metatable(id);
        vm.push_value(2)?;
        vm.raw_get(-2)?;
        Ok(1)
    })
}

fn newindex_thunk(bridge: Arc<Bridge>, ty: Arc<HostType>) -> NativeFn {
    Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
        let key = vm.to_str(2).unwrap_or_default();
        let setter = ty
            .property(&key)
            .and_then(|p| p.setter.as_deref())
            .and_then(|name| {
                ty.methods_named(name)
                    .iter()
                    .copied()
                    .find(|&i| ty.method(i).map(|m| m.params.len() == 1).unwrap_or(false))
            });
        let Some(index) = setter else {
            return Err(BridgeError::PropertyNotFound {
                type_name: ty.display_name().to_string(),
                property: key,
            }
            .into());
        };
        vm.remove(2)?;
        vm.set_top(2);
        dispatch(&bridge, vm, &ty, index)?;
        Ok(0)
    })
}

fn gc_thunk(bridge: Arc<Bridge>) -> NativeFn {
    Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
        if let Some((_, payload)) = vm.to_userdata(1) {
            let handle = Handle::from_bits(payload);
            if bridge.handles().release(handle) {
                tracing::trace!(%handle, "handle collected");
            }
        }
        Ok(0)
    })
}

fn tostring_thunk(ty: Arc<HostType>) -> NativeFn {
    Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
        let text = match vm.to_userdata(1) {
            Some((_, payload)) => format!("<{}: {}>", ty.display_name(), Handle::from_bits(payload)),
            None => format!("<{}>", ty.display_name()),
        };
        vm.push_string(&text);
        Ok(1)
    })
}

// ============================================================================
// Dispatch
// ============================================================================

/// Invoke method `index` of `ty` with the arguments on the stack, leaving its
/// results on the stack. Returns the number of results.
pub(crate) fn dispatch(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    ty: &Arc<HostType>,
    index: usize,
) -> BridgeResult<i32> {
    let method = ty
        .method(index)
        .ok_or_else(|| BridgeError::Host(format!("{} has no method #{}", ty.name(), index)))?;
    tracing::trace!(type_name = ty.name(), method = %method.signature(), "dispatch");

    if method.is_static {
        return invoke(bridge, vm, method, None, 1);
    }

    let (handle, object, back_ref) = enter_instance(bridge, vm, ty)?;
    let outcome = invoke(bridge, vm, method, Some((handle, object)), 2);
    bridge.handles().exit_call(handle);
    vm.reference_free(back_ref);
    outcome
}

/// Validate the receiver at position 1 and set the back-reference
fn enter_instance(
    bridge: &Bridge,
    vm: &mut dyn LuaApi,
    ty: &HostType,
) -> BridgeResult<(Handle, HostObject, RefId)> {
    let expected = bridge.types().id_of(ty.key());
    let payload = match vm.to_userdata(1) {
        Some((type_id, payload)) if Some(type_id) == expected => payload,
        _ => {
            return Err(BridgeError::mismatch(
                ty.display_name(),
                vm.type_of(1).name(),
            ))
        }
    };
    let handle = Handle::from_bits(payload);

    vm.push_value(1)?;
    let back_ref = vm.reference_create()?;
    match bridge.handles().enter_call(handle, back_ref) {
        Ok(object) => Ok((handle, object, back_ref)),
        Err(err) => {
            vm.reference_free(back_ref);
            Err(err)
        }
    }
}

fn invoke(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    method: &MethodInfo,
    this: Option<(Handle, HostObject)>,
    first_arg: i32,
) -> BridgeResult<i32> {
    let mut args = Vec::with_capacity(method.params.len());
    for (i, declared) in method.params.iter().enumerate() {
        match marshal::pull(bridge, vm, *declared, first_arg + i as i32, true) {
            Ok(value) => args.push(value),
            Err(err) => {
                release_args(bridge, vm, &args);
                return Err(err);
            }
        }
    }

    let mut ctx = CallContext::new(&mut *vm, bridge, method, this, args);
    let result = (method.invoker)(&mut ctx);
    let args = ctx.into_args();

    let outcome = result.and_then(|value| {
        vm.set_top(0);
        marshal::push(bridge, vm, &value, method.returns)
    });
    release_args(bridge, vm, &args);
    outcome
}

/// Free the reference slots of arguments the method did not keep. Raw
/// `RefId` arguments only live for the call.
fn release_args(bridge: &Bridge, vm: &mut dyn LuaApi, args: &[HostValue]) {
    for arg in args {
        let freed = match arg {
            HostValue::Handle(r) => {
                bridge.handles().release_reference(vm, *r);
                Ok(())
            }
            HostValue::Function(f) if !f.is_shared() => f.free(vm),
            HostValue::Table(t) if !t.is_shared() => t.free(vm),
            HostValue::Reference(r) if !r.is_shared() => r.free(vm),
            _ => Ok(()),
        };
        if let Err(err) = freed {
            tracing::debug!(error = %err, "argument reference already released");
        }
    }
}
