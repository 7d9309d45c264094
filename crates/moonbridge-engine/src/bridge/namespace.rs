//! Dynamic Namespace Registrar
//!
//! Publishes the static surface of host types as nested tables: a type `C`
//! in namespace `A.B` becomes `A.B.C`, with one function per public static
//! method. Tables along the path are created on first use and shared by every
//! type in the same namespace.

use super::projection;
use super::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::HostType;
use crate::vm::{LuaApi, LuaType};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Namespace path of `ty` with `trim_prefix` removed, split into segments
pub fn namespace_path(ty: &HostType, trim_prefix: Option<&str>) -> Vec<String> {
    let namespace = ty.namespace().unwrap_or_default();
    let trimmed = match trim_prefix.filter(|p| !p.is_empty()) {
        Some(prefix) if namespace == prefix => "",
        Some(prefix) => namespace
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(namespace),
        None => namespace,
    };
    trimmed
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Push `parent[name]`, creating an empty table there if it is absent.
/// `parent` must be an absolute position.
pub fn ensure_child_table(vm: &mut dyn LuaApi, parent: i32, name: &str) -> BridgeResult<()> {
    match vm.get_field(parent, name)? {
        LuaType::Table => Ok(()),
        LuaType::Nil => {
            vm.pop(1);
            vm.create_table();
            vm.push_value(-1)?;
            vm.set_field(parent, name)?;
            Ok(())
        }
        other => {
            vm.pop(1);
            Err(BridgeError::mismatch(
                format!("namespace table {}", name),
                other.name(),
            ))
        }
    }
}

/// Push the namespace root: the configured global table, or the globals
pub fn push_root(bridge: &Bridge, vm: &mut dyn LuaApi) -> BridgeResult<()> {
    vm.push_globals();
    if let Some(root) = &bridge.config().namespace_root {
        let globals = vm.top();
        ensure_child_table(vm, globals, root)?;
        vm.remove(globals)?;
    }
    Ok(())
}

/// Register the static surface of `ty`. Returns the number of functions
/// installed.
pub fn register_type(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    ty: &Arc<HostType>,
    trim_prefix: Option<&str>,
) -> BridgeResult<usize> {
    let statics: Vec<usize> = ty
        .methods()
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_static && m.is_public)
        .map(|(i, _)| i)
        .collect();

    let mut seen: FxHashMap<&str, usize> = FxHashMap::default();
    for &index in &statics {
        let name = ty.methods()[index].name.as_str();
        if seen.insert(name, index).is_some() {
            return Err(BridgeError::AmbiguousMethod {
                type_name: ty.qualified_name(),
                method: name.to_string(),
            });
        }
    }

    let base = vm.top();
    let outcome = install(bridge, vm, ty, trim_prefix, &statics);
    vm.set_top(base);
    outcome?;

    tracing::debug!(
        type_name = %ty.qualified_name(),
        functions = statics.len(),
        "namespace registered"
    );
    Ok(statics.len())
}

fn install(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    ty: &Arc<HostType>,
    trim_prefix: Option<&str>,
    statics: &[usize],
) -> BridgeResult<()> {
    push_root(bridge, vm)?;
    for segment in namespace_path(ty, trim_prefix) {
        let parent = vm.top();
        ensure_child_table(vm, parent, &segment)?;
    }
    let parent = vm.top();
    ensure_child_table(vm, parent, ty.name())?;
    let table = vm.top();

    for &index in statics {
        vm.push_function(projection::method_thunk(bridge.clone(), ty.clone(), index));
        vm.set_field(table, &ty.methods()[index].name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::host::{HostValue, MethodInfo};
    use crate::vm::State;

    struct Math;

    fn math_type() -> Arc<HostType> {
        HostType::builder::<Math>("Math")
            .namespace("Acme.Util")
            .method(
                MethodInfo::function("Twice", |ctx| {
                    let n: f64 = ctx.arg(0)?;
                    Ok(HostValue::Number(n * 2.0))
                })
                .param::<f64>()
                .returns::<f64>(),
            )
            .method(MethodInfo::function("Hidden", |_| Ok(HostValue::Nil)).private())
            .build()
    }

    #[test]
    fn test_namespace_path() {
        let ty = math_type();
        assert_eq!(namespace_path(&ty, None), vec!["Acme", "Util"]);
        assert_eq!(namespace_path(&ty, Some("Acme")), vec!["Util"]);
        assert_eq!(namespace_path(&ty, Some("Acme.Util")), Vec::<String>::new());
        assert_eq!(namespace_path(&ty, Some("Other")), vec!["Acme", "Util"]);
    }

    #[test]
    fn test_register_and_call() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        assert_eq!(register_type(&bridge, &mut vm, &math_type(), Some("Acme")).unwrap(), 1);
        assert_eq!(vm.top(), 0);

        assert_eq!(vm.get_path("Util.Math.Twice").unwrap(), LuaType::Function);
        vm.push_number(21.0);
        vm.call(1, 1).unwrap();
        assert_eq!(vm.to_number(-1), Some(42.0));
        assert_eq!(vm.get_path("Util.Math.Hidden").unwrap(), LuaType::Nil);
    }

    #[test]
    fn test_configured_root() {
        let bridge = Bridge::new(BridgeConfig::default().with_namespace_root("Host"));
        let mut vm = State::new();
        register_type(&bridge, &mut vm, &math_type(), None).unwrap();
        assert_eq!(vm.get_path("Host.Acme.Util.Math.Twice").unwrap(), LuaType::Function);
        assert_eq!(vm.get_path("Acme").unwrap(), LuaType::Nil);
    }

    #[test]
    fn test_duplicate_statics_are_rejected() {
        struct Dup;
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        let ty = HostType::builder::<Dup>("Dup")
            .method(MethodInfo::function("Make", |_| Ok(HostValue::Nil)))
            .method(MethodInfo::function("Make", |_| Ok(HostValue::Nil)).param::<String>())
            .build();
        assert_eq!(
            register_type(&bridge, &mut vm, &ty, None).unwrap_err(),
            BridgeError::AmbiguousMethod {
                type_name: "Dup".into(),
                method: "Make".into()
            }
        );
        assert_eq!(vm.get_path("Dup").unwrap(), LuaType::Nil);
    }
}
