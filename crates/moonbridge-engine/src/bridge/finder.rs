//! Overload resolution
//!
//! Maps the runtime type of each argument to a candidate host type and looks
//! for a method of the given name whose parameter list matches exactly.

use super::marshal;
use super::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{signature, HostType, TypeKey};
use crate::vm::LuaApi;

/// Candidate host types for the arguments from `first_arg` to the top
pub fn candidate_types(bridge: &Bridge, vm: &dyn LuaApi, first_arg: i32) -> Vec<TypeKey> {
    (first_arg..=vm.top())
        .map(|idx| marshal::infer_type(bridge, vm, idx))
        .collect()
}

/// Index of the method `name` on `ty` matching the arguments on the stack.
///
/// Fails with `OverloadNotFound` naming the attempted signature when nothing
/// matches, and with `AccessDenied` when the match is not exposed to scripts.
pub fn resolve(
    bridge: &Bridge,
    vm: &dyn LuaApi,
    ty: &HostType,
    name: &str,
    is_static: bool,
    first_arg: i32,
) -> BridgeResult<usize> {
    let candidates = candidate_types(bridge, vm, first_arg);
    let found = ty
        .methods_named(name)
        .iter()
        .copied()
        .find(|&i| {
            ty.method(i)
                .map(|m| m.is_static == is_static && m.params == candidates)
                .unwrap_or(false)
        });

    let Some(index) = found else {
        let signature = signature(name, &candidates);
        tracing::debug!(type_name = ty.name(), %signature, "no overload matches");
        return Err(BridgeError::OverloadNotFound { signature });
    };
    match ty.method(index) {
        Some(method) if method.is_exposed() && method.is_public => Ok(index),
        Some(method) => Err(BridgeError::AccessDenied {
            method: method.signature(),
        }),
        None => Err(BridgeError::OverloadNotFound {
            signature: signature(name, &candidates),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::host::{HostValue, MethodInfo};
    use crate::vm::State;
    use std::sync::Arc;

    struct Printer;

    fn printer() -> Arc<HostType> {
        HostType::builder::<Printer>("Printer")
            .method(
                MethodInfo::function("f", |_| Ok(HostValue::Nil))
                    .param::<String>()
                    .overloaded(),
            )
            .method(
                MethodInfo::function("f", |_| Ok(HostValue::Nil))
                    .param::<f64>()
                    .overloaded(),
            )
            .method(MethodInfo::function("f", |_| Ok(HostValue::Nil)).param::<bool>())
            .build()
    }

    #[test]
    fn test_resolves_by_runtime_type() {
        let bridge = Bridge::new(BridgeConfig::default());
        let ty = printer();
        let mut vm = State::new();

        vm.push_string("text");
        assert_eq!(resolve(&bridge, &vm, &ty, "f", true, 1).unwrap(), 0);
        vm.set_top(0);
        vm.push_number(2.0);
        assert_eq!(resolve(&bridge, &vm, &ty, "f", true, 1).unwrap(), 1);
    }

    #[test]
    fn test_no_arguments_names_signature() {
        let bridge = Bridge::new(BridgeConfig::default());
        let vm = State::new();
        assert_eq!(
            resolve(&bridge, &vm, &printer(), "f", true, 1).unwrap_err(),
            BridgeError::OverloadNotFound {
                signature: "f()".into()
            }
        );
    }

    #[test]
    fn test_unexposed_match_is_denied() {
        let bridge = Bridge::new(BridgeConfig::default());
        let mut vm = State::new();
        vm.push_bool(true);
        assert_eq!(
            resolve(&bridge, &vm, &printer(), "f", true, 1).unwrap_err(),
            BridgeError::AccessDenied {
                method: "f(bool)".into()
            }
        );
    }
}
