//! Value Marshaller
//!
//! Converts values between VM stack slots and [`HostValue`]s. The declared
//! host type drives every conversion:
//!
//! 1. primitive rules (strings, booleans, numeric kinds, unit, reference
//!    kinds, dynamic `HostValue`),
//! 2. projected host objects (the type catalog and the TypeId map),
//! 3. the transformer registry,
//!
//! and anything else is `UnsupportedType`. Values are never guessed or
//! coerced across kinds.
//!
//! Pulling a primitive removes it from the stack unless `keep` is set;
//! pulling a reference-backed value (function, table, userdata, raw
//! reference) never removes it.

use super::handles::Handle;
use super::projection;
use super::reference::{FunctionRef, LuaReference, TableRef};
use super::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{HostList, HostMap, HostObject, HostValue, TypeKey};
use crate::vm::{LuaApi, LuaType, RefId};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Conversion rule for a declared host type
#[derive(Debug, Clone, Copy, PartialEq)]
enum Rule {
    Unit,
    Str,
    Bool,
    Float,
    Int { min: f64, max: f64 },
    Handle,
    Function,
    Table,
    Reference,
    Object,
    Dynamic,
}

static PRIMITIVES: Lazy<FxHashMap<std::any::TypeId, Rule>> = Lazy::new(|| {
    fn int<T: 'static>(min: f64, max: f64) -> (std::any::TypeId, Rule) {
        (std::any::TypeId::of::<T>(), Rule::Int { min, max })
    }
    // Integers travel as i64, so unsigned 64-bit kinds stop at i64::MAX
    let max_i64 = i64::MAX as f64;
    let mut rules: FxHashMap<std::any::TypeId, Rule> = [
        int::<i64>(i64::MIN as f64, max_i64),
        int::<i32>(i32::MIN as f64, i32::MAX as f64),
        int::<i16>(i16::MIN as f64, i16::MAX as f64),
        int::<i8>(i8::MIN as f64, i8::MAX as f64),
        int::<u64>(0.0, max_i64),
        int::<usize>(0.0, max_i64),
        int::<u32>(0.0, u32::MAX as f64),
        int::<u16>(0.0, u16::MAX as f64),
        int::<u8>(0.0, u8::MAX as f64),
    ]
    .into_iter()
    .collect();
    for (id, rule) in [
        (std::any::TypeId::of::<()>(), Rule::Unit),
        (std::any::TypeId::of::<String>(), Rule::Str),
        (std::any::TypeId::of::<&'static str>(), Rule::Str),
        (std::any::TypeId::of::<bool>(), Rule::Bool),
        (std::any::TypeId::of::<f64>(), Rule::Float),
        (std::any::TypeId::of::<f32>(), Rule::Float),
        (std::any::TypeId::of::<RefId>(), Rule::Handle),
        (std::any::TypeId::of::<FunctionRef>(), Rule::Function),
        (std::any::TypeId::of::<TableRef>(), Rule::Table),
        (std::any::TypeId::of::<LuaReference>(), Rule::Reference),
        (std::any::TypeId::of::<HostObject>(), Rule::Object),
        (std::any::TypeId::of::<HostValue>(), Rule::Dynamic),
    ] {
        rules.insert(id, rule);
    }
    rules
});

fn rule(key: TypeKey) -> Option<Rule> {
    PRIMITIVES.get(&key.id()).copied()
}

/// Whether `key` is handled by a primitive rule
pub fn is_primitive(key: TypeKey) -> bool {
    rule(key).is_some()
}

/// Convert a relative stack position into an absolute one
pub fn absolute(vm: &dyn LuaApi, idx: i32) -> i32 {
    if idx < 0 {
        vm.top() + idx + 1
    } else {
        idx
    }
}

fn mismatch(expected: TypeKey, got: impl Into<String>) -> BridgeError {
    BridgeError::mismatch(expected.short_name(), got)
}

// ============================================================================
// Host → VM
// ============================================================================

/// Push `value` as `declared`, returning the number of values pushed
pub fn push(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    value: &HostValue,
    declared: TypeKey,
) -> BridgeResult<i32> {
    let Some(rule) = rule(declared) else {
        return match value {
            HostValue::Nil => {
                vm.push_nil();
                Ok(1)
            }
            HostValue::Object(obj) => push_object(bridge, vm, obj),
            other => Err(mismatch(declared, other.kind_name())),
        };
    };

    match (rule, value) {
        (Rule::Unit, _) => Ok(0),
        (Rule::Dynamic, value) => push_dynamic(bridge, vm, value),
        (_, HostValue::Nil) => {
            vm.push_nil();
            Ok(1)
        }
        (Rule::Str, HostValue::String(s)) => {
            vm.push_string(s);
            Ok(1)
        }
        (Rule::Bool, HostValue::Bool(b)) => {
            vm.push_bool(*b);
            Ok(1)
        }
        (Rule::Float | Rule::Int { .. }, HostValue::Number(_) | HostValue::Integer(_)) => {
            vm.push_number(value.as_f64().unwrap_or_default());
            Ok(1)
        }
        (Rule::Handle, HostValue::Handle(r)) => {
            vm.reference_push(*r)?;
            Ok(1)
        }
        (Rule::Function, HostValue::Function(f)) => f.push(vm).map(|()| 1),
        (Rule::Table, HostValue::Table(t)) => t.push(vm).map(|()| 1),
        (Rule::Reference, HostValue::Reference(_) | HostValue::Function(_) | HostValue::Table(_)) => {
            push_dynamic(bridge, vm, value)
        }
        (Rule::Object, HostValue::Object(obj)) => push_object(bridge, vm, obj),
        (_, other) => Err(mismatch(declared, other.kind_name())),
    }
}

/// Push `value` according to its own variant
pub fn push_dynamic(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &HostValue) -> BridgeResult<i32> {
    match value {
        HostValue::Nil => vm.push_nil(),
        HostValue::Bool(b) => vm.push_bool(*b),
        HostValue::Integer(i) => vm.push_number(*i as f64),
        HostValue::Number(n) => vm.push_number(*n),
        HostValue::String(s) => vm.push_string(s),
        HostValue::Handle(r) => vm.reference_push(*r)?,
        HostValue::Function(f) => f.push(vm)?,
        HostValue::Table(t) => t.push(vm)?,
        HostValue::Reference(r) => r.push(vm)?,
        HostValue::Object(obj) => return push_object(bridge, vm, obj),
    }
    Ok(1)
}

/// Push a host object: projected when its type is in the catalog, otherwise
/// through its transformer
pub fn push_object(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, obj: &HostObject) -> BridgeResult<i32> {
    let key = obj.type_key();
    if let Some(ty) = bridge.catalog().get(key) {
        projection::push_object(bridge, vm, &ty, obj.clone())?;
        return Ok(1);
    }
    match bridge.transformers().lookup(key) {
        Some(transformer) => transformer.convert_object(bridge, vm, obj),
        None => Err(BridgeError::UnsupportedType {
            type_name: key.short_name(),
        }),
    }
}

/// Push exactly one value for `value`, padding or trimming what a
/// transformer produced
fn push_one(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, value: &HostValue) -> BridgeResult<()> {
    let count = push_dynamic(bridge, vm, value)?;
    match count {
        0 => vm.push_nil(),
        1 => {}
        n => vm.pop(n - 1),
    }
    Ok(())
}

/// Push `map` as a new table
pub fn write_map(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, map: &HostMap) -> BridgeResult<()> {
    let base = vm.top();
    vm.create_table();
    for (key, value) in map.iter() {
        let written = push_one(bridge, vm, value)
            .and_then(|()| vm.set_field(-2, key).map_err(BridgeError::from));
        if let Err(err) = written {
            vm.set_top(base);
            return Err(err);
        }
    }
    Ok(())
}

/// Push `list` as a new array table (1-based)
pub fn write_list(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, list: &HostList) -> BridgeResult<()> {
    let base = vm.top();
    vm.create_table();
    for (i, value) in list.0.iter().enumerate() {
        vm.push_number((i + 1) as f64);
        let written = push_one(bridge, vm, value)
            .and_then(|()| vm.raw_set(-3).map_err(BridgeError::from));
        if let Err(err) = written {
            vm.set_top(base);
            return Err(err);
        }
    }
    Ok(())
}

// ============================================================================
// VM → Host
// ============================================================================

fn consume(vm: &mut dyn LuaApi, idx: i32, keep: bool) -> BridgeResult<()> {
    if !keep {
        vm.remove(idx)?;
    }
    Ok(())
}

/// Pull the value at `idx` as `declared`. Nil pulls as `HostValue::Nil`
/// whatever the declared type.
pub fn pull(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    declared: TypeKey,
    idx: i32,
    keep: bool,
) -> BridgeResult<HostValue> {
    let ty = vm.type_of(idx);
    if ty == LuaType::None {
        return Ok(HostValue::Nil);
    }
    if ty == LuaType::Nil {
        consume(vm, idx, keep)?;
        return Ok(HostValue::Nil);
    }

    let Some(rule) = rule(declared) else {
        return pull_custom(bridge, vm, declared, idx, keep);
    };

    let value = match rule {
        Rule::Unit => HostValue::Nil,
        Rule::Dynamic => return pull_any(bridge, vm, idx, keep),
        Rule::Str => HostValue::String(vm.to_str(idx).ok_or_else(|| mismatch(declared, ty.name()))?),
        Rule::Bool if ty == LuaType::Boolean => HostValue::Bool(vm.to_bool(idx)),
        Rule::Bool => return Err(mismatch(declared, ty.name())),
        Rule::Float => HostValue::Number(vm.to_number(idx).ok_or_else(|| mismatch(declared, ty.name()))?),
        Rule::Int { min, max } => {
            let n = vm.to_number(idx).ok_or_else(|| mismatch(declared, ty.name()))?;
            if n.fract() != 0.0 || n < min || n > max {
                return Err(mismatch(declared, format!("number {}", n)));
            }
            HostValue::Integer(n as i64)
        }
        Rule::Handle => {
            vm.push_value(idx)?;
            let reference = vm.reference_create()?;
            bridge.handles().track(reference);
            return Ok(HostValue::Handle(reference));
        }
        Rule::Function => {
            return FunctionRef::from_stack(bridge, vm, idx, true).map(HostValue::Function)
        }
        Rule::Table => return TableRef::from_stack(bridge, vm, idx, true).map(HostValue::Table),
        Rule::Reference => {
            return LuaReference::from_stack(bridge, vm, idx, true).map(HostValue::Reference)
        }
        Rule::Object => {
            return resolve_userdata(bridge, vm, idx)?
                .map(HostValue::Object)
                .ok_or_else(|| mismatch(declared, ty.name()))
        }
    };
    consume(vm, idx, keep)?;
    Ok(value)
}

fn pull_custom(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    declared: TypeKey,
    idx: i32,
    keep: bool,
) -> BridgeResult<HostValue> {
    if let Some(obj) = resolve_userdata(bridge, vm, idx)? {
        if obj.type_key() != declared {
            return Err(mismatch(declared, obj.type_key().short_name()));
        }
        return Ok(HostValue::Object(obj));
    }
    let ty = vm.type_of(idx);
    if bridge.catalog().contains(declared) {
        return Err(mismatch(declared, ty.name()));
    }
    match bridge.transformers().lookup(declared) {
        Some(transformer) => transformer
            .parse_object(bridge, vm, idx, keep)?
            .map(HostValue::Object)
            .ok_or_else(|| mismatch(declared, ty.name())),
        None => Err(BridgeError::UnsupportedType {
            type_name: declared.short_name(),
        }),
    }
}

/// Pull the value at `idx`, inferring the host type from its runtime type
pub fn pull_any(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    idx: i32,
    keep: bool,
) -> BridgeResult<HostValue> {
    let value = match vm.type_of(idx) {
        LuaType::None => return Ok(HostValue::Nil),
        LuaType::Nil => HostValue::Nil,
        LuaType::Boolean => HostValue::Bool(vm.to_bool(idx)),
        LuaType::Number => HostValue::Number(vm.to_number(idx).unwrap_or_default()),
        LuaType::String => HostValue::String(vm.to_str(idx).unwrap_or_default()),
        LuaType::Function => {
            return FunctionRef::from_stack(bridge, vm, idx, true).map(HostValue::Function)
        }
        LuaType::Table => return TableRef::from_stack(bridge, vm, idx, true).map(HostValue::Table),
        LuaType::UserData => {
            return match resolve_userdata(bridge, vm, idx)? {
                Some(obj) => Ok(HostValue::Object(obj)),
                None => LuaReference::from_stack(bridge, vm, idx, true).map(HostValue::Reference),
            }
        }
    };
    consume(vm, idx, keep)?;
    Ok(value)
}

/// Host object behind a projected userdata at `idx`.
///
/// `None` when the value is not a userdata of a projected type; an error when
/// it is one but its handle is no longer live.
pub fn resolve_userdata(
    bridge: &Bridge,
    vm: &dyn LuaApi,
    idx: i32,
) -> BridgeResult<Option<HostObject>> {
    let Some((type_id, payload)) = vm.to_userdata(idx) else {
        return Ok(None);
    };
    if bridge.types().key_of(type_id).is_none() {
        return Ok(None);
    }
    bridge.handles().get(Handle::from_bits(payload)).map(Some)
}

/// Candidate host type for the value at `idx`, used for overload resolution
pub fn infer_type(bridge: &Bridge, vm: &dyn LuaApi, idx: i32) -> TypeKey {
    match vm.type_of(idx) {
        LuaType::None | LuaType::Nil => TypeKey::of::<HostValue>(),
        LuaType::Boolean => TypeKey::of::<bool>(),
        LuaType::Number => TypeKey::of::<f64>(),
        LuaType::String => TypeKey::of::<String>(),
        LuaType::Function => TypeKey::of::<FunctionRef>(),
        LuaType::Table => TypeKey::of::<TableRef>(),
        LuaType::UserData => vm
            .to_userdata(idx)
            .and_then(|(type_id, _)| bridge.types().key_of(type_id))
            .unwrap_or_else(TypeKey::of::<LuaReference>),
    }
}

/// Whether `value` is acceptable where `key` is declared
pub fn conforms(value: &HostValue, key: TypeKey) -> bool {
    if value.is_nil() {
        return true;
    }
    match rule(key) {
        Some(Rule::Unit) => false,
        Some(Rule::Dynamic) => true,
        Some(Rule::Str) => matches!(value, HostValue::String(_)),
        Some(Rule::Bool) => matches!(value, HostValue::Bool(_)),
        Some(Rule::Float) => matches!(value, HostValue::Number(_) | HostValue::Integer(_)),
        Some(Rule::Int { min, max }) => value
            .as_i64()
            .map(|i| (i as f64) >= min && (i as f64) <= max)
            .unwrap_or(false),
        Some(Rule::Handle) => matches!(value, HostValue::Handle(_)),
        Some(Rule::Function) => matches!(value, HostValue::Function(_)),
        Some(Rule::Table) => matches!(value, HostValue::Table(_)),
        Some(Rule::Reference) => matches!(
            value,
            HostValue::Reference(_) | HostValue::Function(_) | HostValue::Table(_)
        ),
        Some(Rule::Object) => matches!(value, HostValue::Object(_)),
        None => matches!(value, HostValue::Object(obj) if obj.type_key() == key),
    }
}

// ============================================================================
// Table conversion
// ============================================================================

enum EntryKey {
    Index(i64),
    Name(String),
}

/// Read every entry of the table at `idx`, converting nested tables
/// recursively. `depth` is the nesting level of this table.
fn read_entries(
    bridge: &Arc<Bridge>,
    vm: &mut dyn LuaApi,
    idx: i32,
    depth: usize,
    expected: TypeKey,
) -> BridgeResult<Vec<(EntryKey, HostValue)>> {
    let limit = bridge.config().max_table_depth;
    if depth >= limit {
        return Err(BridgeError::DepthExceeded(limit));
    }
    let ty = vm.type_of(idx);
    if ty != LuaType::Table {
        return Err(mismatch(expected, ty.name()));
    }

    let table = absolute(vm, idx);
    let base = vm.top();
    let mut entries = Vec::new();
    vm.push_nil();
    loop {
        let step = vm.next(table).map_err(BridgeError::from).and_then(|more| {
            if !more {
                return Ok(None);
            }
            let key = match vm.type_of(-2) {
                LuaType::String => EntryKey::Name(vm.to_str(-2).unwrap_or_default()),
                LuaType::Number => {
                    let n = vm.to_number(-2).unwrap_or_default();
                    if n.fract() == 0.0 {
                        EntryKey::Index(n as i64)
                    } else {
                        EntryKey::Name(n.to_string())
                    }
                }
                other => return Err(mismatch(expected, format!("table with {} key", other))),
            };
            let value = read_data(bridge, vm, -1, depth + 1)?;
            vm.pop(1);
            Ok(Some((key, value)))
        });
        match step {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => break,
            Err(err) => {
                vm.set_top(base);
                return Err(err);
            }
        }
    }
    Ok(entries)
}

/// Convert any VM value into plain host data: tables become lists or maps
fn read_data(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, idx: i32, depth: usize) -> BridgeResult<HostValue> {
    if vm.type_of(idx) != LuaType::Table {
        return pull_any(bridge, vm, idx, true);
    }
    let entries = read_entries(bridge, vm, idx, depth, TypeKey::of::<HostMap>())?;
    let is_sequence = !entries.is_empty()
        && entries.iter().all(|(k, _)| matches!(k, EntryKey::Index(_)))
        && sequence_order(&entries).is_some();
    if is_sequence {
        Ok(HostValue::list(into_list(entries).0))
    } else {
        Ok(HostValue::map(into_map(entries)))
    }
}

/// Positions of the entries when their keys are exactly `1..=n`
fn sequence_order(entries: &[(EntryKey, HostValue)]) -> Option<Vec<usize>> {
    let mut order = vec![usize::MAX; entries.len()];
    for (pos, (key, _)) in entries.iter().enumerate() {
        let EntryKey::Index(i) = key else {
            return None;
        };
        let slot = usize::try_from(*i).ok()?.checked_sub(1)?;
        let target = order.get_mut(slot)?;
        *target = pos;
    }
    order.iter().all(|&p| p != usize::MAX).then_some(order)
}

fn into_list(entries: Vec<(EntryKey, HostValue)>) -> HostList {
    let order = sequence_order(&entries).unwrap_or_default();
    let mut values: Vec<Option<HostValue>> = entries.into_iter().map(|(_, v)| Some(v)).collect();
    HostList(order.into_iter().filter_map(|pos| values[pos].take()).collect())
}

fn into_map(entries: Vec<(EntryKey, HostValue)>) -> HostMap {
    let mut map = HostMap::new();
    for (key, value) in entries {
        let key = match key {
            EntryKey::Index(i) => i.to_string(),
            EntryKey::Name(name) => name,
        };
        map.insert(key, value);
    }
    map
}

/// Convert the table at `idx` into a map; integer keys become their decimal
/// string. The table stays on the stack.
pub fn read_map(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, idx: i32, depth: usize) -> BridgeResult<HostMap> {
    let entries = read_entries(bridge, vm, idx, depth, TypeKey::of::<HostMap>())?;
    Ok(into_map(entries))
}

/// Convert the array table at `idx` into a list. The table stays on the
/// stack.
pub fn read_list(bridge: &Arc<Bridge>, vm: &mut dyn LuaApi, idx: i32, depth: usize) -> BridgeResult<HostList> {
    let entries = read_entries(bridge, vm, idx, depth, TypeKey::of::<HostList>())?;
    if sequence_order(&entries).is_none() {
        return Err(mismatch(TypeKey::of::<HostList>(), "table with non-sequence keys"));
    }
    Ok(into_list(entries))
}
