//! In-process VM state
//!
//! A compact implementation of [`LuaApi`]: a value stack with call frames, a
//! globals table, named metatables, a reference table with slot reuse and tick
//! hooks. Native functions are the only callable values; script code is
//! represented by host closures pushed with [`LuaApi::push_function`].
//!
//! `State` holds `Rc`s and is therefore neither `Send` nor `Sync`: it stays on
//! the thread that created it.

use super::api::{LuaApi, LuaError, LuaResult, LuaType, NativeFn, RefId, TypeId, MULTRET};
use super::value::{Table, TableRef, UserData, Value};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Maximum nesting of native calls
const MAX_CALL_DEPTH: usize = 200;

/// Maximum `__index` / `__newindex` chain length
const MAX_META_CHAIN: usize = 100;

/// A single VM instance
pub struct State {
    /// Value stack shared by all frames
    stack: Vec<Value>,
    /// Base stack offset of each active call frame (frame 0 is the host)
    frames: Vec<usize>,
    /// Globals table
    globals: TableRef,
    /// Named metatables, indexed by `TypeId - 1`
    metatables: Vec<(String, TableRef)>,
    /// Metatable name to TypeId
    metatable_ids: FxHashMap<String, TypeId>,
    /// Reference table; `None` marks a free slot
    references: Vec<Option<Value>>,
    /// Free reference slots for reuse
    free_references: Vec<usize>,
    /// Tick hooks in registration order
    tick_hooks: IndexMap<String, NativeFn>,
}

impl State {
    /// Create a new VM with an empty globals table
    pub fn new() -> Self {
        let globals: TableRef = Rc::new(RefCell::new(Table::default()));
        Self {
            stack: Vec::new(),
            frames: vec![0],
            globals,
            metatables: Vec::new(),
            metatable_ids: FxHashMap::default(),
            references: Vec::new(),
            free_references: Vec::new(),
            tick_hooks: IndexMap::new(),
        }
    }

    /// Run every tick hook once. All hooks run even if one fails; the first
    /// error is returned.
    pub fn tick(&mut self) -> LuaResult<()> {
        let hooks: Vec<(String, NativeFn)> = self
            .tick_hooks
            .iter()
            .map(|(id, f)| (id.clone(), f.clone()))
            .collect();
        let mut first_error = None;
        for (id, hook) in hooks {
            let base = self.top();
            self.push_function(hook);
            if let Err(err) = self.call(0, 0) {
                tracing::error!(hook = %id, error = %err, "tick hook failed");
                first_error.get_or_insert(err);
            }
            self.set_top(base);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of tick hooks installed
    pub fn tick_hook_count(&self) -> usize {
        self.tick_hooks.len()
    }

    /// Number of live reference slots
    pub fn live_references(&self) -> usize {
        self.references.iter().filter(|slot| slot.is_some()).count()
    }

    /// Push the global `name`
    pub fn get_global(&mut self, name: &str) -> LuaType {
        let value = self.globals.borrow().get_str(name);
        let ty = value.lua_type();
        self.stack.push(value);
        ty
    }

    /// Pop the top value into the global `name`
    pub fn set_global(&mut self, name: &str) {
        let value = self.stack.pop().unwrap_or(Value::Nil);
        self.globals
            .borrow_mut()
            .set(Value::String(Rc::from(name)), value);
    }

    /// Push the value at a dotted path starting from the globals
    /// (`"DocStore.Driver.Client"`), pushing nil when a segment is missing.
    pub fn get_path(&mut self, path: &str) -> LuaResult<LuaType> {
        self.push_globals();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            if !matches!(self.type_of(-1), LuaType::Table | LuaType::UserData) {
                self.pop(1);
                self.push_nil();
                return Ok(LuaType::Nil);
            }
            self.get_field(-1, segment)?;
            self.remove(-2)?;
        }
        Ok(self.type_of(-1))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn base(&self) -> usize {
        self.frames.last().copied().unwrap_or(0)
    }

    fn abs_index(&self, idx: i32) -> Option<usize> {
        let base = self.base();
        let len = self.stack.len();
        if idx > 0 {
            let pos = base + idx as usize - 1;
            (pos < len).then_some(pos)
        } else if idx < 0 {
            let back = idx.unsigned_abs() as usize;
            (back <= len - base).then(|| len - back)
        } else {
            None
        }
    }

    fn value_at(&self, idx: i32) -> Option<&Value> {
        self.abs_index(idx).map(|pos| &self.stack[pos])
    }

    fn checked_value(&self, idx: i32) -> LuaResult<Value> {
        self.value_at(idx).cloned().ok_or(LuaError::InvalidIndex(idx))
    }

    fn table_at(&self, idx: i32) -> LuaResult<TableRef> {
        match self.checked_value(idx)? {
            Value::Table(t) => Ok(t),
            other => Err(LuaError::NotIndexable(other.lua_type().name())),
        }
    }

    fn pop_value(&mut self) -> LuaResult<Value> {
        if self.stack.len() <= self.base() {
            return Err(LuaError::InvalidIndex(-1));
        }
        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    fn metatable_of(&self, value: &Value) -> Option<TableRef> {
        match value {
            Value::Table(t) => t.borrow().metatable.clone(),
            Value::UserData(u) => self.metatable_by_id(u.type_id),
            _ => None,
        }
    }

    fn metatable_by_id(&self, type_id: TypeId) -> Option<TableRef> {
        let slot = (type_id.as_u32() as usize).checked_sub(1)?;
        self.metatables.get(slot).map(|(_, t)| t.clone())
    }

    /// Call `func` with `args`, returning the first result
    fn call_value(&mut self, func: Value, args: Vec<Value>) -> LuaResult<Value> {
        let base = self.stack.len();
        let nargs = args.len() as i32;
        self.stack.push(func);
        self.stack.extend(args);
        self.call(nargs, 1)?;
        let result = self.stack.pop().unwrap_or(Value::Nil);
        self.stack.truncate(base);
        Ok(result)
    }

    /// `obj[key]` with `__index` handling
    fn index(&mut self, obj: Value, key: Value) -> LuaResult<Value> {
        let mut current = obj;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(t) = &current {
                let raw = t.borrow().get(&key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
            }
            let handler = match self.metatable_of(&current) {
                Some(mt) => mt.borrow().get_str("__index"),
                None => Value::Nil,
            };
            match handler {
                Value::Nil => {
                    return match current {
                        Value::Table(_) => Ok(Value::Nil),
                        other => Err(LuaError::NotIndexable(other.lua_type().name())),
                    };
                }
                Value::Function(_) => return self.call_value(handler, vec![current, key]),
                next => current = next,
            }
        }
        Err(LuaError::Runtime("'__index' chain too long".to_string()))
    }

    /// `obj[key] = value` with `__newindex` handling
    fn new_index(&mut self, obj: Value, key: Value, value: Value) -> LuaResult<()> {
        let mut current = obj;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(t) = &current {
                let exists = !t.borrow().get(&key).is_nil();
                let handler = self
                    .metatable_of(&current)
                    .map(|mt| mt.borrow().get_str("__newindex"))
                    .unwrap_or(Value::Nil);
                if exists || handler.is_nil() {
                    if !t.borrow_mut().set(key, value) {
                        return Err(LuaError::Runtime("table index is nil or NaN".to_string()));
                    }
                    return Ok(());
                }
                match handler {
                    Value::Function(_) => {
                        self.call_value(handler, vec![current, key, value])?;
                        return Ok(());
                    }
                    next => current = next,
                }
                continue;
            }
            let handler = self
                .metatable_of(&current)
                .map(|mt| mt.borrow().get_str("__newindex"))
                .unwrap_or(Value::Nil);
            match handler {
                Value::Nil => return Err(LuaError::NotIndexable(current.lua_type().name())),
                Value::Function(_) => {
                    self.call_value(handler, vec![current, key, value])?;
                    return Ok(());
                }
                next => current = next,
            }
        }
        Err(LuaError::Runtime("'__newindex' chain too long".to_string()))
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaApi for State {
    fn top(&self) -> i32 {
        (self.stack.len() - self.base()) as i32
    }

    fn set_top(&mut self, top: i32) {
        let base = self.base();
        let target = if top >= 0 {
            base + top as usize
        } else {
            let drop = (-top - 1) as usize;
            self.stack.len().saturating_sub(drop).max(base)
        };
        self.stack.resize(target, Value::Nil);
    }

    fn remove(&mut self, idx: i32) -> LuaResult<()> {
        let pos = self.abs_index(idx).ok_or(LuaError::InvalidIndex(idx))?;
        self.stack.remove(pos);
        Ok(())
    }

    fn push_value(&mut self, idx: i32) -> LuaResult<()> {
        let value = self.checked_value(idx)?;
        self.stack.push(value);
        Ok(())
    }

    fn push_nil(&mut self) {
        self.stack.push(Value::Nil);
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(Value::Boolean(value));
    }

    fn push_number(&mut self, value: f64) {
        self.stack.push(Value::Number(value));
    }

    fn push_string(&mut self, value: &str) {
        self.stack.push(Value::String(Rc::from(value)));
    }

    fn push_function(&mut self, func: NativeFn) {
        self.stack.push(Value::Function(func));
    }

    fn type_of(&self, idx: i32) -> LuaType {
        self.value_at(idx)
            .map(Value::lua_type)
            .unwrap_or(LuaType::None)
    }

    fn to_bool(&self, idx: i32) -> bool {
        self.value_at(idx).map(Value::truthy).unwrap_or(false)
    }

    fn to_number(&self, idx: i32) -> Option<f64> {
        match self.value_at(idx)? {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn to_str(&self, idx: i32) -> Option<String> {
        match self.value_at(idx)? {
            Value::String(s) => Some(s.to_string()),
            _ => None,
        }
    }

    fn create_table(&mut self) {
        self.stack.push(Value::new_table());
    }

    fn get_field(&mut self, idx: i32, name: &str) -> LuaResult<LuaType> {
        let obj = self.checked_value(idx)?;
        let value = self.index(obj, Value::String(Rc::from(name)))?;
        let ty = value.lua_type();
        self.stack.push(value);
        Ok(ty)
    }

    fn set_field(&mut self, idx: i32, name: &str) -> LuaResult<()> {
        let obj = self.checked_value(idx)?;
        let value = self.pop_value()?;
        self.new_index(obj, Value::String(Rc::from(name)), value)
    }

    fn raw_get(&mut self, idx: i32) -> LuaResult<LuaType> {
        let table = self.table_at(idx)?;
        let key = self.pop_value()?;
        let value = table.borrow().get(&key);
        let ty = value.lua_type();
        self.stack.push(value);
        Ok(ty)
    }

    fn raw_set(&mut self, idx: i32) -> LuaResult<()> {
        let table = self.table_at(idx)?;
        let value = self.pop_value()?;
        let key = self.pop_value()?;
        if !table.borrow_mut().set(key, value) {
            return Err(LuaError::Runtime("table index is nil or NaN".to_string()));
        }
        Ok(())
    }

    fn next(&mut self, idx: i32) -> LuaResult<bool> {
        let table = self.table_at(idx)?;
        let key = self.pop_value()?;
        let entry = table.borrow().next(&key);
        match entry {
            Some((k, v)) => {
                self.stack.push(k);
                self.stack.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn push_globals(&mut self) {
        self.stack.push(Value::Table(self.globals.clone()));
    }

    fn create_metatable(&mut self, name: &str) -> LuaResult<TypeId> {
        if let Some(id) = self.metatable_ids.get(name).copied() {
            self.push_metatable(id);
            return Ok(id);
        }
        let table: TableRef = Rc::new(RefCell::new(Table::default()));
        table
            .borrow_mut()
            .set(Value::String(Rc::from("__name")), Value::String(Rc::from(name)));
        self.metatables.push((name.to_string(), table.clone()));
        let id = TypeId::from_u32(self.metatables.len() as u32);
        self.metatable_ids.insert(name.to_string(), id);
        self.stack.push(Value::Table(table));
        Ok(id)
    }

    fn push_metatable(&mut self, type_id: TypeId) -> bool {
        match self.metatable_by_id(type_id) {
            Some(t) => {
                self.stack.push(Value::Table(t));
                true
            }
            None => false,
        }
    }

    fn set_metatable(&mut self, idx: i32) -> LuaResult<()> {
        let target = self.table_at(idx)?;
        let meta = match self.pop_value()? {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => {
                return Err(LuaError::Runtime(format!(
                    "metatable must be a table, got {}",
                    other.lua_type()
                )))
            }
        };
        target.borrow_mut().metatable = meta;
        Ok(())
    }

    fn metatable_type(&self, idx: i32) -> Option<TypeId> {
        match self.value_at(idx)? {
            Value::UserData(u) => Some(u.type_id),
            value @ Value::Table(_) => {
                let mt = self.metatable_of(value)?;
                self.metatables
                    .iter()
                    .position(|(_, t)| Rc::ptr_eq(t, &mt))
                    .map(|i| TypeId::from_u32(i as u32 + 1))
            }
            _ => None,
        }
    }

    fn push_userdata(&mut self, type_id: TypeId, payload: u64) -> LuaResult<()> {
        if self.metatable_by_id(type_id).is_none() {
            return Err(LuaError::Runtime(format!("unknown metatable {}", type_id)));
        }
        self.stack
            .push(Value::UserData(Rc::new(UserData { type_id, payload })));
        Ok(())
    }

    fn to_userdata(&self, idx: i32) -> Option<(TypeId, u64)> {
        match self.value_at(idx)? {
            Value::UserData(u) => Some((u.type_id, u.payload)),
            _ => None,
        }
    }

    fn reference_create(&mut self) -> LuaResult<RefId> {
        let value = self.pop_value()?;
        let slot = match self.free_references.pop() {
            Some(slot) => {
                self.references[slot] = Some(value);
                slot
            }
            None => {
                self.references.push(Some(value));
                self.references.len() - 1
            }
        };
        Ok(RefId::from_raw(slot as i32 + 1))
    }

    fn reference_push(&mut self, reference: RefId) -> LuaResult<()> {
        let value = usize::try_from(reference.as_raw() - 1)
            .ok()
            .and_then(|slot| self.references.get(slot))
            .and_then(|v| v.clone())
            .ok_or(LuaError::InvalidReference(reference))?;
        self.stack.push(value);
        Ok(())
    }

    fn reference_free(&mut self, reference: RefId) -> bool {
        let Ok(slot) = usize::try_from(reference.as_raw() - 1) else {
            return false;
        };
        match self.references.get_mut(slot) {
            Some(entry @ Some(_)) => {
                *entry = None;
                self.free_references.push(slot);
                true
            }
            _ => false,
        }
    }

    fn call(&mut self, nargs: i32, nresults: i32) -> LuaResult<()> {
        let base = self.base();
        let func_pos = self
            .stack
            .len()
            .checked_sub(nargs.max(0) as usize + 1)
            .filter(|pos| *pos >= base)
            .ok_or(LuaError::InvalidIndex(-(nargs + 1)))?;

        let func = match &self.stack[func_pos] {
            Value::Function(f) => f.clone(),
            other => {
                let name = other.lua_type().name();
                self.stack.truncate(func_pos);
                return Err(LuaError::NotCallable(name));
            }
        };
        if self.frames.len() >= MAX_CALL_DEPTH {
            self.stack.truncate(func_pos);
            return Err(LuaError::StackOverflow);
        }

        self.frames.push(func_pos + 1);
        let outcome = func(&mut *self);
        self.frames.pop();

        match outcome {
            Ok(count) => {
                let available = self.stack.len() - (func_pos + 1);
                let count = (count.max(0) as usize).min(available);
                let mut results = self.stack.split_off(self.stack.len() - count);
                self.stack.truncate(func_pos);
                if nresults != MULTRET {
                    results.resize(nresults.max(0) as usize, Value::Nil);
                }
                self.stack.extend(results);
                Ok(())
            }
            Err(err) => {
                self.stack.truncate(func_pos);
                Err(err)
            }
        }
    }

    fn add_tick_hook(&mut self, id: &str, hook: NativeFn) {
        self.tick_hooks.insert(id.to_string(), hook);
    }

    fn remove_tick_hook(&mut self, id: &str) -> bool {
        self.tick_hooks.shift_remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> NativeFn {
        Rc::new(|vm: &mut dyn LuaApi| -> LuaResult<i32> {
            let a = vm.to_number(1).unwrap_or(0.0);
            let b = vm.to_number(2).unwrap_or(0.0);
            vm.push_number(a + b);
            Ok(1)
        })
    }

    #[test]
    fn test_stack_indices() {
        let mut vm = State::new();
        vm.push_number(1.0);
        vm.push_string("two");
        vm.push_bool(true);

        assert_eq!(vm.top(), 3);
        assert_eq!(vm.type_of(1), LuaType::Number);
        assert_eq!(vm.type_of(-1), LuaType::Boolean);
        assert_eq!(vm.to_str(-2).as_deref(), Some("two"));
        assert_eq!(vm.type_of(4), LuaType::None);

        vm.remove(1).unwrap();
        assert_eq!(vm.type_of(1), LuaType::String);
        vm.pop(1);
        assert_eq!(vm.top(), 1);
        vm.set_top(3);
        assert_eq!(vm.type_of(3), LuaType::Nil);
    }

    #[test]
    fn test_call_adjusts_results() {
        let mut vm = State::new();
        vm.push_function(adder());
        vm.push_number(2.0);
        vm.push_number(40.0);
        vm.call(2, 1).unwrap();
        assert_eq!(vm.top(), 1);
        assert_eq!(vm.to_number(-1), Some(42.0));

        vm.set_top(0);
        vm.push_function(adder());
        vm.call(0, 3).unwrap();
        assert_eq!(vm.top(), 3);
        assert_eq!(vm.type_of(3), LuaType::Nil);
    }

    #[test]
    fn test_call_error_restores_stack() {
        let mut vm = State::new();
        vm.push_string("keep");
        vm.push_function(Rc::new(|vm: &mut dyn LuaApi| -> LuaResult<i32> {
            vm.push_number(1.0);
            Err(LuaError::Runtime("boom".to_string()))
        }));
        vm.push_number(5.0);
        let err = vm.call(1, 0).unwrap_err();
        assert_eq!(err, LuaError::Runtime("boom".to_string()));
        assert_eq!(vm.top(), 1);

        vm.push_number(3.0);
        assert_eq!(vm.call(0, 0), Err(LuaError::NotCallable("number")));
        assert_eq!(vm.top(), 1);
    }

    #[test]
    fn test_fields_and_index_metamethod() {
        let mut vm = State::new();
        vm.create_metatable("Point").unwrap();
        vm.push_string("x");
        vm.push_number(7.0);
        vm.raw_set(-3).unwrap();
        vm.push_value(-1).unwrap();
        vm.set_field(-2, "__index").unwrap();

        vm.create_table();
        vm.push_value(-2).unwrap();
        vm.set_metatable(-2).unwrap();

        assert_eq!(vm.get_field(-1, "x").unwrap(), LuaType::Number);
        assert_eq!(vm.to_number(-1), Some(7.0));
        vm.pop(1);
        assert_eq!(vm.get_field(-1, "missing").unwrap(), LuaType::Nil);
        vm.pop(1);
        assert!(vm.metatable_type(-1).is_some());
    }

    #[test]
    fn test_metatables_are_reused_by_name() {
        let mut vm = State::new();
        let a = vm.create_metatable("Thing").unwrap();
        let b = vm.create_metatable("Thing").unwrap();
        let c = vm.create_metatable("Other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(vm.top(), 3);
    }

    #[test]
    fn test_userdata_without_index_is_not_indexable() {
        let mut vm = State::new();
        let id = vm.create_metatable("Opaque").unwrap();
        vm.pop(1);
        vm.push_userdata(id, 99).unwrap();
        assert_eq!(vm.to_userdata(-1), Some((id, 99)));
        assert_eq!(
            vm.get_field(-1, "x"),
            Err(LuaError::NotIndexable("userdata"))
        );
    }

    #[test]
    fn test_references_reuse_slots() {
        let mut vm = State::new();
        vm.push_string("a");
        let r1 = vm.reference_create().unwrap();
        assert_eq!(vm.top(), 0);
        assert_eq!(vm.live_references(), 1);

        vm.reference_push(r1).unwrap();
        assert_eq!(vm.to_str(-1).as_deref(), Some("a"));

        assert!(vm.reference_free(r1));
        assert!(!vm.reference_free(r1));
        assert!(vm.reference_push(r1).is_err());

        vm.push_string("b");
        let r2 = vm.reference_create().unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_next_traversal() {
        let mut vm = State::new();
        vm.create_table();
        for (k, v) in [("a", 1.0), ("b", 2.0)] {
            vm.push_number(v);
            vm.set_field(-2, k).unwrap();
        }

        let mut seen = Vec::new();
        vm.push_nil();
        while vm.next(-2).unwrap() {
            seen.push((vm.to_str(-2).unwrap(), vm.to_number(-1).unwrap()));
            vm.pop(1);
        }
        assert_eq!(seen, vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)]);
        assert_eq!(vm.top(), 1);
    }

    #[test]
    fn test_tick_hooks() {
        let mut vm = State::new();
        vm.add_tick_hook(
            "counter",
            Rc::new(|vm: &mut dyn LuaApi| -> LuaResult<i32> {
                vm.get_field(-1, "missing").map(|_| 0)
            }),
        );
        assert_eq!(vm.tick_hook_count(), 1);
        // The hook runs in its own frame, so position -1 does not exist
        assert!(vm.tick().is_err());

        assert!(vm.remove_tick_hook("counter"));
        assert!(!vm.remove_tick_hook("counter"));
        assert!(vm.tick().is_ok());
    }

    #[test]
    fn test_get_path() {
        let mut vm = State::new();
        vm.create_table();
        vm.push_number(3.0);
        vm.set_field(-2, "Leaf").unwrap();
        vm.set_global("Root");

        assert_eq!(vm.get_path("Root.Leaf").unwrap(), LuaType::Number);
        assert_eq!(vm.to_number(-1), Some(3.0));
        assert_eq!(vm.get_path("Root.Missing.Deeper").unwrap(), LuaType::Nil);
    }
}
