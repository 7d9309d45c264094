//! In-VM value representation

use super::api::{LuaType, NativeFn, TypeId};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Shared, mutable table
pub(crate) type TableRef = Rc<RefCell<Table>>;

/// A value living on the VM stack or inside a table
#[derive(Clone)]
pub(crate) enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    Table(TableRef),
    Function(NativeFn),
    UserData(Rc<UserData>),
}

/// Full userdata: a host payload tagged with its metatable id
#[derive(Debug)]
pub(crate) struct UserData {
    pub type_id: TypeId,
    pub payload: u64,
}

impl Value {
    pub fn lua_type(&self) -> LuaType {
        match self {
            Value::Nil => LuaType::Nil,
            Value::Boolean(_) => LuaType::Boolean,
            Value::Number(_) => LuaType::Number,
            Value::String(_) => LuaType::String,
            Value::Table(_) => LuaType::Table,
            Value::Function(_) => LuaType::Function,
            Value::UserData(_) => LuaType::UserData,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn new_table() -> Value {
        Value::Table(Rc::new(RefCell::new(Table::default())))
    }

    /// Hashable identity of this value when used as a table key.
    /// `None` for nil and NaN, which cannot be keys.
    pub fn key(&self) -> Option<Key> {
        match self {
            Value::Nil => None,
            Value::Boolean(b) => Some(Key::Boolean(*b)),
            Value::Number(n) if n.is_nan() => None,
            Value::Number(n) => {
                if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    Some(Key::Integer(*n as i64))
                } else {
                    Some(Key::Float(n.to_bits()))
                }
            }
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Table(t) => Some(Key::Object(Rc::as_ptr(t) as *const () as usize)),
            Value::Function(f) => Some(Key::Object(Rc::as_ptr(f) as *const () as usize)),
            Value::UserData(u) => Some(Key::Object(Rc::as_ptr(u) as *const () as usize)),
        }
    }
}

/// Table key identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Key {
    Boolean(bool),
    Integer(i64),
    Float(u64),
    String(Rc<str>),
    Object(usize),
}

/// Insertion-ordered table.
///
/// Assigning nil to an existing key leaves a tombstone so that a traversal in
/// progress keeps its position; traversal skips tombstones.
#[derive(Default)]
pub(crate) struct Table {
    entries: IndexMap<Key, (Value, Value)>,
    pub metatable: Option<TableRef>,
}

impl Table {
    pub fn get(&self, key: &Value) -> Value {
        key.key()
            .and_then(|k| self.entries.get(&k))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Nil)
    }

    pub fn get_str(&self, name: &str) -> Value {
        self.entries
            .get(&Key::String(Rc::from(name)))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Nil)
    }

    /// Returns false when `key` cannot be used as a table key
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        let Some(k) = key.key() else {
            return false;
        };
        match self.entries.get_mut(&k) {
            Some(slot) => slot.1 = value,
            None if value.is_nil() => {}
            None => {
                self.entries.insert(k, (key, value));
            }
        }
        true
    }

    /// Entry following `key` (or the first entry for nil)
    pub fn next(&self, key: &Value) -> Option<(Value, Value)> {
        let start = match key.key() {
            None => 0,
            Some(k) => self.entries.get_index_of(&k)? + 1,
        };
        self.entries
            .values()
            .skip(start)
            .find(|(_, v)| !v.is_nil())
            .cloned()
    }

    /// Number of non-nil entries
    pub fn len(&self) -> usize {
        self.entries.values().filter(|(_, v)| !v.is_nil()).count()
    }
}
