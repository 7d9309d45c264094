//! HostValue - host-side representation of values crossing the boundary
//!
//! Method invokers receive their arguments as `HostValue`s and return one.
//! [`FromHost`] and [`IntoHost`] convert between `HostValue` and ordinary Rust
//! types.

use super::key::TypeKey;
use super::object::HostObject;
use crate::bridge::reference::{FunctionRef, LuaReference, TableRef};
use crate::error::{BridgeError, BridgeResult};
use crate::vm::RefId;
use indexmap::IndexMap;
use std::any::Any;
use std::sync::Arc;

/// A value on the host side of the boundary
#[derive(Debug, Clone)]
pub enum HostValue {
    /// Absent value (VM nil)
    Nil,
    /// Boolean
    Bool(bool),
    /// Integer-typed number
    Integer(i64),
    /// Floating point number
    Number(f64),
    /// String
    String(String),
    /// Raw VM reference slot
    Handle(RefId),
    /// Referenced VM function
    Function(FunctionRef),
    /// Referenced VM table
    Table(TableRef),
    /// Referenced VM value of any type
    Reference(LuaReference),
    /// Host object (projected type or transformer target)
    Object(HostObject),
}

impl HostValue {
    /// Wrap a host object
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        HostValue::Object(HostObject::new(value))
    }

    /// Wrap a list
    pub fn list(items: Vec<HostValue>) -> Self {
        HostValue::object(HostList(items))
    }

    /// Wrap a map
    pub fn map(map: HostMap) -> Self {
        HostValue::object(map)
    }

    /// Short name of the value's kind, used in error messages
    pub fn kind_name(&self) -> String {
        match self {
            HostValue::Nil => "nil".to_string(),
            HostValue::Bool(_) => "bool".to_string(),
            HostValue::Integer(_) => "i64".to_string(),
            HostValue::Number(_) => "f64".to_string(),
            HostValue::String(_) => "String".to_string(),
            HostValue::Handle(_) => "RefId".to_string(),
            HostValue::Function(_) => "FunctionRef".to_string(),
            HostValue::Table(_) => "TableRef".to_string(),
            HostValue::Reference(_) => "LuaReference".to_string(),
            HostValue::Object(obj) => obj.type_key().short_name(),
        }
    }

    /// True for `Nil`
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value of either number variant
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Integer(i) => Some(*i as f64),
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer value; integral floats convert
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::Integer(i) => Some(*i),
            HostValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    /// String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Host object
    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            HostValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Borrowed host object of type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_object()?.downcast_ref::<T>()
    }

    /// Borrowed map
    pub fn as_map(&self) -> Option<&HostMap> {
        self.downcast_ref::<HostMap>()
    }

    /// Borrowed list
    pub fn as_list(&self) -> Option<&HostList> {
        self.downcast_ref::<HostList>()
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Nil, HostValue::Nil) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Integer(a), HostValue::Integer(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::Integer(a), HostValue::Number(b))
            | (HostValue::Number(b), HostValue::Integer(a)) => *a as f64 == *b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Handle(a), HostValue::Handle(b)) => a == b,
            (HostValue::Function(a), HostValue::Function(b)) => a.ref_id() == b.ref_id(),
            (HostValue::Table(a), HostValue::Table(b)) => a.ref_id() == b.ref_id(),
            (HostValue::Reference(a), HostValue::Reference(b)) => a.ref_id() == b.ref_id(),
            (HostValue::Object(a), HostValue::Object(b)) => {
                if a.ptr_eq(b) {
                    return true;
                }
                match (a.downcast_ref::<HostMap>(), b.downcast_ref::<HostMap>()) {
                    (Some(x), Some(y)) => return x == y,
                    _ => {}
                }
                match (a.downcast_ref::<HostList>(), b.downcast_ref::<HostList>()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// Sequence of values, marshalled as an array table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostList(pub Vec<HostValue>);

/// String-keyed map in insertion order, marshalled as a table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostMap(pub IndexMap<String, HostValue>);

impl HostMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning `self` for chaining
    pub fn with(mut self, key: impl Into<String>, value: impl IntoHost) -> Self {
        self.0.insert(key.into(), value.into_host());
        self
    }

    /// Value under `key`
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        self.0.get(key)
    }

    /// Insert a value
    pub fn insert(&mut self, key: impl Into<String>, value: HostValue) -> Option<HostValue> {
        self.0.insert(key.into(), value)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &HostValue)> {
        self.0.iter()
    }
}

// ============================================================================
// Conversion traits
// ============================================================================

/// Extract a Rust value from a [`HostValue`]
pub trait FromHost: Sized {
    /// Host type this conversion expects, used in error messages
    fn expected() -> TypeKey;

    /// Convert, failing with `TypeMismatch`
    fn from_host(value: HostValue) -> BridgeResult<Self>;
}

/// Convert a Rust value into a [`HostValue`]
pub trait IntoHost {
    /// Convert
    fn into_host(self) -> HostValue;
}

fn mismatch<T: FromHost>(value: &HostValue) -> BridgeError {
    BridgeError::mismatch(T::expected().short_name(), value.kind_name())
}

impl FromHost for HostValue {
    fn expected() -> TypeKey {
        TypeKey::of::<HostValue>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        Ok(value)
    }
}

impl IntoHost for HostValue {
    fn into_host(self) -> HostValue {
        self
    }
}

impl FromHost for String {
    fn expected() -> TypeKey {
        TypeKey::of::<String>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::String(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl IntoHost for String {
    fn into_host(self) -> HostValue {
        HostValue::String(self)
    }
}

impl IntoHost for &str {
    fn into_host(self) -> HostValue {
        HostValue::String(self.to_string())
    }
}

impl FromHost for bool {
    fn expected() -> TypeKey {
        TypeKey::of::<bool>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        value.as_bool().ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl IntoHost for bool {
    fn into_host(self) -> HostValue {
        HostValue::Bool(self)
    }
}

impl FromHost for f64 {
    fn expected() -> TypeKey {
        TypeKey::of::<f64>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        value.as_f64().ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl IntoHost for f64 {
    fn into_host(self) -> HostValue {
        HostValue::Number(self)
    }
}

impl FromHost for f32 {
    fn expected() -> TypeKey {
        TypeKey::of::<f32>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        value
            .as_f64()
            .map(|n| n as f32)
            .ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl IntoHost for f32 {
    fn into_host(self) -> HostValue {
        HostValue::Number(self as f64)
    }
}

macro_rules! impl_integer {
    ($($ty:ty),*) => {
        $(
            impl FromHost for $ty {
                fn expected() -> TypeKey {
                    TypeKey::of::<$ty>()
                }

                fn from_host(value: HostValue) -> BridgeResult<Self> {
                    value
                        .as_i64()
                        .and_then(|i| <$ty>::try_from(i).ok())
                        .ok_or_else(|| mismatch::<Self>(&value))
                }
            }

            impl IntoHost for $ty {
                fn into_host(self) -> HostValue {
                    HostValue::Integer(self as i64)
                }
            }
        )*
    };
}

impl_integer!(i64, i32, i16, i8, u64, u32, u16, u8, usize);

impl FromHost for RefId {
    fn expected() -> TypeKey {
        TypeKey::of::<RefId>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Handle(r) => Ok(r),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromHost for FunctionRef {
    fn expected() -> TypeKey {
        TypeKey::of::<FunctionRef>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Function(f) => Ok(f),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl IntoHost for FunctionRef {
    fn into_host(self) -> HostValue {
        HostValue::Function(self)
    }
}

impl FromHost for TableRef {
    fn expected() -> TypeKey {
        TypeKey::of::<TableRef>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Table(t) => Ok(t),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl IntoHost for TableRef {
    fn into_host(self) -> HostValue {
        HostValue::Table(self)
    }
}

impl FromHost for LuaReference {
    fn expected() -> TypeKey {
        TypeKey::of::<LuaReference>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Reference(r) => Ok(r),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromHost for HostMap {
    fn expected() -> TypeKey {
        TypeKey::of::<HostMap>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        value
            .as_map()
            .cloned()
            .ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl IntoHost for HostMap {
    fn into_host(self) -> HostValue {
        HostValue::map(self)
    }
}

impl FromHost for HostList {
    fn expected() -> TypeKey {
        TypeKey::of::<HostList>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        value
            .as_list()
            .cloned()
            .ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl IntoHost for HostList {
    fn into_host(self) -> HostValue {
        HostValue::object(self)
    }
}

impl<T: Any + Send + Sync> FromHost for Arc<T> {
    fn expected() -> TypeKey {
        TypeKey::of::<T>()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        value
            .as_object()
            .and_then(|obj| obj.downcast::<T>())
            .ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl<T: Any + Send + Sync> IntoHost for Arc<T> {
    fn into_host(self) -> HostValue {
        HostValue::Object(HostObject::from_arc(self))
    }
}

impl<T: FromHost> FromHost for Option<T> {
    fn expected() -> TypeKey {
        T::expected()
    }

    fn from_host(value: HostValue) -> BridgeResult<Self> {
        match value {
            HostValue::Nil => Ok(None),
            other => T::from_host(other).map(Some),
        }
    }
}

impl<T: IntoHost> IntoHost for Option<T> {
    fn into_host(self) -> HostValue {
        match self {
            Some(v) => v.into_host(),
            None => HostValue::Nil,
        }
    }
}

impl IntoHost for () {
    fn into_host(self) -> HostValue {
        HostValue::Nil
    }
}
