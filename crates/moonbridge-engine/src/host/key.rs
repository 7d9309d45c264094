//! Host type identity

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a host type, as used by every registry in the bridge.
///
/// Equality and hashing use the Rust `TypeId` only; the name is carried for
/// error messages and signatures.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key of `T`
    pub fn of<T: Any + ?Sized>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Underlying Rust type id
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified Rust type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without module paths (`alloc::string::String` -> `String`,
    /// `Vec<alloc::string::String>` -> `Vec<String>`)
    pub fn short_name(&self) -> String {
        let mut out = String::with_capacity(self.name.len());
        let mut segment = String::new();
        for c in self.name.chars() {
            match c {
                ':' => segment.clear(),
                '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&' => {
                    out.push_str(&segment);
                    segment.clear();
                    out.push(c);
                }
                _ => segment.push(c),
            }
        }
        out.push_str(&segment);
        out
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(TypeKey::of::<String>().short_name(), "String");
        assert_eq!(TypeKey::of::<Vec<String>>().short_name(), "Vec<String>");
        assert_eq!(TypeKey::of::<&'static str>().short_name(), "&str");
        assert_eq!(TypeKey::of::<f64>().short_name(), "f64");
    }

    #[test]
    fn test_equality_ignores_name() {
        assert_eq!(TypeKey::of::<u8>(), TypeKey::of::<u8>());
        assert_ne!(TypeKey::of::<u8>(), TypeKey::of::<i8>());
    }
}
