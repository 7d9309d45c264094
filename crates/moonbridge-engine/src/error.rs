//! Error types for the bridge

use crate::config::ConfigError;
use crate::vm::LuaError;
use std::fmt;

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Direction of a conversion across the VM boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host value pushed onto the VM stack
    ToVm,
    /// VM stack value pulled into the host
    FromVm,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToVm => f.write_str("host to vm"),
            Direction::FromVm => f.write_str("vm to host"),
        }
    }
}

/// Bridge error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// Type mismatch during conversion
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        got: String,
    },

    /// Handle or reference slot is no longer valid
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// No method matches the runtime argument types
    #[error("No overload matches {signature}")]
    OverloadNotFound {
        /// Attempted signature, e.g. `Print(String)`
        signature: String,
    },

    /// Method exists but is not exposed to scripts
    #[error("Access denied: {method} is not exposed")]
    AccessDenied {
        /// Signature of the matched method
        method: String,
    },

    /// Neither a primitive rule nor a transformer handles the type
    #[error("Unsupported type: {type_name}")]
    UnsupportedType {
        /// Host type name
        type_name: String,
    },

    /// Transformer does not implement the requested direction
    #[error("Transformer {transformer} does not convert {direction}")]
    NotImplemented {
        /// Transformer target type name
        transformer: String,
        /// Requested direction
        direction: Direction,
    },

    /// Property has no getter or setter
    #[error("Property {type_name}.{property} is not accessible")]
    PropertyNotFound {
        /// Projected type name
        type_name: String,
        /// Property name
        property: String,
    },

    /// Several methods share a name without being marked overloaded
    #[error("Ambiguous method {type_name}.{method}")]
    AmbiguousMethod {
        /// Type name
        type_name: String,
        /// Method name
        method: String,
    },

    /// Reference slot was already freed
    #[error("Reference {0} was already released")]
    ReferenceReleased(String),

    /// Nested table conversion went deeper than allowed
    #[error("Table nesting exceeds depth {0}")]
    DepthExceeded(usize),

    /// Task scheduler shut down before the task ran
    #[error("Task scheduler is closed")]
    SchedulerClosed,

    /// Host method failed
    #[error("{0}")]
    Host(String),

    /// VM-level error
    #[error(transparent)]
    Vm(#[from] LuaError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::TypeMismatch`]
    pub fn mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

impl From<String> for BridgeError {
    fn from(s: String) -> Self {
        BridgeError::Host(s)
    }
}

impl From<&str> for BridgeError {
    fn from(s: &str) -> Self {
        BridgeError::Host(s.to_string())
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<BridgeError> for LuaError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Vm(inner) => inner,
            other => LuaError::Runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_errors_pass_through() {
        let err = BridgeError::from(LuaError::StackOverflow);
        assert_eq!(LuaError::from(err), LuaError::StackOverflow);
    }

    #[test]
    fn test_bridge_errors_become_runtime_errors() {
        let err = BridgeError::OverloadNotFound {
            signature: "Print()".to_string(),
        };
        assert_eq!(
            LuaError::from(err),
            LuaError::Runtime("No overload matches Print()".to_string())
        );
    }
}
