//! LuaApi trait - the VM stack contract
//!
//! Everything the bridge does to the VM goes through this trait. Stack
//! positions follow the usual convention: positive indices are 1-based from
//! the base of the current call frame, negative indices count down from the
//! top (`-1` is the topmost value).
//!
//! # Threading
//!
//! The VM is single-threaded. Implementations are not expected to check which
//! thread calls them; callers must only use a `LuaApi` from the thread that
//! owns the VM. Work finishing on other threads goes through
//! [`crate::scheduler::TaskScheduler`] instead.

use std::fmt;
use std::rc::Rc;

/// Passed as `nresults` to [`LuaApi::call`] to keep every returned value.
pub const MULTRET: i32 = -1;

/// Runtime type tag of a VM value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LuaType {
    /// Stack position does not hold a value
    None,
    /// nil
    Nil,
    /// boolean
    Boolean,
    /// number (double precision)
    Number,
    /// string
    String,
    /// table
    Table,
    /// function
    Function,
    /// full userdata carrying a host handle
    UserData,
}

impl LuaType {
    /// Script-facing type name
    pub fn name(self) -> &'static str {
        match self {
            LuaType::None => "no value",
            LuaType::Nil => "nil",
            LuaType::Boolean => "boolean",
            LuaType::Number => "number",
            LuaType::String => "string",
            LuaType::Table => "table",
            LuaType::Function => "function",
            LuaType::UserData => "userdata",
        }
    }

    /// True for `None` and `Nil`
    pub fn is_nil(self) -> bool {
        matches!(self, LuaType::None | LuaType::Nil)
    }
}

impl fmt::Display for LuaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of a named metatable, assigned by [`LuaApi::create_metatable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    /// Create a TypeId from its raw value
    pub fn from_u32(id: u32) -> Self {
        TypeId(id)
    }

    /// Get the raw value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Slot in the VM's reference table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefId(i32);

impl RefId {
    /// Create a RefId from its raw value
    pub fn from_raw(raw: i32) -> Self {
        RefId(raw)
    }

    /// Get the raw value
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref:{}", self.0)
    }
}

/// VM-level errors
///
/// Errors raised by native functions propagate through [`LuaApi::call`] like
/// script errors do.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LuaError {
    /// Error raised by script or by a native function
    #[error("{0}")]
    Runtime(String),

    /// Attempt to call a value that is not a function
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),

    /// Attempt to index a value that has no fields
    #[error("attempt to index a {0} value")]
    NotIndexable(&'static str),

    /// Stack position does not exist
    #[error("invalid stack index {0}")]
    InvalidIndex(i32),

    /// Reference slot is empty or was freed
    #[error("invalid reference {0}")]
    InvalidReference(RefId),

    /// Call depth limit reached
    #[error("stack overflow")]
    StackOverflow,
}

/// Result alias for VM operations
pub type LuaResult<T> = Result<T, LuaError>;

/// Native function callable from the VM.
///
/// Receives the VM with the call's arguments at positions `1..=top()` and
/// returns how many values it left on top of the stack as results.
pub type NativeFn = Rc<dyn Fn(&mut dyn LuaApi) -> LuaResult<i32>>;

/// Low-level stack primitives of the embedded VM.
pub trait LuaApi {
    // ========================================================================
    // Stack Manipulation
    // ========================================================================

    /// Number of values in the current frame
    fn top(&self) -> i32;

    /// Grow (with nils) or shrink the current frame to `top` values.
    /// A negative value is relative to the current top.
    fn set_top(&mut self, top: i32);

    /// Pop `n` values
    fn pop(&mut self, n: i32) {
        self.set_top(-n - 1);
    }

    /// Remove the value at `idx`, shifting the values above it down
    fn remove(&mut self, idx: i32) -> LuaResult<()>;

    /// Push a copy of the value at `idx`
    fn push_value(&mut self, idx: i32) -> LuaResult<()>;

    // ========================================================================
    // Primitive Push / Read
    // ========================================================================

    /// Push nil
    fn push_nil(&mut self);

    /// Push a boolean
    fn push_bool(&mut self, value: bool);

    /// Push a number
    fn push_number(&mut self, value: f64);

    /// Push a string
    fn push_string(&mut self, value: &str);

    /// Push a native function
    fn push_function(&mut self, func: NativeFn);

    /// Runtime type of the value at `idx` (`LuaType::None` for invalid positions)
    fn type_of(&self, idx: i32) -> LuaType;

    /// Truthiness of the value at `idx`
    fn to_bool(&self, idx: i32) -> bool;

    /// Number at `idx`, if it is a number
    fn to_number(&self, idx: i32) -> Option<f64>;

    /// String at `idx`, if it is a string
    fn to_str(&self, idx: i32) -> Option<String>;

    // ========================================================================
    // Tables
    // ========================================================================

    /// Push a new empty table
    fn create_table(&mut self);

    /// Push `t[name]` where `t` is at `idx` (metamethods apply); returns its type
    fn get_field(&mut self, idx: i32, name: &str) -> LuaResult<LuaType>;

    /// `t[name] = v` where `t` is at `idx` and `v` is popped from the top
    fn set_field(&mut self, idx: i32, name: &str) -> LuaResult<()>;

    /// Replace the key on top with `t[key]`, bypassing metamethods
    fn raw_get(&mut self, idx: i32) -> LuaResult<LuaType>;

    /// `t[key] = value` bypassing metamethods; pops value then key
    fn raw_set(&mut self, idx: i32) -> LuaResult<()>;

    /// Table traversal: pops a key and pushes the next key/value pair.
    /// Returns false (pushing nothing) once the traversal is complete.
    fn next(&mut self, idx: i32) -> LuaResult<bool>;

    /// Push the globals table
    fn push_globals(&mut self);

    // ========================================================================
    // Metatables & Userdata
    // ========================================================================

    /// Create (or reuse) the metatable registered under `name` and push it
    fn create_metatable(&mut self, name: &str) -> LuaResult<TypeId>;

    /// Push the metatable registered for `type_id`; false if unknown
    fn push_metatable(&mut self, type_id: TypeId) -> bool;

    /// Pop a table (or nil) and set it as metatable of the table at `idx`
    fn set_metatable(&mut self, idx: i32) -> LuaResult<()>;

    /// TypeId of the registered metatable attached to the value at `idx`
    fn metatable_type(&self, idx: i32) -> Option<TypeId>;

    /// Push a userdata carrying `payload`, using the metatable of `type_id`
    fn push_userdata(&mut self, type_id: TypeId, payload: u64) -> LuaResult<()>;

    /// Type and payload of the userdata at `idx`
    fn to_userdata(&self, idx: i32) -> Option<(TypeId, u64)>;

    // ========================================================================
    // References
    // ========================================================================

    /// Pop the top value into a new reference slot
    fn reference_create(&mut self) -> LuaResult<RefId>;

    /// Push the value held by a reference slot
    fn reference_push(&mut self, reference: RefId) -> LuaResult<()>;

    /// Release a reference slot; false if it was not live
    fn reference_free(&mut self, reference: RefId) -> bool;

    // ========================================================================
    // Calls & Tick
    // ========================================================================

    /// Call the function below `nargs` arguments, leaving `nresults` results
    /// (or all of them with [`MULTRET`]). Errors leave the stack as it was
    /// before the function was pushed.
    fn call(&mut self, nargs: i32, nresults: i32) -> LuaResult<()>;

    /// Register a function run once per tick under `id`, replacing any previous one
    fn add_tick_hook(&mut self, id: &str, hook: NativeFn);

    /// Remove a tick hook; false if none was registered under `id`
    fn remove_tick_hook(&mut self, id: &str) -> bool;
}
