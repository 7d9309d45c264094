//! Embedded VM
//!
//! The bridge talks to the VM exclusively through [`LuaApi`]. [`State`] is the
//! in-process implementation used by the rest of the crate and its tests.

mod api;
mod state;
mod value;

pub use api::{LuaApi, LuaError, LuaResult, LuaType, NativeFn, RefId, TypeId, MULTRET};
pub use state::State;
