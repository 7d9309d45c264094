//! Moonbridge - bridge between an embedded stack VM and host objects
//!
//! This crate lets scripts running on a single-threaded, Lua-style stack VM
//! use host objects: values are marshalled across the boundary, host types are
//! projected as metatables, overloaded methods are resolved at call time and
//! work finishing on other threads is handed back to the VM thread.
//!
//! # Example
//!
//! ```ignore
//! use moonbridge_engine::{Binding, BridgeConfig, HostModule, HostType, IntoHost, MethodInfo, State};
//!
//! let mut module = HostModule::new("greeter", "1.0.0");
//! module.register_type(
//!     HostType::builder::<Greeter>("Greeter")
//!         .namespace("Demo")
//!         .method(MethodInfo::function("Hello", |ctx| {
//!             let name: String = ctx.arg(0)?;
//!             Ok(format!("hello {}", name).into_host())
//!         }).param::<String>().returns::<String>())
//!         .build(),
//! );
//!
//! let mut vm = State::new();
//! let mut binding = Binding::on_load(&mut vm, &module, BridgeConfig::default())?;
//! // scripts call Demo.Greeter.Hello("moon")
//! binding.on_unload(&mut vm);
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod module;
pub mod scheduler;
pub mod vm;

pub use bridge::handles::{CallState, Handle, HandleRegistry, SweepStats};
pub use bridge::reference::{FunctionRef, LuaReference, TableRef};
pub use bridge::transform::{DynTransformer, Transformer, TransformerRegistry};
pub use bridge::type_map::TypeMap;
pub use bridge::{Bridge, CallContext};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult, Direction};
pub use host::{
    FromHost, HostList, HostMap, HostObject, HostType, HostValue, IntoHost, MethodInfo, TypeKey,
};
pub use module::{Binding, HostModule, UnloadReport};
pub use scheduler::{CompletionHandle, SchedulerStats, TaskId, TaskScheduler};
pub use vm::{LuaApi, LuaError, LuaResult, LuaType, State};
