//! Bridge - the state shared by every component of a loaded module
//!
//! A [`Bridge`] is created by [`crate::module::Binding::on_load`] and handed
//! around as `Arc<Bridge>`. It owns the handle registry, the TypeId map, the
//! transformer registry, the type catalog and the task scheduler; all of them
//! are drained on unload.

pub mod finder;
pub mod handles;
pub mod marshal;
pub mod namespace;
pub mod projection;
pub mod reference;
pub mod transform;
pub mod type_map;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{FromHost, HostObject, HostValue, MethodInfo, TypeCatalog};
use crate::scheduler::TaskScheduler;
use crate::vm::{LuaApi, RefId};
use handles::{Handle, HandleRegistry};
use std::any::Any;
use std::sync::Arc;
use transform::TransformerRegistry;
use type_map::TypeMap;

/// Registries of one loaded module
pub struct Bridge {
    config: BridgeConfig,
    handles: Arc<HandleRegistry>,
    types: TypeMap,
    transformers: TransformerRegistry,
    catalog: TypeCatalog,
    scheduler: Arc<TaskScheduler>,
}

impl Bridge {
    /// Create empty registries
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handles: Arc::new(HandleRegistry::new()),
            types: TypeMap::new(),
            transformers: TransformerRegistry::new(),
            catalog: TypeCatalog::new(),
            scheduler: Arc::new(TaskScheduler::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Handle registry
    pub fn handles(&self) -> &Arc<HandleRegistry> {
        &self.handles
    }

    /// TypeId ↔ host type map
    pub fn types(&self) -> &TypeMap {
        &self.types
    }

    /// Transformer registry
    pub fn transformers(&self) -> &TransformerRegistry {
        &self.transformers
    }

    /// Host types available for projection
    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    /// Async completion queue
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }
}

/// Everything a host method sees while it runs
pub struct CallContext<'a> {
    vm: &'a mut dyn LuaApi,
    bridge: &'a Arc<Bridge>,
    method: &'a MethodInfo,
    this: Option<(Handle, HostObject)>,
    args: Vec<HostValue>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        vm: &'a mut dyn LuaApi,
        bridge: &'a Arc<Bridge>,
        method: &'a MethodInfo,
        this: Option<(Handle, HostObject)>,
        args: Vec<HostValue>,
    ) -> Self {
        Self {
            vm,
            bridge,
            method,
            this,
            args,
        }
    }

    /// The VM, for calling back into script
    pub fn vm(&mut self) -> &mut dyn LuaApi {
        &mut *self.vm
    }

    /// The bridge the call came through
    pub fn bridge(&self) -> &Arc<Bridge> {
        self.bridge
    }

    /// Method being invoked
    pub fn method(&self) -> &MethodInfo {
        self.method
    }

    /// Receiver of an instance method
    pub fn this<T: Any + Send + Sync>(&self) -> BridgeResult<Arc<T>> {
        let (_, object) = self.this.as_ref().ok_or_else(|| {
            BridgeError::Host(format!("{} has no receiver", self.method.signature()))
        })?;
        object.downcast::<T>().ok_or_else(|| {
            BridgeError::mismatch(
                crate::host::TypeKey::of::<T>().short_name(),
                object.type_key().short_name(),
            )
        })
    }

    /// Handle of the receiver
    pub fn handle(&self) -> Option<Handle> {
        self.this.as_ref().map(|(handle, _)| *handle)
    }

    /// Reference slot holding the receiver's proxy while the call runs
    pub fn back_reference(&self) -> Option<RefId> {
        match self.bridge.handles().call_state(self.handle()?) {
            handles::CallState::BackReferenceSet(r) => Some(r),
            handles::CallState::Idle => None,
        }
    }

    /// Argument `index` converted to `T`; missing arguments read as nil
    pub fn arg<T: FromHost>(&self, index: usize) -> BridgeResult<T> {
        T::from_host(self.args.get(index).cloned().unwrap_or(HostValue::Nil))
    }

    /// All marshalled arguments
    pub fn args(&self) -> &[HostValue] {
        &self.args
    }

    /// Number of marshalled arguments
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Task scheduler for completing work from other threads
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        self.bridge.scheduler()
    }

    pub(crate) fn into_args(self) -> Vec<HostValue> {
        self.args
    }
}
