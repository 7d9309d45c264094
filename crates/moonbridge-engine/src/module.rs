//! Module lifecycle
//!
//! A glue crate describes what it offers in a [`HostModule`]: its host types
//! and transformers. [`Binding::on_load`] wires a module into a VM and
//! [`Binding::on_unload`] tears everything down again.
//!
//! # Example
//!
//! ```ignore
//! let mut module = HostModule::new("docstore", "0.1.0");
//! module.register_type(client_type());
//! module.register_transformer(ObjectIdTransformer);
//!
//! let mut vm = State::new();
//! let mut binding = Binding::on_load(&mut vm, &module, BridgeConfig::default())?;
//! // ... run scripts, call vm.tick() regularly ...
//! binding.on_unload(&mut vm);
//! ```

use crate::bridge::transform::{self, DynTransformer, Transformer};
use crate::bridge::{marshal, namespace, Bridge};
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::host::{HostType, HostValue};
use crate::vm::LuaApi;
use std::fmt;
use std::sync::Arc;

/// Host types and transformers a glue crate exposes
pub struct HostModule {
    name: String,
    version: String,
    types: Vec<Arc<HostType>>,
    transformers: Vec<Arc<dyn DynTransformer>>,
    namespace_prefix: Option<String>,
}

impl HostModule {
    /// Create a new host module.
    ///
    /// # Arguments
    /// * `name` - Module name (e.g., "docstore")
    /// * `version` - Semantic version (e.g., "1.0.0")
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        HostModule {
            name: name.into(),
            version: version.into(),
            types: Vec::new(),
            transformers: Vec::new(),
            namespace_prefix: None,
        }
    }

    /// Register a host type
    pub fn register_type(&mut self, ty: Arc<HostType>) {
        self.types.push(ty);
    }

    /// Register a transformer
    pub fn register_transformer<T: Transformer>(&mut self, transformer: T) {
        self.transformers.push(Arc::new(transformer));
    }

    /// Namespace prefix trimmed from every type's namespace
    pub fn set_namespace_prefix(&mut self, prefix: impl Into<String>) {
        self.namespace_prefix = Some(prefix.into());
    }

    /// Get module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get module version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Registered host types
    pub fn types(&self) -> &[Arc<HostType>] {
        &self.types
    }

    /// Registered transformers
    pub fn transformers(&self) -> &[Arc<dyn DynTransformer>] {
        &self.transformers
    }

    /// Namespace prefix, if set
    pub fn namespace_prefix(&self) -> Option<&str> {
        self.namespace_prefix.as_deref()
    }
}

impl fmt::Debug for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostModule")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("types", &self.types.len())
            .field("transformers", &self.transformers.len())
            .finish()
    }
}

/// What [`Binding::on_unload`] released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnloadReport {
    /// Host handles invalidated
    pub handles: usize,
    /// VM reference slots freed
    pub references: usize,
    /// Tasks run by the final drain
    pub tasks_run: usize,
    /// Tasks resolved with `SchedulerClosed`
    pub tasks_dropped: usize,
}

/// A module loaded into a VM
pub struct Binding {
    bridge: Arc<Bridge>,
    module: String,
    loaded: bool,
}

impl Binding {
    /// Load `module` into `vm`: discover transformers, register the module's
    /// types and namespaces and install the scheduler tick hook.
    pub fn on_load(
        vm: &mut dyn LuaApi,
        module: &HostModule,
        config: BridgeConfig,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let bridge = Bridge::new(config);

        let builtin = bridge.transformers().discover(transform::builtins());
        let discovered = bridge
            .transformers()
            .discover(module.transformers().iter().cloned());

        for ty in module.types() {
            if !bridge.catalog().insert(ty.clone()) {
                tracing::warn!(type_name = ty.name(), "host type registered twice, ignoring");
            }
        }

        let trim = bridge
            .config()
            .trim_namespace_prefix
            .clone()
            .or_else(|| module.namespace_prefix().map(str::to_string));
        for ty in module.types() {
            if let Err(err) = namespace::register_type(&bridge, vm, ty, trim.as_deref()) {
                bridge.handles().sweep(vm);
                return Err(err);
            }
        }

        if bridge.config().expose_module_info {
            publish_module_info(&bridge, vm, module)?;
        }

        bridge.scheduler().install(vm, &bridge.config().tick_hook_id);

        tracing::debug!(
            module = module.name(),
            version = module.version(),
            types = module.types().len(),
            transformers = builtin + discovered,
            "module loaded"
        );
        Ok(Self {
            bridge,
            module: module.name().to_string(),
            loaded: true,
        })
    }

    /// Registries of the loaded module
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Whether [`on_unload`](Self::on_unload) has not run yet
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Push a host value onto the VM stack, projecting objects as needed
    pub fn push(&self, vm: &mut dyn LuaApi, value: &HostValue) -> BridgeResult<i32> {
        marshal::push_dynamic(&self.bridge, vm, value)
    }

    /// Tear the module down: remove the tick hook, run what is still queued,
    /// free every reference slot, invalidate every handle and forget the
    /// projected types. Calling it again does nothing.
    pub fn on_unload(&mut self, vm: &mut dyn LuaApi) -> UnloadReport {
        if !self.loaded {
            return UnloadReport::default();
        }
        self.loaded = false;

        let scheduler = self.bridge.scheduler();
        scheduler.uninstall(vm, &self.bridge.config().tick_hook_id);
        let tasks_run = scheduler.drain(vm);
        let tasks_dropped = scheduler.close();

        let swept = self.bridge.handles().sweep(vm);
        self.bridge.types().clear();
        self.bridge.catalog().clear();
        self.bridge.transformers().clear();

        let report = UnloadReport {
            handles: swept.handles,
            references: swept.references,
            tasks_run,
            tasks_dropped,
        };
        tracing::debug!(module = %self.module, ?report, "module unloaded");
        report
    }
}

fn publish_module_info(bridge: &Bridge, vm: &mut dyn LuaApi, module: &HostModule) -> BridgeResult<()> {
    let base = vm.top();
    let outcome = (|| -> BridgeResult<()> {
        namespace::push_root(bridge, vm)?;
        let root = vm.top();
        vm.create_table();
        vm.push_string(module.name());
        vm.set_field(-2, "name")?;
        vm.push_string(module.version());
        vm.set_field(-2, "version")?;
        vm.set_field(root, "_MODULE")?;
        Ok(())
    })();
    vm.set_top(base);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MethodInfo;
    use crate::vm::{LuaType, State};

    struct Probe;

    fn module() -> HostModule {
        let mut module = HostModule::new("probe", "1.2.3");
        module.register_type(
            HostType::builder::<Probe>("Probe")
                .namespace("Vendor.Tools")
                .method(MethodInfo::function("Ping", |_| Ok(HostValue::String("pong".into()))).returns::<String>())
                .build(),
        );
        module.set_namespace_prefix("Vendor");
        module
    }

    #[test]
    fn test_load_registers_namespaces() {
        let mut vm = State::new();
        let binding = Binding::on_load(&mut vm, &module(), BridgeConfig::default()).unwrap();
        assert!(binding.is_loaded());
        assert_eq!(vm.get_path("Tools.Probe.Ping").unwrap(), LuaType::Function);
        assert_eq!(vm.tick_hook_count(), 1);
        assert_eq!(vm.get_path("_MODULE").unwrap(), LuaType::Nil);
    }

    #[test]
    fn test_module_info_table() {
        let mut vm = State::new();
        let config = BridgeConfig::default()
            .with_namespace_root("Host")
            .with_module_info(true);
        Binding::on_load(&mut vm, &module(), config).unwrap();
        assert_eq!(vm.get_path("Host._MODULE.version").unwrap(), LuaType::String);
        assert_eq!(vm.to_str(-1).as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut vm = State::new();
        let config = BridgeConfig::default().with_max_table_depth(0);
        assert!(matches!(
            Binding::on_load(&mut vm, &module(), config),
            Err(crate::error::BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_unload_is_idempotent() {
        let mut vm = State::new();
        let mut binding = Binding::on_load(&mut vm, &module(), BridgeConfig::default()).unwrap();
        binding.on_unload(&mut vm);
        assert!(!binding.is_loaded());
        assert_eq!(vm.tick_hook_count(), 0);
        assert_eq!(binding.on_unload(&mut vm), UnloadReport::default());
    }
}
