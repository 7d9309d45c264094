//! Reflection metadata for host types
//!
//! A [`HostType`] enumerates the methods and properties a host type offers to
//! the bridge. Descriptors are built once, at module declaration, and never
//! change afterwards; exposure is part of each method's metadata rather than
//! something discovered at call time.

use super::key::TypeKey;
use super::value::HostValue;
use crate::bridge::CallContext;
use crate::error::BridgeResult;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Reflected method body
pub type Invoker = Arc<dyn Fn(&mut CallContext<'_>) -> BridgeResult<HostValue> + Send + Sync>;

/// Script exposure of a method
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exposure {
    /// Script-visible name; the method name when `None`
    pub name: Option<String>,
    /// Dispatch through overload resolution
    pub overloaded: bool,
}

/// A reflected method
#[derive(Clone)]
pub struct MethodInfo {
    /// Host method name
    pub name: String,
    /// Static (no receiver) or instance method
    pub is_static: bool,
    /// Public visibility
    pub is_public: bool,
    /// Exposure annotation; `None` means not callable from scripts
    pub exposure: Option<Exposure>,
    /// Declared parameter types
    pub params: Vec<TypeKey>,
    /// Declared return type
    pub returns: TypeKey,
    /// Method body
    pub invoker: Invoker,
}

impl MethodInfo {
    fn with_invoker<F>(name: &str, is_static: bool, f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<HostValue> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            is_static,
            is_public: true,
            exposure: None,
            params: Vec::new(),
            returns: TypeKey::of::<()>(),
            invoker: Arc::new(f),
        }
    }

    /// Public instance method
    pub fn instance<F>(name: &str, f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<HostValue> + Send + Sync + 'static,
    {
        Self::with_invoker(name, false, f)
    }

    /// Public static method
    pub fn function<F>(name: &str, f: F) -> Self
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<HostValue> + Send + Sync + 'static,
    {
        Self::with_invoker(name, true, f)
    }

    /// Append a parameter of type `T`
    pub fn param<T: Any + ?Sized>(mut self) -> Self {
        self.params.push(TypeKey::of::<T>());
        self
    }

    /// Declare the return type
    pub fn returns<T: Any + ?Sized>(mut self) -> Self {
        self.returns = TypeKey::of::<T>();
        self
    }

    /// Expose to scripts under the method name
    pub fn exposed(mut self) -> Self {
        self.exposure.get_or_insert_with(Exposure::default);
        self
    }

    /// Expose to scripts under `name`
    pub fn exposed_as(mut self, name: &str) -> Self {
        self.exposure.get_or_insert_with(Exposure::default).name = Some(name.to_string());
        self
    }

    /// Resolve calls through the overload finder
    pub fn overloaded(mut self) -> Self {
        self.exposure.get_or_insert_with(Exposure::default).overloaded = true;
        self
    }

    /// Mark as non-public
    pub fn private(mut self) -> Self {
        self.is_public = false;
        self
    }

    /// Whether scripts may call the method
    pub fn is_exposed(&self) -> bool {
        self.exposure.is_some()
    }

    /// Script-visible name
    pub fn exposed_name(&self) -> &str {
        self.exposure
            .as_ref()
            .and_then(|e| e.name.as_deref())
            .unwrap_or(&self.name)
    }

    /// `Name(T1, T2)`
    pub fn signature(&self) -> String {
        signature(&self.name, &self.params)
    }
}

impl fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInfo")
            .field("signature", &self.signature())
            .field("is_static", &self.is_static)
            .field("is_public", &self.is_public)
            .field("exposure", &self.exposure)
            .finish()
    }
}

/// Format a call signature from a name and parameter types
pub fn signature(name: &str, params: &[TypeKey]) -> String {
    let params: Vec<String> = params.iter().map(TypeKey::short_name).collect();
    format!("{}({})", name, params.join(", "))
}

/// A reflected property, backed by accessor methods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    /// Property name
    pub name: String,
    /// Name of the zero-argument getter method
    pub getter: Option<String>,
    /// Name of the one-argument setter method
    pub setter: Option<String>,
}

/// Reflection metadata for one host type
#[derive(Debug)]
pub struct HostType {
    key: TypeKey,
    name: String,
    namespace: Option<String>,
    display_name: Option<String>,
    methods: Vec<MethodInfo>,
    /// Method name to indices into `methods`
    by_name: FxHashMap<String, Vec<usize>>,
    properties: IndexMap<String, PropertyInfo>,
}

impl HostType {
    /// Start describing `T` under the type name `name`
    pub fn builder<T: Any>(name: &str) -> HostTypeBuilder {
        HostTypeBuilder {
            ty: HostType {
                key: TypeKey::of::<T>(),
                name: name.to_string(),
                namespace: None,
                display_name: None,
                methods: Vec::new(),
                by_name: FxHashMap::default(),
                properties: IndexMap::new(),
            },
        }
    }

    /// Type identity
    pub fn key(&self) -> TypeKey {
        self.key
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Name used for projections: the explicit display name, else the type name
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// `Namespace.Name`, or the bare name without a namespace
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, self.name),
            _ => self.name.clone(),
        }
    }

    /// All methods in declaration order
    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    /// Method at `index`
    pub fn method(&self, index: usize) -> Option<&MethodInfo> {
        self.methods.get(index)
    }

    /// Indices of every method called `name`
    pub fn methods_named(&self, name: &str) -> &[usize] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Method called `name` whose parameter list is exactly `params`
    pub fn find_method(&self, name: &str, params: &[TypeKey]) -> Option<(usize, &MethodInfo)> {
        self.methods_named(name)
            .iter()
            .map(|&i| (i, &self.methods[i]))
            .find(|(_, m)| m.params == params)
    }

    /// Declared properties
    pub fn properties(&self) -> impl Iterator<Item = &PropertyInfo> {
        self.properties.values()
    }

    /// Property called `name`
    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.get(name)
    }

    /// True when the type declares properties
    pub fn has_properties(&self) -> bool {
        !self.properties.is_empty()
    }
}

/// Builder for [`HostType`]
pub struct HostTypeBuilder {
    ty: HostType,
}

impl HostTypeBuilder {
    /// Dotted namespace the type's static surface is registered under
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.ty.namespace = Some(namespace.to_string());
        self
    }

    /// Name used for the projection's metatable
    pub fn display_name(mut self, name: &str) -> Self {
        self.ty.display_name = Some(name.to_string());
        self
    }

    /// Add a method
    pub fn method(mut self, method: MethodInfo) -> Self {
        let index = self.ty.methods.len();
        self.ty
            .by_name
            .entry(method.name.clone())
            .or_default()
            .push(index);
        self.ty.methods.push(method);
        self
    }

    /// Add a property backed by getter and setter method names
    pub fn property(mut self, name: &str, getter: Option<&str>, setter: Option<&str>) -> Self {
        self.ty.properties.insert(
            name.to_string(),
            PropertyInfo {
                name: name.to_string(),
                getter: getter.map(str::to_string),
                setter: setter.map(str::to_string),
            },
        );
        self
    }

    /// Finish the descriptor
    pub fn build(self) -> Arc<HostType> {
        Arc::new(self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Greeter;

    fn greeter() -> Arc<HostType> {
        HostType::builder::<Greeter>("Greeter")
            .namespace("Demo.Text")
            .method(
                MethodInfo::instance("Print", |_| Ok(HostValue::Nil))
                    .param::<String>()
                    .exposed()
                    .overloaded(),
            )
            .method(
                MethodInfo::instance("Print", |_| Ok(HostValue::Nil))
                    .param::<f64>()
                    .exposed_as("Show"),
            )
            .method(MethodInfo::instance("GetName", |_| Ok(HostValue::Nil)).returns::<String>())
            .property("Name", Some("GetName"), None)
            .build()
    }

    #[test]
    fn test_find_method_by_exact_params() {
        let ty = greeter();
        let (index, method) = ty
            .find_method("Print", &[TypeKey::of::<f64>()])
            .unwrap();
        assert_eq!(index, 1);
        assert_eq!(method.exposed_name(), "Show");
        assert!(ty.find_method("Print", &[]).is_none());
        assert_eq!(ty.methods_named("Print"), &[0, 1]);
    }

    #[test]
    fn test_names() {
        let ty = greeter();
        assert_eq!(ty.display_name(), "Greeter");
        assert_eq!(ty.qualified_name(), "Demo.Text.Greeter");
        assert_eq!(ty.methods()[0].signature(), "Print(String)");
        assert_eq!(ty.property("Name").unwrap().getter.as_deref(), Some("GetName"));
        assert!(!ty.methods()[2].is_exposed());
    }
}
