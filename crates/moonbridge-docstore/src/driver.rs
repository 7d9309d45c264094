//! Script-facing driver types
//!
//! `Client.Connect(url)` is the only static entry point. It hands out
//! [`Connection`]s, which hand out [`Collection`]s; both are projected
//! objects whose exposed methods scripts call with `:` syntax.

use crate::ids::ObjectId;
use crate::store::{Collection, Store, ID_FIELD};
use dashmap::DashMap;
use moonbridge_engine::{
    BridgeError, BridgeResult, CallContext, FunctionRef, HostList, HostMap, HostObject, HostType,
    HostValue, MethodInfo, TableRef, TypeKey,
};
use std::sync::Arc;
use std::thread;

/// Namespace the driver is registered under
pub const NAMESPACE: &str = "DocStore.Driver";

/// URL scheme accepted by `Client.Connect`
pub const URL_SCHEME: &str = "docstore://";

/// Stores shared by every connection of one module, keyed by store name
pub type Stores = Arc<DashMap<String, Arc<Store>>>;

/// Static entry point
pub struct Client;

/// An open connection to a named store
pub struct Connection {
    url: String,
    store: Arc<Store>,
}

impl Connection {
    /// URL the connection was opened with
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Store behind the connection
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

fn store_name(url: &str) -> BridgeResult<&str> {
    match url.strip_prefix(URL_SCHEME) {
        Some(name) if !name.is_empty() && !name.contains('/') => Ok(name),
        _ => Err(BridgeError::Host(format!(
            "Unsupported connection url {:?}, expected {}<name>",
            url, URL_SCHEME
        ))),
    }
}

fn documents(docs: Vec<HostMap>) -> HostValue {
    HostValue::list(docs.into_iter().map(HostValue::map).collect())
}

// ============================================================================
// Client
// ============================================================================

/// Descriptor of [`Client`]
pub fn client_type(stores: Stores) -> Arc<HostType> {
    HostType::builder::<Client>("Client")
        .namespace(NAMESPACE)
        .method(
            MethodInfo::function("Connect", move |ctx| {
                let url: String = ctx.arg(0)?;
                let name = store_name(&url)?;
                let store = stores
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Store::new(name)))
                    .clone();
                tracing::debug!(%url, "docstore connection opened");
                Ok(HostValue::object(Connection { url, store }))
            })
            .param::<String>()
            .returns::<Connection>()
            .exposed(),
        )
        .build()
}

// ============================================================================
// Connection
// ============================================================================

/// Descriptor of [`Connection`]
pub fn connection_type() -> Arc<HostType> {
    HostType::builder::<Connection>("Connection")
        .namespace(NAMESPACE)
        .display_name("DocStore.Connection")
        .method(
            MethodInfo::instance("GetCollection", |ctx| {
                let conn = ctx.this::<Connection>()?;
                let name: String = ctx.arg(0)?;
                Ok(HostValue::Object(HostObject::from_arc(
                    conn.store.collection(&name),
                )))
            })
            .param::<String>()
            .returns::<Collection>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("CollectionNames", |ctx| {
                let names = ctx.this::<Connection>()?.store.collection_names();
                Ok(HostValue::list(
                    names.into_iter().map(HostValue::String).collect(),
                ))
            })
            .returns::<HostList>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("Ping", |ctx| {
                ctx.this::<Connection>()?;
                Ok(HostValue::Bool(true))
            })
            .returns::<bool>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("GetName", |ctx| {
                Ok(HostValue::String(ctx.this::<Connection>()?.store.name().to_string()))
            })
            .returns::<String>(),
        )
        .method(
            MethodInfo::instance("GetUrl", |ctx| {
                Ok(HostValue::String(ctx.this::<Connection>()?.url.clone()))
            })
            .returns::<String>(),
        )
        .property("Name", Some("GetName"), None)
        .property("Url", Some("GetUrl"), None)
        .build()
}

// ============================================================================
// Collection
// ============================================================================

fn filter_arg(ctx: &mut CallContext<'_>, index: usize) -> BridgeResult<HostMap> {
    let bridge = ctx.bridge().clone();
    let filter: TableRef = ctx.arg(index)?;
    filter.to_map(&bridge, ctx.vm())
}

fn id_filter(id: &str) -> HostMap {
    HostMap::new().with(ID_FIELD, id)
}

/// Run `work` on a worker thread and call `callback` with its result on
/// the VM thread. Failures reach the callback as `(nil, message)`.
fn complete_async<F>(ctx: &CallContext<'_>, callback: FunctionRef, work: F)
where
    F: FnOnce() -> BridgeResult<HostValue> + Send + 'static,
{
    let bridge = ctx.bridge().clone();
    let method = ctx.method().name.clone();
    thread::spawn(move || {
        let result = work();
        let scheduler = bridge.scheduler().clone();
        scheduler.enqueue(
            move |vm| {
                let args = match result {
                    Ok(value) => vec![value],
                    Err(err) => vec![HostValue::Nil, HostValue::String(err.to_string())],
                };
                let outcome = callback.call(&bridge, vm, &args, &[]);
                if let Err(err) = callback.free(vm) {
                    tracing::debug!(error = %err, "async callback already released");
                }
                outcome.map(|_| HostValue::Nil)
            },
            TypeKey::of::<()>(),
        );
        tracing::trace!(%method, "async result queued");
    });
}

/// Descriptor of [`Collection`]
pub fn collection_type() -> Arc<HostType> {
    HostType::builder::<Collection>("Collection")
        .namespace(NAMESPACE)
        .display_name("DocStore.Collection")
        .method(
            MethodInfo::instance("InsertOne", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let doc: HostMap = ctx.arg(0)?;
                Ok(HostValue::object(coll.insert_one(doc)?))
            })
            .param::<HostMap>()
            .returns::<ObjectId>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("Find", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let filter = filter_arg(ctx, 0)?;
                Ok(documents(coll.find(&filter, None)))
            })
            .param::<TableRef>()
            .returns::<HostList>()
            .overloaded(),
        )
        .method(
            MethodInfo::instance("Find", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let id: String = ctx.arg(0)?;
                Ok(documents(coll.find(&id_filter(&id), None)))
            })
            .param::<String>()
            .returns::<HostList>()
            .overloaded(),
        )
        .method(
            MethodInfo::instance("Find", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let limit: usize = ctx.arg(0)?;
                Ok(documents(coll.find(&HostMap::new(), Some(limit))))
            })
            .param::<f64>()
            .returns::<HostList>(),
        )
        .method(
            MethodInfo::instance("FindOne", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let filter = filter_arg(ctx, 0)?;
                Ok(coll.find_one(&filter).map_or(HostValue::Nil, HostValue::map))
            })
            .param::<TableRef>()
            .returns::<HostMap>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("DeleteOne", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let id: Arc<ObjectId> = ctx.arg(0)?;
                Ok(HostValue::Bool(coll.delete_one(&id)))
            })
            .param::<ObjectId>()
            .returns::<bool>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("Count", |ctx| {
                Ok(HostValue::Integer(ctx.this::<Collection>()?.count() as i64))
            })
            .returns::<i64>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("InsertOneAsync", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let doc: HostMap = ctx.arg(0)?;
                let callback: FunctionRef = ctx.arg(1)?;
                complete_async(ctx, callback, move || {
                    Ok(HostValue::object(coll.insert_one(doc)?))
                });
                Ok(HostValue::Nil)
            })
            .param::<HostMap>()
            .param::<FunctionRef>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("FindAsync", |ctx| {
                let coll = ctx.this::<Collection>()?;
                let filter = filter_arg(ctx, 0)?;
                let callback: FunctionRef = ctx.arg(1)?;
                complete_async(ctx, callback, move || Ok(documents(coll.find(&filter, None))));
                Ok(HostValue::Nil)
            })
            .param::<TableRef>()
            .param::<FunctionRef>()
            .exposed(),
        )
        .method(
            MethodInfo::instance("GetName", |ctx| {
                Ok(HostValue::String(ctx.this::<Collection>()?.name().to_string()))
            })
            .returns::<String>(),
        )
        .property("Name", Some("GetName"), None)
        .build()
}
