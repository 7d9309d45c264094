//! DocStore - an in-memory document store driver for moonbridge scripts
//!
//! Scripts reach the driver through the `DocStore.Driver` namespace:
//!
//! ```lua
//! local conn = DocStore.Driver.Client.Connect("docstore://app")
//! local users = conn:GetCollection("users")
//! local id = users:InsertOne({ name = "ada", age = 36 })
//! local found = users:Find({ age = 36 })
//! users:FindAsync({ name = "ada" }, function(docs, err) ... end)
//! ```
//!
//! Document ids travel as 24-character hex strings; insertion times arrive
//! in scripts as seconds since the Unix epoch.

mod driver;
mod ids;
mod store;

pub use driver::{client_type, collection_type, connection_type, Client, Connection, Stores};
pub use driver::{NAMESPACE, URL_SCHEME};
pub use ids::{ObjectId, ObjectIdTransformer, ParseObjectIdError, Timestamp, TimestampTransformer};
pub use store::{Collection, Store, StoreError, CREATED_FIELD, ID_FIELD};

use dashmap::DashMap;
use moonbridge_engine::HostModule;
use std::sync::Arc;

/// Module name reported to the VM
pub const MODULE_NAME: &str = "docstore";

/// Describe the driver as a loadable module.
///
/// Every call starts with its own empty set of stores.
pub fn module() -> HostModule {
    let stores: Stores = Arc::new(DashMap::new());
    let mut module = HostModule::new(MODULE_NAME, env!("CARGO_PKG_VERSION"));
    module.register_type(client_type(stores));
    module.register_type(connection_type());
    module.register_type(collection_type());
    module.register_transformer(ObjectIdTransformer);
    module.register_transformer(TimestampTransformer);
    module
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_contents() {
        let module = module();
        assert_eq!(module.name(), "docstore");
        assert_eq!(module.types().len(), 3);
        assert_eq!(module.transformers().len(), 2);
        assert!(module.namespace_prefix().is_none());
    }
}
