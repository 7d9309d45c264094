//! Host reflection surface
//!
//! Type identities, host values, type descriptors and the catalog of types a
//! module makes available to scripts.

mod catalog;
mod descriptor;
mod key;
mod object;
mod value;

pub use catalog::TypeCatalog;
pub use descriptor::{
    signature, Exposure, HostType, HostTypeBuilder, Invoker, MethodInfo, PropertyInfo,
};
pub use key::TypeKey;
pub use object::HostObject;
pub use value::{FromHost, HostList, HostMap, HostValue, IntoHost};
