//! In-memory document storage
//!
//! A [`Store`] holds named [`Collection`]s; a collection holds documents in
//! insertion order, keyed by [`ObjectId`]. Both are safe to share across
//! threads, which the async driver methods rely on.

use crate::ids::{ObjectId, Timestamp};
use indexmap::IndexMap;
use moonbridge_engine::{HostMap, HostValue};
use parking_lot::RwLock;
use std::sync::Arc;

/// Field holding a document's id
pub const ID_FIELD: &str = "_id";

/// Field holding the moment a document was inserted
pub const CREATED_FIELD: &str = "_created";

/// Document store errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Document holds a value that cannot be stored
    #[error("Field {field} cannot be stored: {kind} values are not data")]
    NotData {
        /// Dotted path of the offending field
        field: String,
        /// Kind of value found
        kind: String,
    },

    /// Document already carries an id
    #[error("Document already has an _id field")]
    IdPresent,
}

impl From<StoreError> for moonbridge_engine::BridgeError {
    fn from(err: StoreError) -> Self {
        moonbridge_engine::BridgeError::Host(err.to_string())
    }
}

/// Named collections
#[derive(Debug)]
pub struct Store {
    name: String,
    collections: RwLock<IndexMap<String, Arc<Collection>>>,
}

impl Store {
    /// Create an empty store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: RwLock::new(IndexMap::new()),
        }
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a collection, creating it on first use
    pub fn collection(&self, name: &str) -> Arc<Collection> {
        if let Some(existing) = self.collections.read().get(name) {
            return existing.clone();
        }
        self.collections
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(store = %self.name, collection = name, "collection created");
                Arc::new(Collection::new(name))
            })
            .clone()
    }

    /// Names of existing collections, in creation order
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }
}

/// Documents of one collection
#[derive(Debug)]
pub struct Collection {
    name: String,
    documents: RwLock<IndexMap<ObjectId, HostMap>>,
}

impl Collection {
    /// Create an empty collection
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: RwLock::new(IndexMap::new()),
        }
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `document` under a new id, stamping its id and insertion time
    pub fn insert_one(&self, mut document: HostMap) -> Result<ObjectId, StoreError> {
        if document.get(ID_FIELD).is_some() {
            return Err(StoreError::IdPresent);
        }
        check_data(&document, "")?;
        let id = ObjectId::new();
        document.insert(ID_FIELD, HostValue::object(id));
        document.insert(CREATED_FIELD, HostValue::object(Timestamp::now()));
        self.documents.write().insert(id, document);
        tracing::trace!(collection = %self.name, %id, "document inserted");
        Ok(id)
    }

    /// Document with id `id`
    pub fn get(&self, id: &ObjectId) -> Option<HostMap> {
        self.documents.read().get(id).cloned()
    }

    /// Documents matching every field of `filter`, at most `limit` of them
    pub fn find(&self, filter: &HostMap, limit: Option<usize>) -> Vec<HostMap> {
        self.documents
            .read()
            .iter()
            .filter(|(id, doc)| matches(id, doc, filter))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// First document matching `filter`
    pub fn find_one(&self, filter: &HostMap) -> Option<HostMap> {
        self.find(filter, Some(1)).into_iter().next()
    }

    /// Remove the document with id `id`; false if there was none
    pub fn delete_one(&self, id: &ObjectId) -> bool {
        self.documents.write().shift_remove(id).is_some()
    }

    /// Number of documents
    pub fn count(&self) -> usize {
        self.documents.read().len()
    }
}

fn matches(id: &ObjectId, doc: &HostMap, filter: &HostMap) -> bool {
    filter.iter().all(|(field, expected)| {
        if field == ID_FIELD {
            return match expected {
                HostValue::String(s) => s.parse::<ObjectId>().map(|e| e == *id).unwrap_or(false),
                other => other.downcast_ref::<ObjectId>() == Some(id),
            };
        }
        doc.get(field) == Some(expected)
    })
}

/// Reject values that only make sense inside the VM
fn check_data(map: &HostMap, path: &str) -> Result<(), StoreError> {
    for (field, value) in map.iter() {
        let field_path = if path.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", path, field)
        };
        check_value(value, &field_path)?;
    }
    Ok(())
}

fn check_value(value: &HostValue, path: &str) -> Result<(), StoreError> {
    let rejected = || StoreError::NotData {
        field: path.to_string(),
        kind: value.kind_name(),
    };
    match value {
        HostValue::Nil
        | HostValue::Bool(_)
        | HostValue::Integer(_)
        | HostValue::Number(_)
        | HostValue::String(_) => Ok(()),
        HostValue::Object(_) => {
            if let Some(map) = value.as_map() {
                check_data(map, path)
            } else if let Some(list) = value.as_list() {
                list.0
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, item)| check_value(item, &format!("{}.{}", path, i + 1)))
            } else if value.downcast_ref::<ObjectId>().is_some()
                || value.downcast_ref::<Timestamp>().is_some()
            {
                Ok(())
            } else {
                Err(rejected())
            }
        }
        _ => Err(rejected()),
    }
}
