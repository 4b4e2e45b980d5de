//! Type and store registries.
//!
//! [`TypeRegistry`] maps object type names to the Rust types stored under
//! them, so typed reads and writes can be checked and fetched payloads can
//! be validated before they reach the coordinator.
//!
//! [`StoreRegistry`] hands out one [`SyncedObjectStore`] per store
//! identifier; opening the same container and scope twice returns the
//! existing store.

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::mapping::{JsonRecordMapping, RecordMapping};
use crate::remote::RemoteStore;
use crate::store::SyncedObjectStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::any::{type_name, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type DecodeCheck = Arc<dyn Fn(&str) -> Result<(), serde_json::Error> + Send + Sync>;

/// One registered object type.
#[derive(Clone)]
pub struct RegisteredType {
    name: String,
    type_id: TypeId,
    rust_name: &'static str,
    check: DecodeCheck,
    mapping: Arc<dyn RecordMapping>,
}

impl RegisteredType {
    fn new<T: DeserializeOwned + 'static>(name: &str, mapping: Arc<dyn RecordMapping>) -> Self {
        Self {
            name: name.to_string(),
            type_id: TypeId::of::<T>(),
            rust_name: type_name::<T>(),
            check: Arc::new(|payload: &str| serde_json::from_str::<T>(payload).map(|_| ())),
            mapping,
        }
    }

    /// Registered type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record mapping for this type.
    pub fn mapping(&self) -> &dyn RecordMapping {
        self.mapping.as_ref()
    }

    /// Whether `T` is the Rust type registered under this name.
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Check that a payload decodes as the registered Rust type.
    pub fn validate(&self, payload: &str) -> Result<(), StoreError> {
        (self.check)(payload).map_err(StoreError::Encoding)
    }
}

impl fmt::Debug for RegisteredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredType")
            .field("name", &self.name)
            .field("rust_type", &self.rust_name)
            .finish()
    }
}

/// Object types a store syncs.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, RegisteredType>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name` with the default JSON record mapping.
    /// Registering a name again replaces the earlier entry.
    pub fn register<T: DeserializeOwned + 'static>(&mut self, name: &str) {
        self.register_with_mapping::<T>(name, JsonRecordMapping);
    }

    /// Register `T` under `name` with a custom record mapping.
    pub fn register_with_mapping<T: DeserializeOwned + 'static>(
        &mut self,
        name: &str,
        mapping: impl RecordMapping + 'static,
    ) {
        self.types
            .insert(name.to_string(), RegisteredType::new::<T>(name, Arc::new(mapping)));
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Result<&RegisteredType, StoreError> {
        self.types
            .get(name)
            .ok_or_else(|| StoreError::UnknownType(name.to_string()))
    }

    /// Look up a type by name and check it is registered as `T`.
    pub fn check<T: 'static>(&self, name: &str) -> Result<&RegisteredType, StoreError> {
        let registered = self.get(name)?;
        if registered.is::<T>() {
            Ok(registered)
        } else {
            Err(StoreError::TypeMismatch {
                object_type: name.to_string(),
                registered: registered.rust_name,
            })
        }
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Open stores, one per store identifier.
///
/// Owned by application startup code. Call [`StoreRegistry::shutdown_all`]
/// before exit to stop background sync.
#[derive(Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Arc<SyncedObjectStore>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the store `config` describes, or return it if already open.
    pub async fn open(
        &self,
        config: StoreConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<SyncedObjectStore>, StoreError> {
        let identifier = config.identifier();
        if let Some(existing) = self.get(&identifier) {
            return Ok(existing);
        }

        let store = SyncedObjectStore::open(config, remote).await?;
        let winner = match self.stores.entry(identifier) {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&store));
                None
            }
        };

        match winner {
            // Lost a race with a concurrent open of the same identifier
            Some(existing) => {
                store.shutdown().await;
                Ok(existing)
            }
            None => Ok(store),
        }
    }

    /// An open store.
    pub fn get(&self, identifier: &str) -> Option<Arc<SyncedObjectStore>> {
        self.stores.get(identifier).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of open stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether no store is open.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Shut down and forget one store. Returns false if it was not open.
    pub async fn shutdown(&self, identifier: &str) -> bool {
        let Some((_, store)) = self.stores.remove(identifier) else {
            return false;
        };
        store.shutdown().await;
        true
    }

    /// Shut down every open store.
    pub async fn shutdown_all(&self) {
        let identifiers: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        for identifier in identifiers {
            self.shutdown(&identifier).await;
        }
    }
}
