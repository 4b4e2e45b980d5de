//! In-memory local store.

use super::{LocalStore, LocalStoreError};
use objsync_types::Locator;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// In-memory local store for tests and ephemeral stores.
///
/// Not persistent; all data is lost when the last clone is dropped.
#[derive(Debug, Default, Clone)]
pub struct MemoryLocalStore {
    objects: Arc<Mutex<BTreeMap<Locator, String>>>,
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, locator: &Locator) -> Result<Option<String>, LocalStoreError> {
        Ok(self.objects.lock().unwrap().get(locator).cloned())
    }

    fn put(&self, locator: &Locator, json: &str) -> Result<(), LocalStoreError> {
        self.objects
            .lock()
            .unwrap()
            .insert(locator.clone(), json.to_string());
        Ok(())
    }

    fn delete(&self, locator: &Locator) -> Result<(), LocalStoreError> {
        self.objects.lock().unwrap().remove(locator);
        Ok(())
    }

    fn list_locators(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<Locator>, LocalStoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|l| l.object_type == object_type && l.user.as_deref() == user)
            .cloned()
            .collect())
    }
}
