//! In-memory metadata store.

use super::{MetadataError, MetadataStore};
use objsync_types::{Locator, Syncdata};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Scope = Option<String>;

/// In-memory metadata store.
///
/// Clones share state, which lets tests reopen a store "after a restart"
/// by handing the same instance to a new coordinator.
#[derive(Debug, Default, Clone)]
pub struct MemoryMetadataStore {
    inner: Arc<Mutex<MemoryMetadataInner>>,
}

#[derive(Debug, Default)]
struct MemoryMetadataInner {
    syncdata: HashMap<Locator, Syncdata>,
    remote: HashMap<Locator, Vec<u8>>,
    queues: HashMap<Scope, Vec<Locator>>,
    marks: HashMap<(String, Scope), u64>,
    device_id: Option<String>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn syncdata(&self, locator: &Locator) -> Result<Option<Syncdata>, MetadataError> {
        Ok(self.inner.lock().unwrap().syncdata.get(locator).cloned())
    }

    fn put_syncdata(&self, syncdata: &Syncdata) -> Result<(), MetadataError> {
        self.inner
            .lock()
            .unwrap()
            .syncdata
            .insert(syncdata.locator.clone(), syncdata.clone());
        Ok(())
    }

    fn list_syncdata(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<Syncdata>, MetadataError> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<Syncdata> = inner
            .syncdata
            .values()
            .filter(|s| s.locator.object_type == object_type && s.locator.user.as_deref() == user)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.locator.cmp(&b.locator));
        Ok(all)
    }

    fn remote_metadata(&self, locator: &Locator) -> Result<Option<Vec<u8>>, MetadataError> {
        Ok(self.inner.lock().unwrap().remote.get(locator).cloned())
    }

    fn put_remote_metadata(
        &self,
        locator: &Locator,
        metadata: &[u8],
    ) -> Result<(), MetadataError> {
        self.inner
            .lock()
            .unwrap()
            .remote
            .insert(locator.clone(), metadata.to_vec());
        Ok(())
    }

    fn delete_remote_metadata(&self, locator: &Locator) -> Result<(), MetadataError> {
        self.inner.lock().unwrap().remote.remove(locator);
        Ok(())
    }

    fn up_sync_queue(&self, user: Option<&str>) -> Result<Vec<Locator>, MetadataError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .queues
            .get(&user.map(str::to_string))
            .cloned()
            .unwrap_or_default())
    }

    fn put_up_sync_queue(
        &self,
        user: Option<&str>,
        queue: &[Locator],
    ) -> Result<(), MetadataError> {
        self.inner
            .lock()
            .unwrap()
            .queues
            .insert(user.map(str::to_string), queue.to_vec());
        Ok(())
    }

    fn high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Option<u64>, MetadataError> {
        let key = (object_type.to_string(), user.map(str::to_string));
        Ok(self.inner.lock().unwrap().marks.get(&key).copied())
    }

    fn put_high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
        value: u64,
    ) -> Result<(), MetadataError> {
        let key = (object_type.to_string(), user.map(str::to_string));
        self.inner.lock().unwrap().marks.insert(key, value);
        Ok(())
    }

    fn device_id(&self) -> Result<Option<String>, MetadataError> {
        Ok(self.inner.lock().unwrap().device_id.clone())
    }

    fn put_device_id(&self, device_id: &str) -> Result<(), MetadataError> {
        self.inner.lock().unwrap().device_id = Some(device_id.to_string());
        Ok(())
    }
}
