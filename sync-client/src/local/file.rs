//! File-backed local store.
//!
//! One JSON file per object under `<root>/<user>/objects/<type>/`. Each file
//! records its own locator next to the payload so listing works even when
//! the file name is a hash.

use super::{LocalStore, LocalStoreError};
use crate::paths;
use objsync_types::Locator;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const KIND: &str = "objects";
const EXTENSION: &str = "json";

#[derive(Serialize, Deserialize)]
struct StoredObject {
    locator: Locator,
    payload: String,
}

/// Local store persisting payloads as files.
#[derive(Debug, Clone)]
pub struct FileLocalStore {
    root: PathBuf,
}

impl FileLocalStore {
    /// Store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read(path: &Path) -> Result<Option<StoredObject>, LocalStoreError> {
        let Some(bytes) = paths::read_optional(path).map_err(|source| LocalStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| LocalStoreError::Corrupt {
                path: path.to_path_buf(),
                source,
            })
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, locator: &Locator) -> Result<Option<String>, LocalStoreError> {
        let path = paths::object_file(&self.root, KIND, locator, EXTENSION);
        Ok(Self::read(&path)?.map(|stored| stored.payload))
    }

    fn put(&self, locator: &Locator, json: &str) -> Result<(), LocalStoreError> {
        let path = paths::object_file(&self.root, KIND, locator, EXTENSION);
        let stored = StoredObject {
            locator: locator.clone(),
            payload: json.to_string(),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|source| LocalStoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        paths::write_atomic(&path, &bytes).map_err(|source| LocalStoreError::Io { path, source })
    }

    fn delete(&self, locator: &Locator) -> Result<(), LocalStoreError> {
        let path = paths::object_file(&self.root, KIND, locator, EXTENSION);
        paths::remove_optional(&path).map_err(|source| LocalStoreError::Io { path, source })
    }

    fn list_locators(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<Locator>, LocalStoreError> {
        let dir = paths::type_dir(&self.root, KIND, object_type, user);
        let files = paths::list_files(&dir, EXTENSION).map_err(|source| LocalStoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut locators = Vec::with_capacity(files.len());
        for path in files {
            match Self::read(&path) {
                Ok(Some(stored)) => locators.push(stored.locator),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable local object: {}", e),
            }
        }
        Ok(locators)
    }
}
