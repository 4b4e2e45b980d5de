//! File-backed metadata store.

use super::{MetadataError, MetadataStore};
use crate::paths;
use objsync_types::{Locator, Syncdata};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SYNCDATA: &str = "syncdata";
const REMOTE: &str = "metadata";
const QUEUE_FILE: &str = "queue.json";
const MARKS_FILE: &str = "watermarks.json";
const DEVICE_FILE: &str = "device_id";

/// Metadata store persisting sync state as files under a root directory.
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    root: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> MetadataError + '_ {
    move |source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MetadataError> {
    let Some(bytes) = paths::read_optional(path).map_err(io_error(path))? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| MetadataError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), MetadataError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| MetadataError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    paths::write_atomic(path, &bytes).map_err(io_error(path))
}

impl FileMetadataStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn marks_path(&self, user: Option<&str>) -> PathBuf {
        paths::scope_dir(&self.root, user).join(MARKS_FILE)
    }
}

impl MetadataStore for FileMetadataStore {
    fn syncdata(&self, locator: &Locator) -> Result<Option<Syncdata>, MetadataError> {
        read_json(&paths::object_file(&self.root, SYNCDATA, locator, "json"))
    }

    fn put_syncdata(&self, syncdata: &Syncdata) -> Result<(), MetadataError> {
        let path = paths::object_file(&self.root, SYNCDATA, &syncdata.locator, "json");
        write_json(&path, syncdata)
    }

    fn list_syncdata(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<Syncdata>, MetadataError> {
        let dir = paths::type_dir(&self.root, SYNCDATA, object_type, user);
        let files = paths::list_files(&dir, "json").map_err(io_error(&dir))?;

        let mut all = Vec::with_capacity(files.len());
        for path in files {
            if let Some(syncdata) = read_json::<Syncdata>(&path)? {
                all.push(syncdata);
            }
        }
        Ok(all)
    }

    fn remote_metadata(&self, locator: &Locator) -> Result<Option<Vec<u8>>, MetadataError> {
        let path = paths::object_file(&self.root, REMOTE, locator, "bin");
        paths::read_optional(&path).map_err(io_error(&path))
    }

    fn put_remote_metadata(
        &self,
        locator: &Locator,
        metadata: &[u8],
    ) -> Result<(), MetadataError> {
        let path = paths::object_file(&self.root, REMOTE, locator, "bin");
        paths::write_atomic(&path, metadata).map_err(io_error(&path))
    }

    fn delete_remote_metadata(&self, locator: &Locator) -> Result<(), MetadataError> {
        let path = paths::object_file(&self.root, REMOTE, locator, "bin");
        paths::remove_optional(&path).map_err(io_error(&path))
    }

    fn up_sync_queue(&self, user: Option<&str>) -> Result<Vec<Locator>, MetadataError> {
        let path = paths::scope_dir(&self.root, user).join(QUEUE_FILE);
        Ok(read_json(&path)?.unwrap_or_default())
    }

    fn put_up_sync_queue(
        &self,
        user: Option<&str>,
        queue: &[Locator],
    ) -> Result<(), MetadataError> {
        let path = paths::scope_dir(&self.root, user).join(QUEUE_FILE);
        write_json(&path, queue)
    }

    fn high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Option<u64>, MetadataError> {
        let marks: BTreeMap<String, u64> =
            read_json(&self.marks_path(user))?.unwrap_or_default();
        Ok(marks.get(object_type).copied())
    }

    fn put_high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
        value: u64,
    ) -> Result<(), MetadataError> {
        let path = self.marks_path(user);
        let mut marks: BTreeMap<String, u64> = read_json(&path)?.unwrap_or_default();
        marks.insert(object_type.to_string(), value);
        write_json(&path, &marks)
    }

    fn device_id(&self) -> Result<Option<String>, MetadataError> {
        let path = self.root.join(DEVICE_FILE);
        let bytes = paths::read_optional(&path).map_err(io_error(&path))?;
        Ok(bytes
            .map(|b| String::from_utf8_lossy(&b).trim().to_string())
            .filter(|id| !id.is_empty()))
    }

    fn put_device_id(&self, device_id: &str) -> Result<(), MetadataError> {
        let path = self.root.join(DEVICE_FILE);
        paths::write_atomic(&path, device_id.as_bytes()).map_err(io_error(&path))
    }
}
