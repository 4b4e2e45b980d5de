//! Persistence for coordinator-owned sync state.
//!
//! Everything the coordinator must remember across restarts lives here:
//! per-object [`Syncdata`], opaque remote metadata, the per-user up-sync
//! queue, per-type high-water marks and this installation's device id.
//! Only the coordinator writes to a metadata store.

mod file;
mod memory;

pub use file::FileMetadataStore;
pub use memory::MemoryMetadataStore;

use objsync_types::{Locator, Syncdata};
use std::path::PathBuf;
use thiserror::Error;

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Filesystem failure.
    #[error("metadata I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A stored entry could not be decoded.
    #[error("corrupt metadata entry {path}: {source}")]
    Corrupt {
        /// Path of the entry.
        path: PathBuf,
        /// Decoding error.
        source: serde_json::Error,
    },
}

/// Storage for sync state.
pub trait MetadataStore: Send + Sync {
    /// Sync state of one object.
    fn syncdata(&self, locator: &Locator) -> Result<Option<Syncdata>, MetadataError>;

    /// Store sync state, keyed by its locator.
    fn put_syncdata(&self, syncdata: &Syncdata) -> Result<(), MetadataError>;

    /// Sync state of every known object of a type in `user`'s scope.
    fn list_syncdata(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<Syncdata>, MetadataError>;

    /// Opaque remote bookkeeping for one object.
    fn remote_metadata(&self, locator: &Locator) -> Result<Option<Vec<u8>>, MetadataError>;

    /// Store remote bookkeeping for one object.
    fn put_remote_metadata(&self, locator: &Locator, metadata: &[u8])
        -> Result<(), MetadataError>;

    /// Forget remote bookkeeping for one object.
    fn delete_remote_metadata(&self, locator: &Locator) -> Result<(), MetadataError>;

    /// Locators waiting for up-sync in `user`'s scope, oldest first.
    fn up_sync_queue(&self, user: Option<&str>) -> Result<Vec<Locator>, MetadataError>;

    /// Replace the up-sync queue of `user`'s scope.
    fn put_up_sync_queue(&self, user: Option<&str>, queue: &[Locator])
        -> Result<(), MetadataError>;

    /// Last committed down-sync position for a type.
    fn high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Option<u64>, MetadataError>;

    /// Store the down-sync position for a type.
    fn put_high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
        value: u64,
    ) -> Result<(), MetadataError>;

    /// This installation's device id, once generated.
    fn device_id(&self) -> Result<Option<String>, MetadataError>;

    /// Persist the device id.
    fn put_device_id(&self, device_id: &str) -> Result<(), MetadataError>;
}
