//! Local object storage.
//!
//! The local store holds the domain payload of each object as JSON text and
//! nothing else; sync state lives in the [`MetadataStore`](crate::metadata::MetadataStore).
//! Calls are synchronous because the coordinator invokes them from inside
//! its command handlers, which must not suspend.

mod file;
mod memory;

pub use file::FileLocalStore;
pub use memory::MemoryLocalStore;

use objsync_types::Locator;
use std::path::PathBuf;
use thiserror::Error;

/// Local store errors.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// Filesystem failure.
    #[error("local store I/O error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A stored entry could not be read back.
    #[error("corrupt local entry {path}: {source}")]
    Corrupt {
        /// Path of the entry.
        path: PathBuf,
        /// Decoding error.
        source: serde_json::Error,
    },
}

/// Keyed storage for object payloads.
pub trait LocalStore: Send + Sync {
    /// Payload stored for `locator`.
    fn get(&self, locator: &Locator) -> Result<Option<String>, LocalStoreError>;

    /// Store or replace the payload for `locator`.
    fn put(&self, locator: &Locator, json: &str) -> Result<(), LocalStoreError>;

    /// Remove the payload for `locator`. Removing a missing entry succeeds.
    fn delete(&self, locator: &Locator) -> Result<(), LocalStoreError>;

    /// Every stored locator of `object_type` in `user`'s scope.
    fn list_locators(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<Locator>, LocalStoreError>;
}
