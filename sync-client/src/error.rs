//! Error types for the synced object store.

use crate::config::ConfigError;
use crate::local::LocalStoreError;
use crate::mapping::MappingError;
use crate::metadata::MetadataError;
use crate::remote::{RecordError, RemoteError};
use objsync_core::ConflictError;
use objsync_types::Locator;
use std::sync::Arc;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The object was deleted; it cannot be saved again under the same id.
    #[error("object {0} is deleted")]
    ObjectDeleted(Locator),

    /// The type name was never registered with the store.
    #[error("type {0} is not registered")]
    UnknownType(String),

    /// The type name is registered for a different Rust type.
    #[error("type {object_type} is registered as {registered}")]
    TypeMismatch {
        /// Requested type name.
        object_type: String,
        /// Rust type it was registered with.
        registered: &'static str,
    },

    /// A payload could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Local store failure.
    #[error(transparent)]
    LocalStore(#[from] LocalStoreError),

    /// Metadata store failure.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    /// Remote call failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Per-record remote write failure.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// Record mapping failure.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Conflict resolution failure.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Sync state exists but the payload it describes is missing.
    #[error("no local payload for {0}")]
    MissingLocalObject(Locator),

    /// The signed-in user changed since the store was opened.
    #[error("signed-in user changed from {expected:?} to {actual:?}")]
    UserMismatch {
        /// User the store was opened for.
        expected: Option<String>,
        /// User the remote now reports.
        actual: Option<String>,
    },

    /// The coordinator task has stopped.
    #[error("sync coordinator is not running")]
    CoordinatorClosed,

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A failure affecting one object, reported without aborting its batch.
#[derive(Debug, Clone)]
pub struct ObjectError {
    /// Object the failure applies to.
    pub locator: Locator,
    /// The failure, shared between subscribers.
    pub error: Arc<StoreError>,
}

impl ObjectError {
    /// Wrap an error for one object.
    pub fn new(locator: Locator, error: impl Into<StoreError>) -> Self {
        Self {
            locator,
            error: Arc::new(error.into()),
        }
    }
}

impl std::fmt::Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.locator, self.error)
    }
}
