//! # sync-client
//!
//! Local-first object synchronization for objsync.
//!
//! Applications save typed objects locally and keep working offline; a
//! background task writes local changes to a remote store and folds remote
//! changes back in, resolving conflicts along the way.
//!
//! ## Features
//!
//! - **Typed API**: `save::<T>()`, `object::<T>()`, `objects::<T>()` over
//!   registered object types
//! - **Single-writer sync state**: all bookkeeping goes through one
//!   coordinator task
//! - **Conflict resolution**: pluggable resolver with last-writer-wins
//!   fallback; deletions always win
//! - **Retry with backoff**: failed writes are retried on a capped
//!   quadratic schedule
//! - **Pluggable collaborators**: remote, local and metadata stores are
//!   traits, with in-memory and file-backed implementations
//!
//! ## Example
//!
//! ```ignore
//! use objsync_client::{MemoryRemote, StoreConfig, StoreRegistry, SyncSettings};
//!
//! let registry = StoreRegistry::new();
//! let config = StoreConfig::new(SyncSettings::default()).with_type::<Note>("Note");
//! let store = registry.open(config, Arc::new(MemoryRemote::with_user("alice"))).await?;
//!
//! store.save("n1", "Note", &note).await?;
//! let mut changes = store.subscribe_changes();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod local;
pub mod mapping;
pub mod metadata;
mod paths;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod store;

pub use config::{store_identifier, ConfigError, Scope, StoreConfig, SyncSettings};
pub use coordinator::{Coordinator, CoordinatorHandle, Reconciled, UpSyncBatch, UpSyncFailure};
pub use error::{ObjectError, StoreError};
pub use local::{FileLocalStore, LocalStore, LocalStoreError, MemoryLocalStore};
pub use mapping::{JsonRecordMapping, MappingError, RecordMapping};
pub use metadata::{FileMetadataStore, MemoryMetadataStore, MetadataError, MetadataStore};
pub use registry::{RegisteredType, StoreRegistry, TypeRegistry};
pub use remote::{
    FetchCursor, FetchPage, MemoryRemote, RecordError, RecordId, RemoteError, RemoteRecord,
    RemoteStore, SaveResults,
};
pub use resolver::{ConflictResolver, RejectResolver, ResolveError};
pub use store::{SyncOutcome, SyncReport, SyncedObjectStore};

// Re-exports so applications need only this crate
pub use objsync_types::{
    ChangeAction, ChangeOrigin, Commit, Locator, ObjectChange, SyncStatus, SyncableObject,
    Syncdata,
};
