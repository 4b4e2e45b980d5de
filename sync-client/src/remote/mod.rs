//! Remote store abstraction.
//!
//! The remote store is the authoritative hub every device syncs through.
//! This module only describes what the sync engine needs from it:
//!
//! - `current_user()` names the authenticated principal
//! - `fetch_since()` / `fetch_continuing()` page through changes of one
//!   record type, newest modification time reported per page
//! - `save_batch()` writes records and reports a result per record
//! - `fetch_by_id()` reads a single record
//!
//! A failure of the whole call is a [`RemoteError`]; a failure of one record
//! inside a batch is a [`RecordError`] and never affects its neighbours.

mod memory;

pub use memory::MemoryRemote;

use async_trait::async_trait;
use objsync_types::Locator;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable identity of a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    /// Record type, equal to the registered object type name.
    pub record_type: String,
    /// Record name, equal to the object id.
    pub name: String,
}

impl RecordId {
    /// Create a record id.
    pub fn new(record_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            name: name.into(),
        }
    }

    /// The record id an object is stored under.
    pub fn for_locator(locator: &Locator) -> Self {
        Self::new(locator.object_type.clone(), locator.id.clone())
    }

    /// The locator this record maps to for `user`.
    pub fn locator(&self, user: Option<&str>) -> Locator {
        Locator::new(self.name.clone(), self.record_type.clone(), user.map(str::to_string))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.record_type, self.name)
    }
}

/// A record as stored by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    /// Record identity.
    pub id: RecordId,
    /// Record fields as JSON text. Empty for tombstones.
    pub payload: String,
    /// Whether the record marks a deletion.
    pub tombstone: bool,
    /// Commit wire string of the revision the record holds.
    pub commit: String,
    /// Opaque server bookkeeping returned by the remote. Must be sent back
    /// unchanged when the record is next written.
    pub system_fields: Option<Vec<u8>>,
    /// Server-side modification time (unix seconds), set by the remote.
    pub modified_at: Option<u64>,
}

/// Opaque continuation token for a paged fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCursor(String);

impl FetchCursor {
    /// Wrap a token issued by a remote.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of fetched changes.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    /// Records changed after the requested point.
    pub records: Vec<RemoteRecord>,
    /// Present when more records are available.
    pub cursor: Option<FetchCursor>,
    /// Largest modification time among `records`.
    pub max_modified: Option<u64>,
}

/// Failure of a whole remote call.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The remote cannot be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// No principal is signed in.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A continuation token was not recognized.
    #[error("invalid fetch cursor: {0}")]
    InvalidCursor(String),

    /// The remote rejected the request.
    #[error("request failed: {0}")]
    Failed(String),
}

/// Failure of one record inside a batch write.
#[derive(Debug, Clone, Error)]
pub enum RecordError {
    /// The record changed on the server since the writer last saw it.
    #[error("record {} changed on the server", .server_record.id)]
    Conflict {
        /// The server's current version.
        server_record: Box<RemoteRecord>,
    },

    /// The writer referenced server state for a record that no longer exists.
    #[error("record is unknown to the server")]
    UnknownRecord,

    /// Any other failure. Retried with backoff.
    #[error("record write failed: {message}")]
    Failed {
        /// Server-provided description.
        message: String,
        /// Server-requested delay before the next attempt.
        retry_after: Option<Duration>,
    },
}

/// Per-record results of a batch write.
pub type SaveResults = HashMap<RecordId, Result<RemoteRecord, RecordError>>;

/// The remote authoritative store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The authenticated principal, if any.
    async fn current_user(&self) -> Result<Option<String>, RemoteError>;

    /// Records of `record_type` modified strictly after `since`, oldest
    /// first, at most `limit` per page.
    async fn fetch_since(
        &self,
        record_type: &str,
        since: u64,
        limit: usize,
    ) -> Result<FetchPage, RemoteError>;

    /// The next page of an earlier fetch.
    async fn fetch_continuing(
        &self,
        cursor: &FetchCursor,
        limit: usize,
    ) -> Result<FetchPage, RemoteError>;

    /// Write `records`, reporting a result for each one.
    async fn save_batch(&self, records: Vec<RemoteRecord>) -> Result<SaveResults, RemoteError>;

    /// Read one record.
    async fn fetch_by_id(&self, id: &RecordId) -> Result<Option<RemoteRecord>, RemoteError>;
}
