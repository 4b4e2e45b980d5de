//! Reconciliation-time view of an object.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::commit::Commit;
use crate::hash::{canonical_json, content_hash};
use crate::locator::Locator;
use crate::syncdata::{SyncStatus, Syncdata};

/// An object as seen during reconciliation.
///
/// Combines the locator, the JSON payload (empty for tombstones), the opaque
/// remote metadata needed to round-trip remote bookkeeping on writes, and
/// the commit. This is the unit conflict resolvers and record mappings work
/// on. It is never persisted as such.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncableObject {
    /// Object identity.
    pub locator: Locator,
    /// JSON payload. Empty for tombstones.
    pub payload: String,
    /// Whether this revision is a deletion.
    pub is_tombstone: bool,
    /// Opaque remote metadata, if the remote has seen this object.
    pub metadata: Option<Vec<u8>>,
    /// Revision of this object.
    pub commit: Commit,
}

impl SyncableObject {
    /// A live (non-tombstone) object.
    pub fn new(
        locator: Locator,
        payload: impl Into<String>,
        metadata: Option<Vec<u8>>,
        commit: Commit,
    ) -> Self {
        Self {
            locator,
            payload: payload.into(),
            is_tombstone: false,
            metadata,
            commit,
        }
    }

    /// A deletion marker.
    pub fn tombstone(locator: Locator, metadata: Option<Vec<u8>>, commit: Commit) -> Self {
        Self {
            locator,
            payload: String::new(),
            is_tombstone: true,
            metadata,
            commit: commit.tombstone(),
        }
    }

    /// Join a stored payload and metadata with sync state.
    pub fn from_syncdata(
        payload: impl Into<String>,
        metadata: Option<Vec<u8>>,
        syncdata: &Syncdata,
    ) -> Self {
        Self {
            locator: syncdata.locator.clone(),
            payload: payload.into(),
            is_tombstone: syncdata.is_tombstone,
            metadata,
            commit: syncdata.commit.clone(),
        }
    }

    /// Encode a typed value as the payload of a live object.
    pub fn from_value<T: Serialize>(
        value: &T,
        locator: Locator,
        metadata: Option<Vec<u8>>,
        commit: Commit,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(locator, canonical_json(value)?, metadata, commit))
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Content hash of the payload.
    pub fn content_hash(&self) -> String {
        content_hash(&self.payload)
    }

    /// Sync state describing this object with the given status.
    pub fn syncdata(&self, status: SyncStatus) -> Syncdata {
        Syncdata::new(
            self.locator.clone(),
            status,
            self.is_tombstone,
            self.commit.clone(),
        )
    }
}
