//! Down-sync reconciliation decisions.
//!
//! Given the local sync state (if any) and one fetched remote revision,
//! [`decide_fetched`] returns what the coordinator must do. It is a pure
//! function; the coordinator applies the decision.

use objsync_types::{SyncStatus, SyncableObject, Syncdata};

/// What to do with one fetched remote revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDecision {
    /// Never seen locally: record it as current. `materialize` is false for
    /// tombstones, which have nothing to store.
    Create {
        /// Whether payload and metadata must be written.
        materialize: bool,
    },
    /// Remote deleted an object that is live locally.
    DeleteLocal,
    /// Remote has a live revision of an object deleted and confirmed
    /// locally: keep the tombstone and push it again.
    ReassertTombstone,
    /// Remote revision is already the local one.
    Unchanged,
    /// No pending local edit: remote revision replaces local state.
    Overwrite,
    /// A local edit is pending or in flight; up-sync will settle it.
    Defer,
}

/// Decide how to reconcile `fetched` against local state.
pub fn decide_fetched(local: Option<&Syncdata>, fetched: &SyncableObject) -> FetchDecision {
    let Some(local) = local else {
        return FetchDecision::Create {
            materialize: !fetched.is_tombstone,
        };
    };

    if fetched.is_tombstone && !local.is_tombstone {
        return FetchDecision::DeleteLocal;
    }

    if local.is_tombstone && !fetched.is_tombstone {
        return if local.status == SyncStatus::Current {
            FetchDecision::ReassertTombstone
        } else {
            FetchDecision::Defer
        };
    }

    if fetched.commit == local.commit || (fetched.is_tombstone && local.is_tombstone) {
        return FetchDecision::Unchanged;
    }

    match local.status {
        SyncStatus::Current => FetchDecision::Overwrite,
        SyncStatus::NeedsUpSync | SyncStatus::UpSyncing => FetchDecision::Defer,
    }
}
