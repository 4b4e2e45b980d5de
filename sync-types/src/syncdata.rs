//! Per-object sync state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::commit::{unix_now, Commit};
use crate::locator::Locator;

/// Where an object stands relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// Local and remote are believed identical.
    Current,
    /// Local has a revision the remote has not confirmed.
    NeedsUpSync,
    /// Claimed by an in-flight up-sync batch.
    UpSyncing,
}

impl SyncStatus {
    /// Stable name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::NeedsUpSync => "needsUpSync",
            Self::UpSyncing => "upSyncing",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync state for one locator.
///
/// Owned and mutated exclusively by the sync coordinator. Never deleted: a
/// deleted object keeps its syncdata with a tombstone commit, so a later
/// remote re-creation can be told apart from an object never seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Syncdata {
    /// Object this state belongs to.
    pub locator: Locator,
    /// Current sync status.
    pub status: SyncStatus,
    /// Whether the current revision is a deletion.
    pub is_tombstone: bool,
    /// Current revision.
    pub commit: Commit,
    /// Earliest unix time the next up-sync attempt may run.
    #[serde(default)]
    pub retry_after: Option<u64>,
    /// Consecutive failed up-sync attempts.
    #[serde(default)]
    pub retries: u32,
}

impl Syncdata {
    /// Create sync state. A tombstone forces the commit hash to the
    /// tombstone sentinel.
    pub fn new(locator: Locator, status: SyncStatus, is_tombstone: bool, commit: Commit) -> Self {
        let commit = if is_tombstone {
            commit.tombstone()
        } else {
            commit
        };
        Self {
            locator,
            status,
            is_tombstone,
            commit,
            retry_after: None,
            retries: 0,
        }
    }

    /// Whether an up-sync may be attempted now.
    pub fn should_retry(&self) -> bool {
        self.should_retry_at(unix_now())
    }

    /// Whether an up-sync may be attempted at `now`.
    pub fn should_retry_at(&self, now: u64) -> bool {
        self.retry_after.map_or(true, |after| after < now)
    }

    /// Forget any scheduled retry.
    pub fn clear_retry(&mut self) {
        self.retry_after = None;
        self.retries = 0;
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} | {} | {}{}",
            self.locator.summary(),
            self.status,
            if self.is_tombstone { "tombstone | " } else { "" },
            self.commit
        )
    }
}
