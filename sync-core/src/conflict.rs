//! Conflict resolution between a cloud and a local version of one object.
//!
//! The algorithm:
//! 1. A tombstone on either side wins unconditionally.
//! 2. Otherwise the pluggable resolver is asked to pick or merge.
//! 3. If the resolver declines, the strictly later commit time wins; ties
//!    favor the cloud.
//! 4. A placeholder commit on the result is replaced with a freshly minted
//!    one derived from the result's content hash.
//!
//! The caller then applies the [`ConflictOutcome`], which depends only on
//! which input commit (if any) the result carries.

use objsync_types::{Commit, SyncableObject};
use thiserror::Error;

/// One side of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The version stored remotely.
    Cloud,
    /// The version stored locally.
    Local,
}

/// How a resolved conflict must be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The local revision stands and must be pushed again.
    LocalWins,
    /// The cloud revision replaces local state.
    CloudWins,
    /// A new merged revision replaces local state and must be pushed.
    Merged,
}

/// Errors from conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// The resolver returned an object for a different locator.
    #[error("resolver returned {returned} while resolving {expected}")]
    LocatorMismatch {
        /// Locator being resolved.
        expected: String,
        /// Locator of the resolver's result.
        returned: String,
    },
}

/// A resolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Winning or merged object, carrying a real commit.
    pub object: SyncableObject,
    /// How to apply it.
    pub outcome: ConflictOutcome,
    /// Whether the last-writer-wins fallback decided the result.
    pub used_fallback: bool,
}

/// The side that wins because it is a deletion, if any.
pub fn tombstone_winner(cloud: &SyncableObject, local: &SyncableObject) -> Option<Side> {
    if cloud.is_tombstone {
        Some(Side::Cloud)
    } else if local.is_tombstone {
        Some(Side::Local)
    } else {
        None
    }
}

/// Last-writer-wins by commit time. Ties favor the cloud.
pub fn last_writer_wins(cloud: &Commit, local: &Commit) -> Side {
    if local.time() > cloud.time() {
        Side::Local
    } else {
        Side::Cloud
    }
}

/// Classify a result commit against the two input commits.
pub fn classify(result: &Commit, local: &Commit, cloud: &Commit) -> ConflictOutcome {
    if result == local {
        ConflictOutcome::LocalWins
    } else if result == cloud {
        ConflictOutcome::CloudWins
    } else {
        ConflictOutcome::Merged
    }
}

/// Resolve a conflict between `cloud` and `local`.
///
/// `resolver` is the pluggable merge step; any error from it triggers the
/// last-writer-wins fallback. `mint` produces a fresh commit for a content
/// hash and is only called when the result carries a placeholder commit.
pub fn resolve_conflict<E>(
    cloud: &SyncableObject,
    local: &SyncableObject,
    resolver: impl FnOnce(&SyncableObject, &SyncableObject) -> Result<SyncableObject, E>,
    mint: impl FnOnce(&str) -> Commit,
) -> Result<Resolution, ConflictError> {
    let mut used_fallback = false;
    let mut object = match tombstone_winner(cloud, local) {
        Some(Side::Cloud) => cloud.clone(),
        Some(Side::Local) => local.clone(),
        None => match resolver(cloud, local) {
            Ok(merged) => {
                if merged.locator != local.locator {
                    return Err(ConflictError::LocatorMismatch {
                        expected: local.locator.summary(),
                        returned: merged.locator.summary(),
                    });
                }
                merged
            }
            Err(_) => {
                used_fallback = true;
                match last_writer_wins(&cloud.commit, &local.commit) {
                    Side::Cloud => cloud.clone(),
                    Side::Local => local.clone(),
                }
            }
        },
    };

    if object.commit.is_placeholder() {
        object.commit = mint(&object.content_hash());
    }

    let outcome = classify(&object.commit, &local.commit, &cloud.commit);
    Ok(Resolution {
        object,
        outcome,
        used_fallback,
    })
}
