//! Pluggable conflict resolution.
//!
//! A resolver receives the cloud and local versions of one object and
//! returns the version to keep. It may return either input unchanged, or a
//! merged object carrying [`Commit::resolve()`](objsync_types::Commit::resolve)
//! so the coordinator mints a fresh commit for it. Returning an error hands
//! the decision to last-writer-wins.

use objsync_types::{Locator, SyncableObject};
use thiserror::Error;

/// Why a resolver produced no result.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// The resolver does not handle this object.
    #[error("no resolution for {0}")]
    Declined(Locator),

    /// The resolver tried and failed.
    #[error("resolution failed: {0}")]
    Failed(String),
}

/// Merges two competing versions of one object.
pub trait ConflictResolver: Send + Sync {
    /// Choose or merge between `cloud` and `local`.
    fn resolve(
        &self,
        cloud: &SyncableObject,
        local: &SyncableObject,
    ) -> Result<SyncableObject, ResolveError>;
}

/// Resolver that always declines, leaving every conflict to
/// last-writer-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectResolver;

impl ConflictResolver for RejectResolver {
    fn resolve(
        &self,
        _cloud: &SyncableObject,
        local: &SyncableObject,
    ) -> Result<SyncableObject, ResolveError> {
        Err(ResolveError::Declined(local.locator.clone()))
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&SyncableObject, &SyncableObject) -> Result<SyncableObject, ResolveError> + Send + Sync,
{
    fn resolve(
        &self,
        cloud: &SyncableObject,
        local: &SyncableObject,
    ) -> Result<SyncableObject, ResolveError> {
        self(cloud, local)
    }
}
