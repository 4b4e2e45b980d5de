//! Sync coordinator.
//!
//! The coordinator is the single owner of sync state. Every read or write
//! of [`Syncdata`], remote metadata, the up-sync queue and the high-water
//! marks goes through it, and it never touches a payload without updating
//! the matching sync state in the same command.
//!
//! # Architecture
//!
//! [`Coordinator`] holds the logic as plain synchronous methods.
//! [`CoordinatorHandle::spawn`] moves it into a tokio task that processes
//! one command at a time from an `mpsc` channel, replying over `oneshot`
//! channels. Handlers never await, so commands cannot interleave and all
//! transitions of one locator are totally ordered.
//!
//! ```text
//! SyncedObjectStore ──Command──▶ [coordinator task] ──▶ LocalStore
//!          ▲                            │          └──▶ MetadataStore
//!          └────────── reply ───────────┘
//! ```
//!
//! Decisions come from `sync-core` (`resolve_conflict`, `decide_fetched`,
//! `RetryPolicy`); this module applies them.

use crate::error::{ObjectError, StoreError};
use crate::local::LocalStore;
use crate::metadata::MetadataStore;
use crate::remote::{RecordError, RemoteRecord};
use crate::resolver::ConflictResolver;
use objsync_core::{decide_fetched, resolve_conflict, ConflictOutcome, FetchDecision, RetryPolicy};
use objsync_types::hash::{canonicalize, content_hash, new_device_id};
use objsync_types::{
    unix_now, ChangeAction, ChangeOrigin, Commit, Locator, ObjectChange, SyncStatus,
    SyncableObject, Syncdata, TOMBSTONE_HASH,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Capacity of the coordinator command channel.
const COMMAND_BUFFER: usize = 64;

/// Objects selected for one up-sync batch.
#[derive(Debug, Clone, Default)]
pub struct UpSyncBatch {
    /// Objects to write, claimed if requested.
    pub objects: Vec<SyncableObject>,
    /// Locators in the up-sync queue after selection, including the
    /// returned ones.
    pub queued: usize,
    /// Queued objects dropped because they cannot be written.
    pub errors: Vec<ObjectError>,
}

/// Why the remote did not confirm one up-synced object.
#[derive(Debug)]
pub enum UpSyncFailure {
    /// The remote holds a different revision.
    Conflict {
        /// The remote's version.
        server: SyncableObject,
    },
    /// The remote no longer knows the record the object referenced.
    UnknownRecord,
    /// Any other failure; retried with backoff.
    Transient {
        /// What went wrong.
        error: StoreError,
        /// Remote-requested delay before the next attempt.
        retry_after: Option<Duration>,
    },
}

impl UpSyncFailure {
    /// Classify a per-record write error. `decode` maps the server's copy
    /// of a conflicting record; if that fails the write is retried.
    pub fn from_record_error(
        error: RecordError,
        decode: impl FnOnce(&RemoteRecord) -> Result<SyncableObject, StoreError>,
    ) -> Self {
        match error {
            RecordError::Conflict { server_record } => match decode(&server_record) {
                Ok(server) => Self::Conflict { server },
                Err(error) => Self::Transient {
                    error,
                    retry_after: None,
                },
            },
            RecordError::UnknownRecord => Self::UnknownRecord,
            RecordError::Failed { retry_after, .. } => Self::Transient {
                retry_after,
                error: StoreError::Record(error),
            },
        }
    }
}

/// Observable results of one reconciliation step.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// State transitions to publish.
    pub changes: Vec<ObjectChange>,
    /// Per-object failures to publish.
    pub errors: Vec<ObjectError>,
}

impl Reconciled {
    /// Append another step's results.
    pub fn extend(&mut self, other: Reconciled) {
        self.changes.extend(other.changes);
        self.errors.extend(other.errors);
    }

    fn record(&mut self, locator: Locator, result: Result<Option<ObjectChange>, StoreError>) {
        match result {
            Ok(Some(change)) => self.changes.push(change),
            Ok(None) => {}
            Err(e) => self.errors.push(ObjectError::new(locator, e)),
        }
    }
}

/// Owner of all sync state for one store.
pub struct Coordinator {
    device_id: String,
    local: Arc<dyn LocalStore>,
    metadata: Arc<dyn MetadataStore>,
    resolver: Arc<dyn ConflictResolver>,
    retry: RetryPolicy,
}

impl Coordinator {
    /// Create a coordinator, loading this installation's device id or
    /// generating and persisting one.
    pub fn open(
        local: Arc<dyn LocalStore>,
        metadata: Arc<dyn MetadataStore>,
        resolver: Arc<dyn ConflictResolver>,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let device_id = match metadata.device_id()? {
            Some(id) => id,
            None => {
                let id = new_device_id();
                metadata.put_device_id(&id)?;
                tracing::info!("Generated device id {}", id);
                id
            }
        };

        Ok(Self {
            device_id,
            local,
            metadata,
            resolver,
            retry,
        })
    }

    /// This installation's device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Mint a commit for `hash` attributed to this device.
    pub fn new_commit(&self, hash: &str) -> Commit {
        Commit::new(self.device_id.as_str(), hash)
    }

    /// Sync state of one object.
    pub fn syncdata(&self, locator: &Locator) -> Result<Option<Syncdata>, StoreError> {
        Ok(self.metadata.syncdata(locator)?)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a live object, acknowledging its current revision.
    pub fn object(&self, locator: &Locator) -> Result<Option<SyncableObject>, StoreError> {
        let Some(payload) = self.local.get(locator)? else {
            return Ok(None);
        };
        let metadata = self.metadata.remote_metadata(locator)?;
        match self.metadata.syncdata(locator)? {
            Some(syncdata) if syncdata.is_tombstone => Ok(None),
            Some(syncdata) => {
                let syncdata = self.acknowledge_syncdata(syncdata)?;
                Ok(Some(SyncableObject::from_syncdata(payload, metadata, &syncdata)))
            }
            // Payload written behind the coordinator's back
            None => Ok(Some(SyncableObject::new(
                locator.clone(),
                payload,
                metadata,
                Commit::empty(),
            ))),
        }
    }

    /// Read every live object of a type, acknowledging each.
    pub fn objects(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<SyncableObject>, StoreError> {
        let mut objects = Vec::new();
        for locator in self.local.list_locators(object_type, user)? {
            if let Some(object) = self.object(&locator)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Current local version including tombstones, for conflict resolution.
    fn load(&self, locator: &Locator) -> Result<Option<SyncableObject>, StoreError> {
        let Some(syncdata) = self.metadata.syncdata(locator)? else {
            return Ok(None);
        };
        let metadata = self.metadata.remote_metadata(locator)?;
        if syncdata.is_tombstone {
            return Ok(Some(SyncableObject::tombstone(
                locator.clone(),
                metadata,
                syncdata.commit,
            )));
        }
        let payload = self
            .local
            .get(locator)?
            .ok_or_else(|| StoreError::MissingLocalObject(locator.clone()))?;
        Ok(Some(SyncableObject::from_syncdata(payload, metadata, &syncdata)))
    }

    // =========================================================================
    // Acknowledgement
    // =========================================================================

    /// Attribute an object's current revision to this device.
    pub fn acknowledge(&self, locator: &Locator) -> Result<(), StoreError> {
        if let Some(syncdata) = self.metadata.syncdata(locator)? {
            self.acknowledge_syncdata(syncdata)?;
        }
        Ok(())
    }

    /// Acknowledge several objects, collecting per-object failures.
    pub fn acknowledge_many(&self, locators: &[Locator]) -> Vec<ObjectError> {
        locators
            .iter()
            .filter_map(|locator| {
                self.acknowledge(locator)
                    .err()
                    .map(|e| ObjectError::new(locator.clone(), e))
            })
            .collect()
    }

    fn acknowledge_syncdata(&self, mut syncdata: Syncdata) -> Result<Syncdata, StoreError> {
        if syncdata.commit.device_id() != self.device_id {
            syncdata.commit = syncdata.commit.restamped(&self.device_id);
            self.metadata.put_syncdata(&syncdata)?;
        }
        Ok(syncdata)
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    /// Save a payload locally and queue it for up-sync.
    ///
    /// When the stored revision came from another device and was never
    /// acknowledged here, the save is treated as a conflict against it.
    /// If that revision wins (ties go to it) the edit is discarded, the
    /// revision is acknowledged and `Ok(None)` is returned, the same as for
    /// a save that changes nothing.
    pub fn save_object(
        &self,
        locator: &Locator,
        payload: &str,
    ) -> Result<Option<ObjectChange>, StoreError> {
        let payload = canonicalize(payload)?;
        let hash = content_hash(&payload);

        let Some(existing) = self.metadata.syncdata(locator)? else {
            let object = SyncableObject::new(locator.clone(), payload, None, self.new_commit(&hash));
            self.stage(&object, None)?;
            tracing::debug!("Created {}", locator);
            return Ok(Some(local_change(&object, ChangeAction::Created)));
        };

        if existing.is_tombstone {
            return Err(StoreError::ObjectDeleted(locator.clone()));
        }

        let stored = self.local.get(locator)?;
        let stored_canonical = stored.as_deref().and_then(|s| canonicalize(s).ok());
        if stored_canonical.as_deref() == Some(payload.as_str()) {
            return Ok(None);
        }

        let metadata = self.metadata.remote_metadata(locator)?;
        let mut object = SyncableObject::new(
            locator.clone(),
            payload,
            metadata.clone(),
            self.new_commit(&hash),
        );

        if let Some(stored) = stored {
            if existing.commit.device_id() != self.device_id {
                let current = SyncableObject::from_syncdata(stored, metadata, &existing);
                let resolution = resolve_conflict(
                    &current,
                    &object,
                    |cloud, local| self.resolver.resolve(cloud, local),
                    |hash| self.new_commit(hash),
                )?;

                let resolved_canonical = canonicalize(&resolution.object.payload).ok();
                if resolution.outcome == ConflictOutcome::CloudWins
                    || resolved_canonical == stored_canonical
                {
                    tracing::info!(
                        "Save of {} lost to unacknowledged revision {}",
                        locator,
                        existing.commit
                    );
                    self.acknowledge_syncdata(existing)?;
                    return Ok(None);
                }
                object = resolution.object;
            }
        }

        self.stage(&object, Some(&existing))?;
        Ok(Some(local_change(&object, ChangeAction::Modified)))
    }

    /// Delete an object locally, recording a tombstone revision.
    pub fn delete_object(&self, locator: &Locator) -> Result<Option<ObjectChange>, StoreError> {
        let existing = self.metadata.syncdata(locator)?;
        match &existing {
            Some(syncdata) if syncdata.is_tombstone => return Ok(None),
            None if self.local.get(locator)?.is_none() => return Ok(None),
            _ => {}
        }

        let metadata = self.metadata.remote_metadata(locator)?;
        let tombstone = SyncableObject::tombstone(
            locator.clone(),
            metadata,
            self.new_commit(TOMBSTONE_HASH),
        );
        self.stage(&tombstone, existing.as_ref())?;
        tracing::debug!("Deleted {}", locator);
        Ok(Some(local_change(&tombstone, ChangeAction::Deleted)))
    }

    /// Persist a local revision as `needsUpSync` and queue it. Retry state
    /// carries over from `previous` so repeated edits cannot bypass backoff.
    fn stage(&self, object: &SyncableObject, previous: Option<&Syncdata>) -> Result<(), StoreError> {
        if object.is_tombstone {
            self.local.delete(&object.locator)?;
        } else {
            self.local.put(&object.locator, &object.payload)?;
        }

        let mut syncdata = object.syncdata(SyncStatus::NeedsUpSync);
        if let Some(previous) = previous {
            syncdata.retry_after = previous.retry_after;
            syncdata.retries = previous.retries;
        }
        self.metadata.put_syncdata(&syncdata)?;
        self.enqueue(&object.locator)
    }

    // =========================================================================
    // Up-sync queue
    // =========================================================================

    fn enqueue(&self, locator: &Locator) -> Result<(), StoreError> {
        let user = locator.user.as_deref();
        let mut queue = self.metadata.up_sync_queue(user)?;
        if !queue.contains(locator) {
            queue.push(locator.clone());
            self.metadata.put_up_sync_queue(user, &queue)?;
        }
        Ok(())
    }

    fn dequeue(&self, locator: &Locator) -> Result<(), StoreError> {
        let user = locator.user.as_deref();
        let mut queue = self.metadata.up_sync_queue(user)?;
        let before = queue.len();
        queue.retain(|queued| queued != locator);
        if queue.len() != before {
            self.metadata.put_up_sync_queue(user, &queue)?;
        }
        Ok(())
    }

    /// Number of locators waiting for up-sync.
    pub fn queue_len(&self, user: Option<&str>) -> Result<usize, StoreError> {
        Ok(self.metadata.up_sync_queue(user)?.len())
    }

    /// Select up to `max` queued objects that are due for up-sync.
    ///
    /// With `claim`, each selected object is flipped to `upSyncing` before
    /// returning, so a concurrent selection cannot pick it again. Queue
    /// entries that are no longer pending are dropped, as are live objects
    /// whose payload is missing; those are reported in
    /// [`UpSyncBatch::errors`].
    pub fn objects_needing_up_sync(
        &self,
        user: Option<&str>,
        claim: bool,
        max: usize,
    ) -> Result<UpSyncBatch, StoreError> {
        let now = unix_now();
        let queue = self.metadata.up_sync_queue(user)?;
        let total = queue.len();
        let mut kept = Vec::with_capacity(total);
        let mut objects = Vec::new();
        let mut errors = Vec::new();

        for locator in queue {
            let Some(mut syncdata) = self.metadata.syncdata(&locator)? else {
                continue;
            };
            if syncdata.status == SyncStatus::Current {
                continue;
            }
            let payload = if syncdata.is_tombstone {
                None
            } else {
                let Some(payload) = self.local.get(&locator)? else {
                    tracing::warn!("Queued object {} has no payload, dropping it", locator);
                    errors.push(ObjectError::new(
                        locator.clone(),
                        StoreError::MissingLocalObject(locator),
                    ));
                    continue;
                };
                Some(payload)
            };
            kept.push(locator.clone());

            if objects.len() >= max
                || syncdata.status != SyncStatus::NeedsUpSync
                || !syncdata.should_retry_at(now)
            {
                continue;
            }

            let metadata = self.metadata.remote_metadata(&locator)?;
            let object = match payload {
                Some(payload) => SyncableObject::from_syncdata(payload, metadata, &syncdata),
                None => {
                    SyncableObject::tombstone(locator.clone(), metadata, syncdata.commit.clone())
                }
            };

            if claim {
                syncdata.status = SyncStatus::UpSyncing;
                self.metadata.put_syncdata(&syncdata)?;
            }
            objects.push(object);
        }

        if kept.len() != total {
            self.metadata.put_up_sync_queue(user, &kept)?;
        }

        Ok(UpSyncBatch {
            objects,
            queued: kept.len(),
            errors,
        })
    }

    /// Return claimed objects to `needsUpSync`. Returns how many were still
    /// claimed.
    pub fn release_claims(&self, locators: &[Locator]) -> Result<usize, StoreError> {
        let mut released = 0;
        for locator in locators {
            if let Some(mut syncdata) = self.metadata.syncdata(locator)? {
                if syncdata.status == SyncStatus::UpSyncing {
                    syncdata.status = SyncStatus::NeedsUpSync;
                    self.metadata.put_syncdata(&syncdata)?;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    /// Release claimed objects and push their next attempt out to the
    /// retry ceiling.
    pub fn defer_claims(&self, locators: &[Locator]) -> Result<(), StoreError> {
        let now = unix_now();
        for locator in locators {
            if let Some(mut syncdata) = self.metadata.syncdata(locator)? {
                if syncdata.status == SyncStatus::UpSyncing {
                    let schedule = self.retry.defer(syncdata.retries, now);
                    syncdata.status = SyncStatus::NeedsUpSync;
                    syncdata.retry_after = Some(schedule.retry_after);
                    self.metadata.put_syncdata(&syncdata)?;
                }
            }
        }
        Ok(())
    }

    /// Repair state left behind by a previous process: claims on queued
    /// objects are released, and pending objects of `object_types` that are
    /// missing from the queue are put back on it. Returns how many objects
    /// were repaired.
    pub fn recover<S: AsRef<str>>(
        &self,
        object_types: &[S],
        user: Option<&str>,
    ) -> Result<usize, StoreError> {
        let mut queue = self.metadata.up_sync_queue(user)?;
        let released = self.release_claims(&queue)?;

        let mut requeued = 0;
        for object_type in object_types {
            for mut syncdata in self.metadata.list_syncdata(object_type.as_ref(), user)? {
                if syncdata.status == SyncStatus::Current || queue.contains(&syncdata.locator) {
                    continue;
                }
                if !syncdata.is_tombstone && self.local.get(&syncdata.locator)?.is_none() {
                    continue;
                }
                if syncdata.status == SyncStatus::UpSyncing {
                    syncdata.status = SyncStatus::NeedsUpSync;
                    self.metadata.put_syncdata(&syncdata)?;
                }
                queue.push(syncdata.locator);
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.metadata.put_up_sync_queue(user, &queue)?;
        }

        let repaired = released + requeued;
        if repaired > 0 {
            tracing::info!(
                "Recovered up-sync state: {} claims released, {} objects requeued",
                released,
                requeued
            );
        }
        Ok(repaired)
    }

    // =========================================================================
    // Up-sync results
    // =========================================================================

    /// Apply confirmed writes. `saved` holds the written objects carrying
    /// the metadata the remote returned.
    pub fn process_cloud_saved(&self, saved: Vec<SyncableObject>) -> Reconciled {
        let mut result = Reconciled::default();
        for object in saved {
            let outcome = self.confirm_saved(&object).map(|()| None);
            result.record(object.locator, outcome);
        }
        result
    }

    fn confirm_saved(&self, object: &SyncableObject) -> Result<(), StoreError> {
        if let Some(metadata) = &object.metadata {
            self.metadata.put_remote_metadata(&object.locator, metadata)?;
        }

        let Some(mut syncdata) = self.metadata.syncdata(&object.locator)? else {
            return Ok(());
        };
        if syncdata.commit != object.commit {
            tracing::debug!(
                "{} changed while uploading, keeping it queued",
                object.locator
            );
            return Ok(());
        }

        syncdata.status = SyncStatus::Current;
        syncdata.clear_retry();
        self.metadata.put_syncdata(&syncdata)?;
        self.dequeue(&object.locator)
    }

    /// Apply rejected writes.
    pub fn process_cloud_errors(&self, failures: Vec<(Locator, UpSyncFailure)>) -> Reconciled {
        let mut result = Reconciled::default();
        for (locator, failure) in failures {
            match failure {
                UpSyncFailure::Conflict { server } => {
                    let outcome = self.resolve_server_conflict(server);
                    result.record(locator, outcome);
                }
                UpSyncFailure::UnknownRecord => {
                    let error = match self.forget_remote(&locator) {
                        Ok(()) => StoreError::Record(RecordError::UnknownRecord),
                        Err(e) => e,
                    };
                    result.errors.push(ObjectError::new(locator, error));
                }
                UpSyncFailure::Transient { error, retry_after } => {
                    let error = match self.schedule_retry(&locator, retry_after) {
                        Ok(()) => error,
                        Err(e) => e,
                    };
                    result.errors.push(ObjectError::new(locator, error));
                }
            }
        }
        result
    }

    fn resolve_server_conflict(
        &self,
        server: SyncableObject,
    ) -> Result<Option<ObjectChange>, StoreError> {
        let locator = server.locator.clone();
        let local = self
            .load(&locator)?
            .ok_or_else(|| StoreError::MissingLocalObject(locator.clone()))?;

        let resolution = resolve_conflict(
            &server,
            &local,
            |cloud, local| self.resolver.resolve(cloud, local),
            |hash| self.new_commit(hash),
        )?;

        if let Some(metadata) = &server.metadata {
            self.metadata.put_remote_metadata(&locator, metadata)?;
        }
        tracing::info!(
            "Resolved conflict on {}: {:?}{}",
            locator,
            resolution.outcome,
            if resolution.used_fallback {
                " (last writer wins)"
            } else {
                ""
            }
        );

        let merged = resolution.object;
        match resolution.outcome {
            ConflictOutcome::LocalWins => {
                self.metadata
                    .put_syncdata(&merged.syncdata(SyncStatus::NeedsUpSync))?;
                self.enqueue(&locator)?;
                Ok(None)
            }
            ConflictOutcome::CloudWins => {
                let action = if merged.is_tombstone {
                    self.local.delete(&locator)?;
                    ChangeAction::Deleted
                } else {
                    self.local.put(&locator, &merged.payload)?;
                    ChangeAction::Modified
                };
                self.metadata
                    .put_syncdata(&merged.syncdata(SyncStatus::Current))?;
                self.dequeue(&locator)?;

                if merged.is_tombstone && local.is_tombstone {
                    return Ok(None);
                }
                Ok(Some(ObjectChange::new(
                    locator,
                    merged.commit,
                    action,
                    ChangeOrigin::Cloud,
                )))
            }
            ConflictOutcome::Merged => {
                self.stage(&merged, None)?;
                Ok(Some(local_change(&merged, ChangeAction::Modified)))
            }
        }
    }

    fn forget_remote(&self, locator: &Locator) -> Result<(), StoreError> {
        self.metadata.delete_remote_metadata(locator)?;
        if let Some(mut syncdata) = self.metadata.syncdata(locator)? {
            if syncdata.status == SyncStatus::UpSyncing {
                syncdata.status = SyncStatus::NeedsUpSync;
                self.metadata.put_syncdata(&syncdata)?;
            }
        }
        tracing::debug!("{} unknown to remote, will recreate", locator);
        self.enqueue(locator)
    }

    fn schedule_retry(&self, locator: &Locator, hint: Option<Duration>) -> Result<(), StoreError> {
        let Some(mut syncdata) = self.metadata.syncdata(locator)? else {
            return Ok(());
        };

        let schedule = self.retry.schedule(syncdata.retries, hint, unix_now());
        syncdata.retries = schedule.retries;
        syncdata.retry_after = Some(schedule.retry_after);
        if syncdata.status == SyncStatus::UpSyncing {
            syncdata.status = SyncStatus::NeedsUpSync;
        }
        self.metadata.put_syncdata(&syncdata)?;
        tracing::warn!(
            "Retrying {} in {}s (attempt {})",
            locator,
            schedule.delay.as_secs(),
            schedule.retries
        );
        self.enqueue(locator)
    }

    // =========================================================================
    // Down-sync
    // =========================================================================

    /// Reconcile fetched remote revisions with local state.
    pub fn process_fetched(&self, fetched: Vec<SyncableObject>) -> Reconciled {
        let mut result = Reconciled::default();
        for object in fetched {
            let locator = object.locator.clone();
            let outcome = self.apply_fetched(object);
            result.record(locator, outcome);
        }
        result
    }

    fn apply_fetched(
        &self,
        mut fetched: SyncableObject,
    ) -> Result<Option<ObjectChange>, StoreError> {
        if fetched.commit.is_placeholder() {
            let hash = if fetched.is_tombstone {
                TOMBSTONE_HASH.to_string()
            } else {
                fetched.content_hash()
            };
            fetched.commit = self.new_commit(&hash);
        }

        let locator = fetched.locator.clone();
        let local = self.metadata.syncdata(&locator)?;
        let decision = decide_fetched(local.as_ref(), &fetched);
        tracing::trace!("Fetched {}: {:?}", locator, decision);

        match decision {
            FetchDecision::Create { materialize } => {
                if materialize {
                    self.write_fetched(&fetched)?;
                }
                self.metadata
                    .put_syncdata(&fetched.syncdata(SyncStatus::Current))?;
                Ok(materialize.then(|| cloud_change(&fetched, ChangeAction::Created)))
            }
            FetchDecision::DeleteLocal => {
                self.local.delete(&locator)?;
                self.metadata.delete_remote_metadata(&locator)?;
                self.metadata
                    .put_syncdata(&fetched.syncdata(SyncStatus::Current))?;
                self.dequeue(&locator)?;
                Ok(Some(cloud_change(&fetched, ChangeAction::Deleted)))
            }
            FetchDecision::ReassertTombstone => {
                if let Some(metadata) = &fetched.metadata {
                    self.metadata.put_remote_metadata(&locator, metadata)?;
                }
                if let Some(mut syncdata) = local {
                    syncdata.status = SyncStatus::NeedsUpSync;
                    self.metadata.put_syncdata(&syncdata)?;
                }
                tracing::debug!("{} resurrected remotely, keeping tombstone", locator);
                self.enqueue(&locator)?;
                Ok(None)
            }
            FetchDecision::Overwrite => {
                self.write_fetched(&fetched)?;
                self.metadata
                    .put_syncdata(&fetched.syncdata(SyncStatus::Current))?;
                Ok(Some(cloud_change(&fetched, ChangeAction::Modified)))
            }
            FetchDecision::Unchanged | FetchDecision::Defer => Ok(None),
        }
    }

    fn write_fetched(&self, fetched: &SyncableObject) -> Result<(), StoreError> {
        self.local.put(&fetched.locator, &fetched.payload)?;
        if let Some(metadata) = &fetched.metadata {
            self.metadata
                .put_remote_metadata(&fetched.locator, metadata)?;
        }
        Ok(())
    }

    // =========================================================================
    // High-water marks
    // =========================================================================

    /// Committed down-sync position for a type (0 when never synced).
    pub fn high_water_mark(&self, object_type: &str, user: Option<&str>) -> Result<u64, StoreError> {
        Ok(self
            .metadata
            .high_water_mark(object_type, user)?
            .unwrap_or(0))
    }

    /// Persist the down-sync position for a type.
    pub fn save_high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
        value: u64,
    ) -> Result<(), StoreError> {
        Ok(self
            .metadata
            .put_high_water_mark(object_type, user, value)?)
    }

    // =========================================================================
    // Actor loop
    // =========================================================================

    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        tracing::debug!("Coordinator stopped");
    }

    /// Process one command. Returns false on shutdown.
    fn handle(&self, command: Command) -> bool {
        match command {
            Command::Object { locator, resp } => {
                let _ = resp.send(self.object(&locator));
            }
            Command::Objects {
                object_type,
                user,
                resp,
            } => {
                let _ = resp.send(self.objects(&object_type, user.as_deref()));
            }
            Command::Syncdata { locator, resp } => {
                let _ = resp.send(self.syncdata(&locator));
            }
            Command::Save {
                locator,
                payload,
                resp,
            } => {
                let _ = resp.send(self.save_object(&locator, &payload));
            }
            Command::Delete { locator, resp } => {
                let _ = resp.send(self.delete_object(&locator));
            }
            Command::Acknowledge { locator, resp } => {
                let _ = resp.send(self.acknowledge(&locator));
            }
            Command::AcknowledgeMany { locators, resp } => {
                let _ = resp.send(self.acknowledge_many(&locators));
            }
            Command::NeedingUpSync {
                user,
                claim,
                max,
                resp,
            } => {
                let _ = resp.send(self.objects_needing_up_sync(user.as_deref(), claim, max));
            }
            Command::ReleaseClaims { locators, resp } => {
                let _ = resp.send(self.release_claims(&locators));
            }
            Command::DeferClaims { locators, resp } => {
                let _ = resp.send(self.defer_claims(&locators));
            }
            Command::CloudSaved { saved, resp } => {
                let _ = resp.send(self.process_cloud_saved(saved));
            }
            Command::CloudErrors { failures, resp } => {
                let _ = resp.send(self.process_cloud_errors(failures));
            }
            Command::Fetched { objects, resp } => {
                let _ = resp.send(self.process_fetched(objects));
            }
            Command::QueueLen { user, resp } => {
                let _ = resp.send(self.queue_len(user.as_deref()));
            }
            Command::HighWaterMark {
                object_type,
                user,
                resp,
            } => {
                let _ = resp.send(self.high_water_mark(&object_type, user.as_deref()));
            }
            Command::SaveHighWaterMark {
                object_type,
                user,
                value,
                resp,
            } => {
                let _ = resp.send(self.save_high_water_mark(&object_type, user.as_deref(), value));
            }
            Command::Shutdown => return false,
        }
        true
    }
}

fn local_change(object: &SyncableObject, action: ChangeAction) -> ObjectChange {
    ObjectChange::new(
        object.locator.clone(),
        object.commit.clone(),
        action,
        ChangeOrigin::Local,
    )
}

fn cloud_change(object: &SyncableObject, action: ChangeAction) -> ObjectChange {
    ObjectChange::new(
        object.locator.clone(),
        object.commit.clone(),
        action,
        ChangeOrigin::Cloud,
    )
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Commands processed by the coordinator task.
enum Command {
    Object {
        locator: Locator,
        resp: Reply<Option<SyncableObject>>,
    },
    Objects {
        object_type: String,
        user: Option<String>,
        resp: Reply<Vec<SyncableObject>>,
    },
    Syncdata {
        locator: Locator,
        resp: Reply<Option<Syncdata>>,
    },
    Save {
        locator: Locator,
        payload: String,
        resp: Reply<Option<ObjectChange>>,
    },
    Delete {
        locator: Locator,
        resp: Reply<Option<ObjectChange>>,
    },
    Acknowledge {
        locator: Locator,
        resp: Reply<()>,
    },
    AcknowledgeMany {
        locators: Vec<Locator>,
        resp: oneshot::Sender<Vec<ObjectError>>,
    },
    NeedingUpSync {
        user: Option<String>,
        claim: bool,
        max: usize,
        resp: Reply<UpSyncBatch>,
    },
    ReleaseClaims {
        locators: Vec<Locator>,
        resp: Reply<usize>,
    },
    DeferClaims {
        locators: Vec<Locator>,
        resp: Reply<()>,
    },
    CloudSaved {
        saved: Vec<SyncableObject>,
        resp: oneshot::Sender<Reconciled>,
    },
    CloudErrors {
        failures: Vec<(Locator, UpSyncFailure)>,
        resp: oneshot::Sender<Reconciled>,
    },
    Fetched {
        objects: Vec<SyncableObject>,
        resp: oneshot::Sender<Reconciled>,
    },
    QueueLen {
        user: Option<String>,
        resp: Reply<usize>,
    },
    HighWaterMark {
        object_type: String,
        user: Option<String>,
        resp: Reply<u64>,
    },
    SaveHighWaterMark {
        object_type: String,
        user: Option<String>,
        value: u64,
        resp: Reply<()>,
    },
    Shutdown,
}

/// Cloneable handle to a running coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    device_id: Arc<str>,
}

impl CoordinatorHandle {
    /// Move `coordinator` into its own task.
    pub fn spawn(coordinator: Coordinator) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let device_id: Arc<str> = Arc::from(coordinator.device_id());
        let task = tokio::spawn(coordinator.run(rx));
        (Self { tx, device_id }, task)
    }

    /// This installation's device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, StoreError> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(command(resp))
            .await
            .map_err(|_| StoreError::CoordinatorClosed)?;
        rx.await.map_err(|_| StoreError::CoordinatorClosed)
    }

    /// See [`Coordinator::object`].
    pub async fn object(&self, locator: Locator) -> Result<Option<SyncableObject>, StoreError> {
        self.request(|resp| Command::Object { locator, resp }).await?
    }

    /// See [`Coordinator::objects`].
    pub async fn objects(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<Vec<SyncableObject>, StoreError> {
        let object_type = object_type.to_string();
        let user = user.map(str::to_string);
        self.request(|resp| Command::Objects {
            object_type,
            user,
            resp,
        })
        .await?
    }

    /// See [`Coordinator::syncdata`].
    pub async fn syncdata(&self, locator: Locator) -> Result<Option<Syncdata>, StoreError> {
        self.request(|resp| Command::Syncdata { locator, resp }).await?
    }

    /// See [`Coordinator::save_object`].
    pub async fn save_object(
        &self,
        locator: Locator,
        payload: String,
    ) -> Result<Option<ObjectChange>, StoreError> {
        self.request(|resp| Command::Save {
            locator,
            payload,
            resp,
        })
        .await?
    }

    /// See [`Coordinator::delete_object`].
    pub async fn delete_object(&self, locator: Locator) -> Result<Option<ObjectChange>, StoreError> {
        self.request(|resp| Command::Delete { locator, resp }).await?
    }

    /// See [`Coordinator::acknowledge`].
    pub async fn acknowledge(&self, locator: Locator) -> Result<(), StoreError> {
        self.request(|resp| Command::Acknowledge { locator, resp })
            .await?
    }

    /// See [`Coordinator::acknowledge_many`].
    pub async fn acknowledge_many(
        &self,
        locators: Vec<Locator>,
    ) -> Result<Vec<ObjectError>, StoreError> {
        self.request(|resp| Command::AcknowledgeMany { locators, resp })
            .await
    }

    /// See [`Coordinator::objects_needing_up_sync`].
    pub async fn objects_needing_up_sync(
        &self,
        user: Option<&str>,
        claim: bool,
        max: usize,
    ) -> Result<UpSyncBatch, StoreError> {
        let user = user.map(str::to_string);
        self.request(|resp| Command::NeedingUpSync {
            user,
            claim,
            max,
            resp,
        })
        .await?
    }

    /// See [`Coordinator::release_claims`].
    pub async fn release_claims(&self, locators: Vec<Locator>) -> Result<usize, StoreError> {
        self.request(|resp| Command::ReleaseClaims { locators, resp })
            .await?
    }

    /// See [`Coordinator::defer_claims`].
    pub async fn defer_claims(&self, locators: Vec<Locator>) -> Result<(), StoreError> {
        self.request(|resp| Command::DeferClaims { locators, resp })
            .await?
    }

    /// See [`Coordinator::process_cloud_saved`].
    pub async fn process_cloud_saved(
        &self,
        saved: Vec<SyncableObject>,
    ) -> Result<Reconciled, StoreError> {
        self.request(|resp| Command::CloudSaved { saved, resp }).await
    }

    /// See [`Coordinator::process_cloud_errors`].
    pub async fn process_cloud_errors(
        &self,
        failures: Vec<(Locator, UpSyncFailure)>,
    ) -> Result<Reconciled, StoreError> {
        self.request(|resp| Command::CloudErrors { failures, resp })
            .await
    }

    /// See [`Coordinator::process_fetched`].
    pub async fn process_fetched(
        &self,
        objects: Vec<SyncableObject>,
    ) -> Result<Reconciled, StoreError> {
        self.request(|resp| Command::Fetched { objects, resp }).await
    }

    /// See [`Coordinator::queue_len`].
    pub async fn queue_len(&self, user: Option<&str>) -> Result<usize, StoreError> {
        let user = user.map(str::to_string);
        self.request(|resp| Command::QueueLen { user, resp }).await?
    }

    /// See [`Coordinator::high_water_mark`].
    pub async fn high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
    ) -> Result<u64, StoreError> {
        let object_type = object_type.to_string();
        let user = user.map(str::to_string);
        self.request(|resp| Command::HighWaterMark {
            object_type,
            user,
            resp,
        })
        .await?
    }

    /// See [`Coordinator::save_high_water_mark`].
    pub async fn save_high_water_mark(
        &self,
        object_type: &str,
        user: Option<&str>,
        value: u64,
    ) -> Result<(), StoreError> {
        let object_type = object_type.to_string();
        let user = user.map(str::to_string);
        self.request(|resp| Command::SaveHighWaterMark {
            object_type,
            user,
            value,
            resp,
        })
        .await?
    }

    /// Stop the coordinator task. Commands queued behind the shutdown fail
    /// with [`StoreError::CoordinatorClosed`].
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::MemoryLocalStore;
    use crate::metadata::MemoryMetadataStore;
    use crate::resolver::{RejectResolver, ResolveError};

    struct Fixture {
        coordinator: Coordinator,
        local: MemoryLocalStore,
        metadata: MemoryMetadataStore,
    }

    fn fixture_with(resolver: impl ConflictResolver + 'static) -> Fixture {
        let local = MemoryLocalStore::new();
        let metadata = MemoryMetadataStore::new();
        let coordinator = Coordinator::open(
            Arc::new(local.clone()),
            Arc::new(metadata.clone()),
            Arc::new(resolver),
            RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(3600)),
        )
        .unwrap();
        Fixture {
            coordinator,
            local,
            metadata,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RejectResolver)
    }

    fn note(id: &str) -> Locator {
        Locator::new(id, "Note", Some("alice".into()))
    }

    fn queue(f: &Fixture) -> Vec<Locator> {
        f.metadata.up_sync_queue(Some("alice")).unwrap()
    }

    fn status(f: &Fixture, locator: &Locator) -> SyncStatus {
        f.coordinator.syncdata(locator).unwrap().unwrap().status
    }

    /// A revision written by another device, `offset` seconds from now.
    fn remote_version(locator: &Locator, payload: &str, offset: i64) -> SyncableObject {
        let time = (unix_now() as i64 + offset) as u64;
        SyncableObject::new(
            locator.clone(),
            payload,
            Some(b"server-tag".to_vec()),
            Commit::from_parts("otherdevice", content_hash(payload), time, "remote"),
        )
    }

    fn failed(message: &str, retry_after: Option<Duration>) -> UpSyncFailure {
        UpSyncFailure::from_record_error(
            RecordError::Failed {
                message: message.into(),
                retry_after,
            },
            |_| panic!("not a conflict"),
        )
    }

    /// Save, claim and return the claimed object.
    fn save_and_claim(f: &Fixture, locator: &Locator, payload: &str) -> SyncableObject {
        f.coordinator.save_object(locator, payload).unwrap();
        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        batch
            .objects
            .into_iter()
            .find(|o| &o.locator == locator)
            .unwrap()
    }

    // ===========================================
    // Device identity
    // ===========================================

    #[test]
    fn device_id_is_generated_once() {
        let f = fixture();
        let id = f.coordinator.device_id().to_string();
        assert_eq!(id.len(), objsync_types::hash::DEVICE_ID_LEN);

        let reopened = Coordinator::open(
            Arc::new(f.local.clone()),
            Arc::new(f.metadata.clone()),
            Arc::new(RejectResolver),
            RetryPolicy::default(),
        )
        .unwrap();
        assert_eq!(reopened.device_id(), id);
    }

    // ===========================================
    // Local saves and deletes
    // ===========================================

    #[test]
    fn first_save_creates_and_queues() {
        let f = fixture();
        let locator = note("n1");

        let change = f
            .coordinator
            .save_object(&locator, r#"{"title":"a"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(change.action, ChangeAction::Created);
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(change.commit.device_id(), f.coordinator.device_id());

        assert_eq!(status(&f, &locator), SyncStatus::NeedsUpSync);
        assert_eq!(queue(&f), vec![locator.clone()]);
        assert_eq!(
            f.local.get(&locator).unwrap().as_deref(),
            Some(r#"{"title":"a"}"#)
        );
    }

    #[test]
    fn identical_save_is_a_no_op() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator
            .save_object(&locator, r#"{"a":1,"b":2}"#)
            .unwrap();
        let before = f.coordinator.syncdata(&locator).unwrap().unwrap();

        // same document, different key order
        let change = f.coordinator.save_object(&locator, r#"{"b":2,"a":1}"#).unwrap();
        assert!(change.is_none());
        assert_eq!(f.coordinator.syncdata(&locator).unwrap().unwrap(), before);
    }

    #[test]
    fn second_save_is_a_modification() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, r#"{"v":1}"#).unwrap();
        let change = f
            .coordinator
            .save_object(&locator, r#"{"v":2}"#)
            .unwrap()
            .unwrap();
        assert_eq!(change.action, ChangeAction::Modified);
        assert_eq!(queue(&f).len(), 1);
    }

    #[test]
    fn delete_records_tombstone() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, "{}").unwrap();

        let change = f.coordinator.delete_object(&locator).unwrap().unwrap();
        assert_eq!(change.action, ChangeAction::Deleted);
        assert!(change.commit.is_tombstone());

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert!(syncdata.is_tombstone);
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert_eq!(f.local.get(&locator).unwrap(), None);

        // deleting twice does nothing
        assert!(f.coordinator.delete_object(&locator).unwrap().is_none());
    }

    #[test]
    fn save_after_delete_is_rejected() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, "{}").unwrap();
        f.coordinator.delete_object(&locator).unwrap();

        let result = f.coordinator.save_object(&locator, r#"{"v":1}"#);
        assert!(matches!(result, Err(StoreError::ObjectDeleted(_))));
    }

    #[test]
    fn invalid_json_is_an_encoding_error() {
        let f = fixture();
        let result = f.coordinator.save_object(&note("n1"), "not json");
        assert!(matches!(result, Err(StoreError::Encoding(_))));
    }

    #[test]
    fn unacknowledged_remote_revision_conflicts_with_save() {
        let f = fixture();
        let locator = note("n1");
        // Older revision from another device, never read here
        f.coordinator
            .process_fetched(vec![remote_version(&locator, r#"{"v":1}"#, -100)]);

        let change = f
            .coordinator
            .save_object(&locator, r#"{"v":2}"#)
            .unwrap()
            .unwrap();
        assert_eq!(change.action, ChangeAction::Modified);
        assert_eq!(f.local.get(&locator).unwrap().as_deref(), Some(r#"{"v":2}"#));
    }

    #[test]
    fn newer_unacknowledged_revision_beats_save() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator
            .process_fetched(vec![remote_version(&locator, r#"{"v":1}"#, 1000)]);

        let change = f.coordinator.save_object(&locator, r#"{"v":2}"#).unwrap();
        assert!(change.is_none());
        assert_eq!(f.local.get(&locator).unwrap().as_deref(), Some(r#"{"v":1}"#));
        // the stored revision is now acknowledged by this device
        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.commit.device_id(), f.coordinator.device_id());
        assert_eq!(syncdata.status, SyncStatus::Current);
    }

    #[test]
    fn same_second_unacknowledged_revision_beats_save() {
        let locator = note("n1");
        // retry until the clock does not tick mid-test, so both commits
        // carry the same time
        for _ in 0..5 {
            let f = fixture();
            let start = unix_now();
            f.coordinator
                .process_fetched(vec![remote_version(&locator, r#"{"v":1}"#, 0)]);
            let change = f.coordinator.save_object(&locator, r#"{"v":2}"#).unwrap();
            if unix_now() != start {
                continue;
            }

            assert!(change.is_none());
            assert_eq!(f.local.get(&locator).unwrap().as_deref(), Some(r#"{"v":1}"#));
            assert!(queue(&f).is_empty());
            return;
        }
        panic!("clock kept ticking");
    }

    // ===========================================
    // Reads and acknowledgement
    // ===========================================

    #[test]
    fn read_acknowledges_revision() {
        let f = fixture();
        let locator = note("n1");
        let remote = remote_version(&locator, r#"{"v":1}"#, 0);
        f.coordinator.process_fetched(vec![remote.clone()]);

        let object = f.coordinator.object(&locator).unwrap().unwrap();
        assert_eq!(object.commit, remote.commit);
        assert_eq!(object.commit.device_id(), f.coordinator.device_id());
        assert_eq!(object.metadata, Some(b"server-tag".to_vec()));
    }

    #[test]
    fn deleted_objects_are_not_readable() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, "{}").unwrap();
        f.coordinator.delete_object(&locator).unwrap();
        assert!(f.coordinator.object(&locator).unwrap().is_none());
    }

    #[test]
    fn objects_lists_live_objects_of_type() {
        let f = fixture();
        f.coordinator.save_object(&note("a"), "{}").unwrap();
        f.coordinator.save_object(&note("b"), "{}").unwrap();
        f.coordinator.delete_object(&note("b")).unwrap();
        f.coordinator
            .save_object(&Locator::new("t", "Task", Some("alice".into())), "{}")
            .unwrap();

        let objects = f.coordinator.objects("Note", Some("alice")).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].locator, note("a"));
    }

    #[test]
    fn acknowledge_many_reports_nothing_for_unknown_objects() {
        let f = fixture();
        assert!(f.coordinator.acknowledge_many(&[note("x")]).is_empty());
    }

    // ===========================================
    // Up-sync selection and confirmation
    // ===========================================

    #[test]
    fn claimed_objects_are_not_selected_twice() {
        let f = fixture();
        let locator = note("n1");
        let claimed = save_and_claim(&f, &locator, "{}");
        assert_eq!(claimed.locator, locator);
        assert_eq!(status(&f, &locator), SyncStatus::UpSyncing);

        let again = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        assert!(again.objects.is_empty());
        assert_eq!(again.queued, 1);
    }

    #[test]
    fn selection_is_capped() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            f.coordinator.save_object(&note(id), "{}").unwrap();
        }

        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 2)
            .unwrap();
        assert_eq!(batch.objects.len(), 2);
        assert_eq!(batch.queued, 3);

        let rest = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 2)
            .unwrap();
        assert_eq!(rest.objects.len(), 1);
        assert_eq!(rest.objects[0].locator, note("c"));
    }

    #[test]
    fn peek_does_not_claim() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, "{}").unwrap();
        f.coordinator
            .objects_needing_up_sync(Some("alice"), false, 10)
            .unwrap();
        assert_eq!(status(&f, &locator), SyncStatus::NeedsUpSync);
    }

    #[test]
    fn matching_confirmation_makes_current() {
        let f = fixture();
        let locator = note("n1");
        let mut written = save_and_claim(&f, &locator, "{}");
        written.metadata = Some(b"tag1".to_vec());

        let result = f.coordinator.process_cloud_saved(vec![written]);
        assert!(result.changes.is_empty());
        assert!(result.errors.is_empty());

        assert_eq!(status(&f, &locator), SyncStatus::Current);
        assert!(queue(&f).is_empty());
        assert_eq!(
            f.metadata.remote_metadata(&locator).unwrap(),
            Some(b"tag1".to_vec())
        );
    }

    #[test]
    fn edit_during_upload_survives_confirmation() {
        let f = fixture();
        let locator = note("n1");
        let written = save_and_claim(&f, &locator, r#"{"v":1}"#);

        // local edit while the batch is in flight
        f.coordinator.save_object(&locator, r#"{"v":2}"#).unwrap();
        f.coordinator.process_cloud_saved(vec![written]);

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert_eq!(queue(&f), vec![locator.clone()]);
        assert_eq!(f.local.get(&locator).unwrap().as_deref(), Some(r#"{"v":2}"#));
    }

    #[test]
    fn release_and_recover_return_claims() {
        let f = fixture();
        let a = note("a");
        let b = note("b");
        save_and_claim(&f, &a, "{}");
        save_and_claim(&f, &b, "{}");

        assert_eq!(f.coordinator.release_claims(&[a.clone()]).unwrap(), 1);
        assert_eq!(status(&f, &a), SyncStatus::NeedsUpSync);

        assert_eq!(f.coordinator.recover(&["Note"], Some("alice")).unwrap(), 1);
        assert_eq!(status(&f, &b), SyncStatus::NeedsUpSync);
    }

    #[test]
    fn recover_requeues_pending_objects_missing_from_queue() {
        let f = fixture();
        let pending = note("pending");
        let claimed = note("claimed");
        let synced = note("synced");
        f.coordinator.save_object(&pending, "{}").unwrap();
        save_and_claim(&f, &claimed, "{}");
        let written = save_and_claim(&f, &synced, "{}");
        f.coordinator.process_cloud_saved(vec![written]);

        // queue lost, e.g. by a crash between the two metadata writes
        f.metadata.put_up_sync_queue(Some("alice"), &[]).unwrap();

        // unregistered types are left alone
        assert_eq!(f.coordinator.recover(&["Task"], Some("alice")).unwrap(), 0);
        assert!(queue(&f).is_empty());

        assert_eq!(f.coordinator.recover(&["Note"], Some("alice")).unwrap(), 2);
        let mut queued = queue(&f);
        queued.sort();
        assert_eq!(queued, vec![claimed.clone(), pending]);
        assert_eq!(status(&f, &claimed), SyncStatus::NeedsUpSync);
        assert_eq!(status(&f, &synced), SyncStatus::Current);

        // nothing left to repair
        assert_eq!(f.coordinator.recover(&["Note"], Some("alice")).unwrap(), 0);
    }

    #[test]
    fn queued_object_without_payload_is_dropped_once() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, "{}").unwrap();
        f.local.delete(&locator).unwrap();

        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        assert!(batch.objects.is_empty());
        assert_eq!(batch.queued, 0);
        assert_eq!(batch.errors.len(), 1);
        assert!(matches!(
            *batch.errors[0].error,
            StoreError::MissingLocalObject(_)
        ));
        assert!(queue(&f).is_empty());

        let again = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        assert!(again.errors.is_empty());

        // recovery does not put it back either
        assert_eq!(f.coordinator.recover(&["Note"], Some("alice")).unwrap(), 0);
    }

    #[test]
    fn deferred_claims_wait_for_ceiling() {
        let f = fixture();
        let locator = note("n1");
        save_and_claim(&f, &locator, "{}");

        f.coordinator.defer_claims(&[locator.clone()]).unwrap();
        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert!(syncdata.retry_after.unwrap() >= unix_now() + 3600);
        assert!(!syncdata.should_retry());
    }

    // ===========================================
    // Up-sync failures
    // ===========================================

    #[test]
    fn transient_failure_schedules_retry() {
        let f = fixture();
        let locator = note("n1");
        save_and_claim(&f, &locator, "{}");

        let result = f.coordinator.process_cloud_errors(vec![(
            locator.clone(),
            failed("busy", None),
        )]);
        assert_eq!(result.errors.len(), 1);

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert_eq!(syncdata.retries, 1);
        assert!(syncdata.retry_after.unwrap() >= unix_now() + 59);
        assert!(syncdata.should_retry_at(syncdata.retry_after.unwrap() + 1));

        // not selected until the delay passes
        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        assert!(batch.objects.is_empty());
        assert_eq!(batch.queued, 1);
    }

    #[test]
    fn remote_retry_hint_is_honoured() {
        let f = fixture();
        let locator = note("n1");
        save_and_claim(&f, &locator, "{}");
        let before = unix_now();

        f.coordinator.process_cloud_errors(vec![(
            locator.clone(),
            failed("throttled", Some(Duration::from_secs(600))),
        )]);

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert!(syncdata.retry_after.unwrap() >= before + 600);
    }

    #[test]
    fn unknown_record_clears_metadata_and_requeues() {
        let f = fixture();
        let locator = note("n1");
        let mut written = save_and_claim(&f, &locator, "{}");
        written.metadata = Some(b"tag1".to_vec());
        f.coordinator.process_cloud_saved(vec![written]);
        save_and_claim(&f, &locator, r#"{"v":2}"#);

        let result = f
            .coordinator
            .process_cloud_errors(vec![(locator.clone(), UpSyncFailure::UnknownRecord)]);
        assert_eq!(result.errors.len(), 1);

        assert_eq!(f.metadata.remote_metadata(&locator).unwrap(), None);
        assert_eq!(status(&f, &locator), SyncStatus::NeedsUpSync);
        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), false, 10)
            .unwrap();
        assert_eq!(batch.objects.len(), 1);
        assert_eq!(batch.objects[0].metadata, None);
    }

    #[test]
    fn record_errors_are_classified() {
        let locator = note("n1");
        let server = remote_version(&locator, r#"{"v":"cloud"}"#, 10);
        let record = RemoteRecord {
            id: crate::remote::RecordId::new("Note", "n1"),
            payload: server.payload.clone(),
            tombstone: false,
            commit: server.commit.to_string(),
            system_fields: None,
            modified_at: Some(1),
        };

        let conflict = UpSyncFailure::from_record_error(
            RecordError::Conflict {
                server_record: Box::new(record.clone()),
            },
            |_| Ok(server.clone()),
        );
        assert!(matches!(conflict, UpSyncFailure::Conflict { server: s } if s == server));

        let undecodable = UpSyncFailure::from_record_error(
            RecordError::Conflict {
                server_record: Box::new(record),
            },
            |_| Err(StoreError::UnknownType("Note".into())),
        );
        assert!(matches!(
            undecodable,
            UpSyncFailure::Transient {
                retry_after: None,
                ..
            }
        ));

        let unknown =
            UpSyncFailure::from_record_error(RecordError::UnknownRecord, |_| Ok(server.clone()));
        assert!(matches!(unknown, UpSyncFailure::UnknownRecord));

        let hint = Some(Duration::from_secs(5));
        assert!(matches!(
            failed("busy", hint),
            UpSyncFailure::Transient { retry_after, .. } if retry_after == hint
        ));
    }

    #[test]
    fn conflict_newer_cloud_wins() {
        let f = fixture();
        let locator = note("n1");
        save_and_claim(&f, &locator, r#"{"v":"local"}"#);
        let server = remote_version(&locator, r#"{"v":"cloud"}"#, 1000);

        let result = f.coordinator.process_cloud_errors(vec![(
            locator.clone(),
            UpSyncFailure::Conflict {
                server: server.clone(),
            },
        )]);

        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].action, ChangeAction::Modified);
        assert_eq!(result.changes[0].origin, ChangeOrigin::Cloud);

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.status, SyncStatus::Current);
        assert_eq!(syncdata.commit, server.commit);
        assert_eq!(
            f.local.get(&locator).unwrap().as_deref(),
            Some(r#"{"v":"cloud"}"#)
        );
        assert!(queue(&f).is_empty());
    }

    #[test]
    fn conflict_newer_local_wins_and_requeues() {
        let f = fixture();
        let locator = note("n1");
        let written = save_and_claim(&f, &locator, r#"{"v":"local"}"#);
        let server = remote_version(&locator, r#"{"v":"cloud"}"#, -1000);

        let result = f.coordinator.process_cloud_errors(vec![(
            locator.clone(),
            UpSyncFailure::Conflict { server },
        )]);
        assert!(result.changes.is_empty());

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert_eq!(syncdata.commit, written.commit);
        assert_eq!(
            f.local.get(&locator).unwrap().as_deref(),
            Some(r#"{"v":"local"}"#)
        );
        // next attempt carries the server's bookkeeping
        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), false, 10)
            .unwrap();
        assert_eq!(batch.objects[0].metadata, Some(b"server-tag".to_vec()));
    }

    #[test]
    fn conflict_cloud_tombstone_deletes_local() {
        let f = fixture();
        let locator = note("n1");
        save_and_claim(&f, &locator, "{}");
        let server = SyncableObject::tombstone(
            locator.clone(),
            None,
            Commit::from_parts("other", TOMBSTONE_HASH, 1, "gone"),
        );

        let result = f
            .coordinator
            .process_cloud_errors(vec![(locator.clone(), UpSyncFailure::Conflict { server })]);
        assert_eq!(result.changes[0].action, ChangeAction::Deleted);
        assert_eq!(result.changes[0].origin, ChangeOrigin::Cloud);
        assert_eq!(f.local.get(&locator).unwrap(), None);
        assert!(f.coordinator.syncdata(&locator).unwrap().unwrap().is_tombstone);
    }

    #[test]
    fn conflict_local_tombstone_wins_over_newer_cloud() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, "{}").unwrap();
        f.coordinator.delete_object(&locator).unwrap();
        f.coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        let server = remote_version(&locator, r#"{"v":"cloud"}"#, 1000);

        let result = f
            .coordinator
            .process_cloud_errors(vec![(locator.clone(), UpSyncFailure::Conflict { server })]);
        assert!(result.changes.is_empty());

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert!(syncdata.is_tombstone);
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert_eq!(f.local.get(&locator).unwrap(), None);
    }

    #[test]
    fn resolver_merge_is_requeued_with_fresh_commit() {
        let merge = |_: &SyncableObject,
                     local: &SyncableObject|
         -> Result<SyncableObject, ResolveError> {
            Ok(SyncableObject::new(
                local.locator.clone(),
                r#"{"v":"merged"}"#,
                None,
                Commit::resolve(),
            ))
        };
        let f = fixture_with(merge);
        let locator = note("n1");
        save_and_claim(&f, &locator, r#"{"v":"local"}"#);
        let server = remote_version(&locator, r#"{"v":"cloud"}"#, 0);

        let result = f
            .coordinator
            .process_cloud_errors(vec![(locator.clone(), UpSyncFailure::Conflict { server })]);
        assert_eq!(result.changes[0].action, ChangeAction::Modified);
        assert_eq!(result.changes[0].origin, ChangeOrigin::Local);

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert!(!syncdata.commit.is_placeholder());
        assert_eq!(syncdata.commit.hash(), content_hash(r#"{"v":"merged"}"#));
        assert_eq!(queue(&f), vec![locator]);
    }

    #[test]
    fn resolver_returning_wrong_locator_is_an_object_error() {
        let wrong = |_: &SyncableObject,
                     _: &SyncableObject|
         -> Result<SyncableObject, ResolveError> {
            Ok(SyncableObject::new(
                Locator::new("other", "Note", None),
                "{}",
                None,
                Commit::resolve(),
            ))
        };
        let f = fixture_with(wrong);
        let locator = note("n1");
        save_and_claim(&f, &locator, "{}");
        let server = remote_version(&locator, r#"{"v":1}"#, 0);

        let result = f
            .coordinator
            .process_cloud_errors(vec![(locator.clone(), UpSyncFailure::Conflict { server })]);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(*result.errors[0].error, StoreError::Conflict(_)));
    }

    // ===========================================
    // Down-sync reconciliation
    // ===========================================

    #[test]
    fn fetched_new_object_is_created() {
        let f = fixture();
        let locator = note("n1");
        let result = f
            .coordinator
            .process_fetched(vec![remote_version(&locator, r#"{"v":1}"#, 0)]);

        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].action, ChangeAction::Created);
        assert_eq!(result.changes[0].origin, ChangeOrigin::Cloud);
        assert_eq!(status(&f, &locator), SyncStatus::Current);
        assert!(queue(&f).is_empty());
    }

    #[test]
    fn refetching_same_revision_is_silent() {
        let f = fixture();
        let locator = note("n1");
        let remote = remote_version(&locator, r#"{"v":1}"#, 0);
        f.coordinator.process_fetched(vec![remote.clone()]);
        f.local.delete(&locator).unwrap();

        let result = f.coordinator.process_fetched(vec![remote]);
        assert!(result.changes.is_empty());
        // no payload write happened
        assert_eq!(f.local.get(&locator).unwrap(), None);
    }

    #[test]
    fn fetched_tombstone_for_unknown_object_is_recorded_only() {
        let f = fixture();
        let locator = note("n1");
        let tombstone = SyncableObject::tombstone(
            locator.clone(),
            None,
            Commit::from_parts("other", "x", 5, "gone"),
        );

        let result = f.coordinator.process_fetched(vec![tombstone]);
        assert!(result.changes.is_empty());
        assert!(f.coordinator.syncdata(&locator).unwrap().unwrap().is_tombstone);
        assert!(f.local.is_empty());
    }

    #[test]
    fn fetched_update_overwrites_current_object() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator
            .process_fetched(vec![remote_version(&locator, r#"{"v":1}"#, 0)]);

        let update = remote_version(&locator, r#"{"v":2}"#, 10);
        let result = f.coordinator.process_fetched(vec![update.clone()]);
        assert_eq!(result.changes[0].action, ChangeAction::Modified);
        assert_eq!(f.local.get(&locator).unwrap().as_deref(), Some(r#"{"v":2}"#));
        assert_eq!(
            f.coordinator.syncdata(&locator).unwrap().unwrap().commit,
            update.commit
        );
    }

    #[test]
    fn fetched_update_defers_to_pending_edit() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator.save_object(&locator, r#"{"v":"mine"}"#).unwrap();

        let result = f
            .coordinator
            .process_fetched(vec![remote_version(&locator, r#"{"v":"theirs"}"#, 10)]);
        assert!(result.changes.is_empty());
        assert_eq!(
            f.local.get(&locator).unwrap().as_deref(),
            Some(r#"{"v":"mine"}"#)
        );
    }

    #[test]
    fn fetched_tombstone_deletes_local_object() {
        let f = fixture();
        let locator = note("n1");
        f.coordinator
            .process_fetched(vec![remote_version(&locator, r#"{"v":1}"#, 0)]);

        let tombstone = SyncableObject::tombstone(
            locator.clone(),
            None,
            Commit::from_parts("other", "x", 5, "gone"),
        );
        let result = f.coordinator.process_fetched(vec![tombstone]);
        assert_eq!(result.changes[0].action, ChangeAction::Deleted);
        assert_eq!(f.local.get(&locator).unwrap(), None);
        assert_eq!(f.metadata.remote_metadata(&locator).unwrap(), None);
    }

    #[test]
    fn remote_resurrection_keeps_local_tombstone() {
        let f = fixture();
        let locator = note("n1");
        // delete confirmed by the remote
        f.coordinator.save_object(&locator, "{}").unwrap();
        f.coordinator.delete_object(&locator).unwrap();
        let batch = f
            .coordinator
            .objects_needing_up_sync(Some("alice"), true, 10)
            .unwrap();
        f.coordinator.process_cloud_saved(batch.objects);
        assert_eq!(status(&f, &locator), SyncStatus::Current);

        // an older live revision shows up
        let result = f
            .coordinator
            .process_fetched(vec![remote_version(&locator, "{}", -1000)]);
        assert!(result.changes.is_empty());

        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert!(syncdata.is_tombstone);
        assert_eq!(syncdata.status, SyncStatus::NeedsUpSync);
        assert_eq!(queue(&f), vec![locator.clone()]);
        assert_eq!(
            f.metadata.remote_metadata(&locator).unwrap(),
            Some(b"server-tag".to_vec())
        );
    }

    #[test]
    fn fetched_object_with_placeholder_commit_gets_real_one() {
        let f = fixture();
        let locator = note("n1");
        let fetched = SyncableObject::new(locator.clone(), "{}", None, Commit::empty());

        f.coordinator.process_fetched(vec![fetched]);
        let syncdata = f.coordinator.syncdata(&locator).unwrap().unwrap();
        assert!(!syncdata.commit.is_placeholder());
    }

    // ===========================================
    // High-water marks
    // ===========================================

    #[test]
    fn high_water_mark_defaults_to_zero() {
        let f = fixture();
        assert_eq!(f.coordinator.high_water_mark("Note", Some("alice")).unwrap(), 0);
        f.coordinator
            .save_high_water_mark("Note", Some("alice"), 42)
            .unwrap();
        assert_eq!(f.coordinator.high_water_mark("Note", Some("alice")).unwrap(), 42);
        assert_eq!(f.coordinator.high_water_mark("Note", None).unwrap(), 0);
    }

    // ===========================================
    // Actor handle
    // ===========================================

    #[tokio::test]
    async fn handle_round_trips_commands() {
        let f = fixture();
        let device_id = f.coordinator.device_id().to_string();
        let (handle, task) = CoordinatorHandle::spawn(f.coordinator);
        assert_eq!(handle.device_id(), device_id);

        let locator = note("n1");
        let change = handle
            .save_object(locator.clone(), r#"{"v":1}"#.into())
            .await
            .unwrap();
        assert!(change.is_some());

        let batch = handle
            .objects_needing_up_sync(Some("alice"), true, 10)
            .await
            .unwrap();
        assert_eq!(batch.objects.len(), 1);
        handle.process_cloud_saved(batch.objects).await.unwrap();
        assert_eq!(handle.queue_len(Some("alice")).await.unwrap(), 0);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(matches!(
            handle.object(locator).await,
            Err(StoreError::CoordinatorClosed)
        ));
    }
}
