//! The synced object store.
//!
//! [`SyncedObjectStore`] is the application-facing entry point. It offers a
//! typed API over the coordinator and drives the two sync cycles:
//!
//! - **Up-sync**: claim queued objects, map them to records, write them in
//!   one batch and route the per-record results back to the coordinator.
//! - **Down-sync**: for every registered type, fetch records changed after
//!   the stored high-water mark, reconcile them and advance the mark.
//!
//! Only one cycle runs at a time. A cycle that finds another in progress
//! returns [`SyncOutcome::Skipped`] instead of waiting.
//!
//! ## Example
//!
//! ```ignore
//! use objsync_client::{MemoryRemote, StoreConfig, SyncSettings, SyncedObjectStore};
//!
//! let config = StoreConfig::new(SyncSettings::default()).with_type::<Note>("Note");
//! let store = SyncedObjectStore::open(config, Arc::new(MemoryRemote::with_user("alice"))).await?;
//!
//! store.save("n1", "Note", &Note { title: "hello".into() }).await?;
//! let note: Option<Note> = store.object("n1", "Note").await?;
//! ```

use crate::config::{Scope, StoreConfig, SyncSettings};
use crate::coordinator::{Coordinator, CoordinatorHandle, Reconciled, UpSyncFailure};
use crate::error::{ObjectError, StoreError};
use crate::registry::{RegisteredType, TypeRegistry};
use crate::remote::{RecordId, RemoteError, RemoteRecord, RemoteStore};
use objsync_core::HighWaterMark;
use objsync_types::hash::canonical_json;
use objsync_types::{Locator, ObjectChange, SyncableObject, Syncdata};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Capacity of the change and error broadcast channels.
const EVENT_BUFFER: usize = 64;

/// Counts from one completed sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Published object changes.
    pub changes: usize,
    /// Published object errors.
    pub errors: usize,
}

impl SyncReport {
    fn add(&mut self, other: SyncReport) {
        self.changes += other.changes;
        self.errors += other.errors;
    }
}

/// Result of requesting a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The cycle ran.
    Completed(SyncReport),
    /// Another cycle was already running.
    Skipped,
}

/// A local object store kept in sync with a remote store.
pub struct SyncedObjectStore {
    identifier: String,
    settings: SyncSettings,
    types: TypeRegistry,
    remote: Arc<dyn RemoteStore>,
    coordinator: CoordinatorHandle,
    /// User bound at open (private scope only).
    user: Option<String>,
    /// User the remote reported when the binding broke.
    mismatch: OnceLock<Option<String>>,
    /// Held for the duration of one sync cycle.
    gate: Mutex<()>,
    needs_up_sync: AtomicBool,
    nudge: Arc<Notify>,
    changes: broadcast::Sender<Vec<ObjectChange>>,
    errors: broadcast::Sender<Vec<ObjectError>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncedObjectStore {
    /// Open a store.
    ///
    /// In the private scope the remote's signed-in user is captured here and
    /// every later sync cycle checks it is unchanged.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings, when no user is signed in for a private
    /// store, or when persisted sync state cannot be read.
    pub async fn open(
        config: StoreConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<Self>, StoreError> {
        config.settings.validate()?;
        let identifier = config.identifier();

        let user = match config.settings.scope {
            Scope::Private => Some(
                remote
                    .current_user()
                    .await?
                    .ok_or(RemoteError::NotAuthenticated)?,
            ),
            Scope::Public => None,
        };

        let (local, metadata) = config.stores();
        let coordinator = Coordinator::open(
            local,
            metadata,
            Arc::clone(&config.resolver),
            config.settings.retry_policy(),
        )?;
        let names: Vec<&str> = config.types.names().collect();
        coordinator.recover(&names, user.as_deref())?;
        let pending = coordinator.queue_len(user.as_deref())?;
        let (coordinator, coordinator_task) = CoordinatorHandle::spawn(coordinator);

        let (changes, _) = broadcast::channel(EVENT_BUFFER);
        let (errors, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::new(Self {
            identifier,
            settings: config.settings,
            types: config.types,
            remote,
            coordinator,
            user,
            mismatch: OnceLock::new(),
            gate: Mutex::new(()),
            needs_up_sync: AtomicBool::new(pending > 0),
            nudge: Arc::new(Notify::new()),
            changes,
            errors,
            shutdown_tx,
            tasks: Mutex::new(vec![coordinator_task]),
        });

        if config.background_sync {
            let scheduler = tokio::spawn(run_scheduler(
                Arc::downgrade(&store),
                Arc::clone(&store.nudge),
                shutdown_rx,
                store.settings.up_sync_interval(),
                store.settings.down_sync_interval(),
            ));
            store.tasks.lock().await.push(scheduler);
        }

        tracing::info!(
            "Opened store {} ({} types, {} queued, user {:?})",
            store.identifier,
            store.types.len(),
            pending,
            store.user
        );
        Ok(store)
    }

    /// Store identifier derived from container and scope.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// This installation's device id.
    pub fn device_id(&self) -> &str {
        self.coordinator.device_id()
    }

    /// User the store is bound to, if private.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Settings the store was opened with.
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Locator for an object of this store.
    pub fn locator(&self, id: &str, object_type: &str) -> Locator {
        Locator::new(id, object_type, self.user.clone())
    }

    /// Receive batches of object changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Vec<ObjectChange>> {
        self.changes.subscribe()
    }

    /// Receive batches of per-object errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Vec<ObjectError>> {
        self.errors.subscribe()
    }

    // =========================================================================
    // Object API
    // =========================================================================

    /// Save `value` as object `id` of `object_type`.
    ///
    /// Returns the recorded change, or `None` when the stored payload was
    /// already identical.
    pub async fn save<T: Serialize + 'static>(
        &self,
        id: &str,
        object_type: &str,
        value: &T,
    ) -> Result<Option<ObjectChange>, StoreError> {
        self.check_identity()?;
        self.types.check::<T>(object_type)?;
        let payload = canonical_json(value)?;

        let change = self
            .coordinator
            .save_object(self.locator(id, object_type), payload)
            .await?;
        if let Some(change) = &change {
            self.publish_changes(vec![change.clone()]);
            self.request_up_sync();
        }
        Ok(change)
    }

    /// Delete object `id` of `object_type`.
    pub async fn delete(
        &self,
        id: &str,
        object_type: &str,
    ) -> Result<Option<ObjectChange>, StoreError> {
        self.check_identity()?;
        self.types.get(object_type)?;

        let change = self
            .coordinator
            .delete_object(self.locator(id, object_type))
            .await?;
        if let Some(change) = &change {
            self.publish_changes(vec![change.clone()]);
            self.request_up_sync();
        }
        Ok(change)
    }

    /// Read object `id` of `object_type`, acknowledging its revision.
    pub async fn object<T: DeserializeOwned + 'static>(
        &self,
        id: &str,
        object_type: &str,
    ) -> Result<Option<T>, StoreError> {
        self.check_identity()?;
        self.types.check::<T>(object_type)?;

        match self.coordinator.object(self.locator(id, object_type)).await? {
            Some(object) => Ok(Some(object.decode()?)),
            None => Ok(None),
        }
    }

    /// Read every live object of `object_type` as `(id, value)` pairs.
    pub async fn objects<T: DeserializeOwned + 'static>(
        &self,
        object_type: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        self.check_identity()?;
        self.types.check::<T>(object_type)?;

        self.coordinator
            .objects(object_type, self.user.as_deref())
            .await?
            .into_iter()
            .map(|object| -> Result<(String, T), StoreError> {
                Ok((object.locator.id.clone(), object.decode()?))
            })
            .collect()
    }

    /// Fetch object `id` from the remote, reconcile it, then read it
    /// locally. A remote failure falls back to the local copy.
    pub async fn fetch_object<T: DeserializeOwned + 'static>(
        &self,
        id: &str,
        object_type: &str,
    ) -> Result<Option<T>, StoreError> {
        self.check_identity()?;
        let registered = self.types.check::<T>(object_type)?;
        let locator = self.locator(id, object_type);

        match self.remote.fetch_by_id(&RecordId::for_locator(&locator)).await {
            Ok(Some(record)) => {
                let (objects, errors) = self.decode_records(registered, vec![record]);
                let mut reconciled = self.coordinator.process_fetched(objects).await?;
                reconciled.errors.extend(errors);
                self.publish(reconciled);
            }
            Ok(None) => tracing::debug!("{} not found remotely", locator),
            Err(e) => tracing::warn!("Fetching {} failed, using local copy: {}", locator, e),
        }

        self.object(id, object_type).await
    }

    /// Sync state of object `id` of `object_type`.
    pub async fn syncdata(
        &self,
        id: &str,
        object_type: &str,
    ) -> Result<Option<Syncdata>, StoreError> {
        self.check_identity()?;
        self.coordinator
            .syncdata(self.locator(id, object_type))
            .await
    }

    /// Attribute an object's current revision to this device.
    pub async fn acknowledge(&self, locator: &Locator) -> Result<(), StoreError> {
        self.check_identity()?;
        self.coordinator.acknowledge(locator.clone()).await
    }

    /// Acknowledge several objects, returning per-object failures.
    pub async fn acknowledge_objects(
        &self,
        locators: &[Locator],
    ) -> Result<Vec<ObjectError>, StoreError> {
        self.check_identity()?;
        self.coordinator.acknowledge_many(locators.to_vec()).await
    }

    // =========================================================================
    // Sync cycles
    // =========================================================================

    /// Run an up-sync cycle followed by a down-sync cycle.
    pub async fn sync(&self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();
        for outcome in [self.up_sync().await?, self.down_sync().await?] {
            if let SyncOutcome::Completed(cycle) = outcome {
                report.add(cycle);
            }
        }
        Ok(report)
    }

    /// Write one batch of queued objects to the remote.
    pub async fn up_sync(&self) -> Result<SyncOutcome, StoreError> {
        self.check_identity()?;
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("Sync in progress, skipping up-sync");
            return Ok(SyncOutcome::Skipped);
        };
        self.confirm_user().await?;

        // Saves made during the cycle set the hint again
        self.needs_up_sync.store(false, Ordering::SeqCst);
        let result = self.run_up_sync().await;
        let queued = self.coordinator.queue_len(self.user.as_deref()).await?;
        self.needs_up_sync.fetch_or(queued > 0, Ordering::SeqCst);

        result.map(SyncOutcome::Completed)
    }

    async fn run_up_sync(&self) -> Result<SyncReport, StoreError> {
        let batch = self
            .coordinator
            .objects_needing_up_sync(self.user.as_deref(), true, self.settings.batch_size)
            .await?;
        let mut errors = batch.errors;
        if batch.objects.is_empty() {
            return Ok(self.publish(Reconciled {
                changes: Vec::new(),
                errors,
            }));
        }
        tracing::info!(
            "Up-syncing {} of {} queued objects",
            batch.objects.len(),
            batch.queued
        );

        let mut unmappable = Vec::new();
        let mut pending: HashMap<RecordId, SyncableObject> = HashMap::new();
        let mut records = Vec::new();
        for object in batch.objects {
            match self.encode(&object) {
                Ok(record) => {
                    pending.insert(record.id.clone(), object);
                    records.push(record);
                }
                Err(e) => {
                    tracing::warn!("Cannot encode {}: {}", object.locator, e);
                    errors.push(ObjectError::new(object.locator.clone(), e));
                    unmappable.push(object.locator);
                }
            }
        }
        if !unmappable.is_empty() {
            self.coordinator.defer_claims(unmappable).await?;
        }
        if records.is_empty() {
            return Ok(self.publish(Reconciled {
                changes: Vec::new(),
                errors,
            }));
        }

        let results = match self.remote.save_batch(records).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("Batch write failed: {}", e);
                let locators: Vec<Locator> = pending.into_values().map(|o| o.locator).collect();
                self.coordinator.release_claims(locators.clone()).await?;
                errors.extend(
                    locators
                        .into_iter()
                        .map(|locator| ObjectError::new(locator, e.clone())),
                );
                self.publish(Reconciled {
                    changes: Vec::new(),
                    errors,
                });
                return Err(e.into());
            }
        };

        let mut saved = Vec::new();
        let mut failures = Vec::new();
        for (id, result) in results {
            let Some(mut object) = pending.remove(&id) else {
                tracing::warn!("Remote answered for unrequested record {}", id);
                continue;
            };
            match result {
                Ok(record) => {
                    object.metadata = record.system_fields;
                    saved.push(object);
                }
                Err(e) => {
                    let object_type = &object.locator.object_type;
                    let failure = UpSyncFailure::from_record_error(e, |server_record| {
                        self.decode_server_record(object_type, server_record)
                    });
                    failures.push((object.locator, failure));
                }
            }
        }

        if !pending.is_empty() {
            tracing::warn!("Remote skipped {} records, releasing them", pending.len());
            let skipped = pending.into_values().map(|o| o.locator).collect();
            self.coordinator.release_claims(skipped).await?;
        }

        tracing::debug!("{} written, {} rejected", saved.len(), failures.len());
        let mut reconciled = self.coordinator.process_cloud_saved(saved).await?;
        reconciled.extend(self.coordinator.process_cloud_errors(failures).await?);
        errors.append(&mut reconciled.errors);
        reconciled.errors = errors;
        Ok(self.publish(reconciled))
    }

    /// Fetch and reconcile remote changes for every registered type.
    pub async fn down_sync(&self) -> Result<SyncOutcome, StoreError> {
        self.check_identity()?;
        let Ok(_guard) = self.gate.try_lock() else {
            tracing::debug!("Sync in progress, skipping down-sync");
            return Ok(SyncOutcome::Skipped);
        };
        self.confirm_user().await?;

        let mut report = SyncReport::default();
        let names: Vec<String> = self.types.names().map(str::to_string).collect();
        for object_type in names {
            report.add(self.down_sync_type(&object_type).await?);
        }
        Ok(SyncOutcome::Completed(report))
    }

    async fn down_sync_type(&self, object_type: &str) -> Result<SyncReport, StoreError> {
        let user = self.user.as_deref();
        let registered = self.types.get(object_type)?;
        let limit = self.settings.batch_size;

        let mut mark = HighWaterMark::new(self.coordinator.high_water_mark(object_type, user).await?);
        let mut report = SyncReport::default();
        let mut page = self
            .remote
            .fetch_since(object_type, mark.since(), limit)
            .await?;

        loop {
            mark.observe(page.max_modified);
            for record in &page.records {
                mark.observe(record.modified_at);
            }

            let cursor = page.cursor.take();
            if !page.records.is_empty() {
                tracing::debug!("Fetched {} {} records", page.records.len(), object_type);
                let (objects, errors) = self.decode_records(registered, page.records);
                let mut reconciled = self.coordinator.process_fetched(objects).await?;
                reconciled.errors.extend(errors);
                report.add(self.publish(reconciled));
            }

            match cursor {
                Some(cursor) => page = self.remote.fetch_continuing(&cursor, limit).await?,
                None => break,
            }
        }

        if let Some(value) = mark.commit() {
            self.coordinator
                .save_high_water_mark(object_type, user, value)
                .await?;
            tracing::debug!("{} high-water mark now {}", object_type, value);
        }
        Ok(report)
    }

    /// Stop background sync and the coordinator. Later calls fail with
    /// [`StoreError::CoordinatorClosed`].
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.coordinator.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Store task ended abnormally: {}", e);
            }
        }
        tracing::info!("Store {} shut down", self.identifier);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn encode(&self, object: &SyncableObject) -> Result<RemoteRecord, StoreError> {
        let registered = self.types.get(&object.locator.object_type)?;
        Ok(registered.mapping().to_record(object)?)
    }

    fn decode_server_record(
        &self,
        object_type: &str,
        record: &RemoteRecord,
    ) -> Result<SyncableObject, StoreError> {
        let registered = self.types.get(object_type)?;
        Ok(registered
            .mapping()
            .from_record(record, self.user.as_deref())?)
    }

    /// Map fetched records, setting aside those that do not decode as the
    /// registered type.
    fn decode_records(
        &self,
        registered: &RegisteredType,
        records: Vec<RemoteRecord>,
    ) -> (Vec<SyncableObject>, Vec<ObjectError>) {
        let user = self.user.as_deref();
        let mut objects = Vec::with_capacity(records.len());
        let mut errors = Vec::new();

        for record in records {
            let decoded = registered
                .mapping()
                .from_record(&record, user)
                .map_err(StoreError::from)
                .and_then(|object| {
                    if !object.is_tombstone {
                        registered.validate(&object.payload)?;
                    }
                    Ok(object)
                });
            match decoded {
                Ok(object) => objects.push(object),
                Err(e) => {
                    tracing::warn!("Skipping undecodable record {}: {}", record.id, e);
                    errors.push(ObjectError::new(record.id.locator(user), e));
                }
            }
        }
        (objects, errors)
    }

    fn request_up_sync(&self) {
        self.needs_up_sync.store(true, Ordering::SeqCst);
        self.nudge.notify_one();
    }

    fn publish_changes(&self, changes: Vec<ObjectChange>) {
        if !changes.is_empty() {
            // No receivers is fine
            let _ = self.changes.send(changes);
        }
    }

    fn publish(&self, reconciled: Reconciled) -> SyncReport {
        let report = SyncReport {
            changes: reconciled.changes.len(),
            errors: reconciled.errors.len(),
        };
        self.publish_changes(reconciled.changes);
        if !reconciled.errors.is_empty() {
            let _ = self.errors.send(reconciled.errors);
        }
        report
    }

    fn check_identity(&self) -> Result<(), StoreError> {
        match self.mismatch.get() {
            Some(actual) => Err(StoreError::UserMismatch {
                expected: self.user.clone(),
                actual: actual.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Check the remote still reports the user bound at open. A mismatch
    /// is latched.
    async fn confirm_user(&self) -> Result<(), StoreError> {
        if self.settings.scope == Scope::Public {
            return Ok(());
        }
        let actual = self.remote.current_user().await?;
        if actual != self.user {
            tracing::error!(
                "Signed-in user changed from {:?} to {:?}, sync disabled",
                self.user,
                actual
            );
            let _ = self.mismatch.set(actual);
        }
        self.check_identity()
    }
}

enum Trigger {
    UpSyncTimer,
    UpSyncRequested,
    DownSync,
}

/// Background loop driving both sync cycles until shutdown or until the
/// store is dropped.
async fn run_scheduler(
    store: Weak<SyncedObjectStore>,
    nudge: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    up_sync_interval: Duration,
    down_sync_interval: Duration,
) {
    let mut up_timer = tokio::time::interval(up_sync_interval);
    let mut down_timer = tokio::time::interval(down_sync_interval);
    up_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    down_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(
        "Sync scheduler started (up-sync every {:?}, down-sync every {:?})",
        up_sync_interval,
        down_sync_interval
    );

    loop {
        let trigger = tokio::select! {
            _ = shutdown.changed() => break,
            _ = nudge.notified() => Trigger::UpSyncRequested,
            _ = up_timer.tick() => Trigger::UpSyncTimer,
            _ = down_timer.tick() => Trigger::DownSync,
        };

        let Some(store) = store.upgrade() else {
            break;
        };

        let result = match trigger {
            Trigger::UpSyncTimer if !store.needs_up_sync.load(Ordering::SeqCst) => continue,
            Trigger::UpSyncTimer | Trigger::UpSyncRequested => store.up_sync().await,
            Trigger::DownSync => store.down_sync().await,
        };

        match result {
            Err(StoreError::UserMismatch { .. }) => {
                tracing::error!("Stopping background sync for {}", store.identifier);
                break;
            }
            Err(e) => tracing::warn!("Background sync failed: {}", e),
            Ok(_) => {}
        }
    }

    tracing::debug!("Sync scheduler stopped");
}
