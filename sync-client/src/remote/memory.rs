//! In-memory remote store.
//!
//! Behaves like a hub with optimistic concurrency: every stored record
//! carries a change tag (returned as its `system_fields`), and a write is
//! accepted only when it presents the current tag. Modification times are
//! unique and strictly increasing, so "changed after" queries never miss or
//! repeat a record.
//!
//! Clones share state, so several stores (devices) can sync through one
//! instance. Failures can be injected for testing.

use super::{
    FetchCursor, FetchPage, RecordError, RecordId, RemoteError, RemoteRecord, RemoteStore,
    SaveResults,
};
use async_trait::async_trait;
use objsync_types::unix_now;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// In-memory remote store.
#[derive(Debug, Default, Clone)]
pub struct MemoryRemote {
    inner: Arc<Mutex<MemoryRemoteInner>>,
}

#[derive(Debug, Default)]
struct MemoryRemoteInner {
    user: Option<String>,
    records: BTreeMap<RecordId, RemoteRecord>,
    last_modified: u64,
    next_tag: u64,
    save_calls: usize,
    fail_next_fetch: Option<String>,
    fail_next_save: Option<String>,
    fail_records: HashMap<RecordId, RecordError>,
}

impl MemoryRemoteInner {
    fn tick(&mut self) -> u64 {
        self.last_modified = unix_now().max(self.last_modified + 1);
        self.last_modified
    }

    fn store(&mut self, mut record: RemoteRecord) -> RemoteRecord {
        self.next_tag += 1;
        record.system_fields = Some(format!("tag{}", self.next_tag).into_bytes());
        record.modified_at = Some(self.tick());
        self.records.insert(record.id.clone(), record.clone());
        record
    }

    fn page(&self, record_type: &str, since: u64, limit: usize) -> FetchPage {
        let mut matching: Vec<&RemoteRecord> = self
            .records
            .values()
            .filter(|r| r.id.record_type == record_type)
            .filter(|r| r.modified_at.unwrap_or(0) > since)
            .collect();
        matching.sort_by_key(|r| r.modified_at);

        let limit = limit.max(1);
        let has_more = matching.len() > limit;
        let records: Vec<RemoteRecord> = matching.into_iter().take(limit).cloned().collect();
        let max_modified = records.iter().filter_map(|r| r.modified_at).max();
        let cursor = match (has_more, max_modified) {
            (true, Some(last)) => Some(FetchCursor::new(format!("{}:{}", last, record_type))),
            _ => None,
        };

        FetchPage {
            records,
            cursor,
            max_modified,
        }
    }

    fn save_one(&mut self, record: RemoteRecord) -> Result<RemoteRecord, RecordError> {
        if let Some(error) = self.fail_records.remove(&record.id) {
            return Err(error);
        }

        match self.records.get(&record.id) {
            Some(current) if current.system_fields == record.system_fields => Ok(self.store(record)),
            Some(current) => Err(RecordError::Conflict {
                server_record: Box::new(current.clone()),
            }),
            None if record.system_fields.is_some() => Err(RecordError::UnknownRecord),
            None => Ok(self.store(record)),
        }
    }
}

impl MemoryRemote {
    /// Create an empty remote with no signed-in user.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty remote with `user` signed in.
    pub fn with_user(user: &str) -> Self {
        let remote = Self::new();
        remote.set_user(Some(user));
        remote
    }

    /// Change the signed-in principal.
    pub fn set_user(&self, user: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.user = user.map(str::to_string);
    }

    /// Current server copy of a record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        let inner = self.inner.lock().unwrap();
        inner.records.get(id).cloned()
    }

    /// Number of stored records, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    /// Whether no record is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().records.is_empty()
    }

    /// Number of `save_batch` calls that reached the store.
    pub fn save_calls(&self) -> usize {
        self.inner.lock().unwrap().save_calls
    }

    /// Write a record directly, bypassing change-tag checks, as another
    /// writer would.
    pub fn put_record(&self, record: RemoteRecord) -> RemoteRecord {
        let mut inner = self.inner.lock().unwrap();
        inner.store(record)
    }

    /// Remove a record outright, as a server-side purge would.
    pub fn purge(&self, id: &RecordId) -> Option<RemoteRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(id)
    }

    /// Cause the next fetch call to fail with the given error.
    pub fn fail_next_fetch(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_fetch = Some(error.to_string());
    }

    /// Cause the next `save_batch` call to fail as a whole.
    pub fn fail_next_save(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_save = Some(error.to_string());
    }

    /// Cause the next write of one record to fail with `error`.
    pub fn fail_record(&self, id: RecordId, error: RecordError) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_records.insert(id, error);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn current_user(&self) -> Result<Option<String>, RemoteError> {
        Ok(self.inner.lock().unwrap().user.clone())
    }

    async fn fetch_since(
        &self,
        record_type: &str,
        since: u64,
        limit: usize,
    ) -> Result<FetchPage, RemoteError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(RemoteError::Unavailable(error));
        }

        Ok(inner.page(record_type, since, limit))
    }

    async fn fetch_continuing(
        &self,
        cursor: &FetchCursor,
        limit: usize,
    ) -> Result<FetchPage, RemoteError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(RemoteError::Unavailable(error));
        }

        let (since, record_type) = cursor
            .as_str()
            .split_once(':')
            .and_then(|(since, record_type)| Some((since.parse::<u64>().ok()?, record_type)))
            .ok_or_else(|| RemoteError::InvalidCursor(cursor.as_str().to_string()))?;

        Ok(inner.page(record_type, since, limit))
    }

    async fn save_batch(&self, records: Vec<RemoteRecord>) -> Result<SaveResults, RemoteError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.fail_next_save.take() {
            return Err(RemoteError::Unavailable(error));
        }
        inner.save_calls += 1;

        Ok(records
            .into_iter()
            .map(|record| (record.id.clone(), inner.save_one(record)))
            .collect())
    }

    async fn fetch_by_id(&self, id: &RecordId) -> Result<Option<RemoteRecord>, RemoteError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.fail_next_fetch.take() {
            return Err(RemoteError::Unavailable(error));
        }

        Ok(inner.records.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(name: &str, system_fields: Option<Vec<u8>>) -> RemoteRecord {
        RemoteRecord {
            id: RecordId::new("Note", name),
            payload: r#"{"title":"x"}"#.into(),
            tombstone: false,
            commit: "dev-hash-1-abc".into(),
            system_fields,
            modified_at: None,
        }
    }

    #[tokio::test]
    async fn new_record_is_created_with_tag() {
        let remote = MemoryRemote::new();
        let results = remote.save_batch(vec![record("a", None)]).await.unwrap();

        let saved = results[&RecordId::new("Note", "a")].as_ref().unwrap();
        assert!(saved.system_fields.is_some());
        assert!(saved.modified_at.is_some());
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn stale_tag_conflicts() {
        let remote = MemoryRemote::new();
        remote.save_batch(vec![record("a", None)]).await.unwrap();

        // A second create of the same record has no tag
        let results = remote.save_batch(vec![record("a", None)]).await.unwrap();
        let err = results[&RecordId::new("Note", "a")].as_ref().unwrap_err();
        assert!(matches!(err, RecordError::Conflict { .. }));
    }

    #[tokio::test]
    async fn current_tag_is_accepted() {
        let remote = MemoryRemote::new();
        let first = remote.save_batch(vec![record("a", None)]).await.unwrap();
        let tag = first[&RecordId::new("Note", "a")]
            .as_ref()
            .unwrap()
            .system_fields
            .clone();

        let second = remote.save_batch(vec![record("a", tag.clone())]).await.unwrap();
        let saved = second[&RecordId::new("Note", "a")].as_ref().unwrap();
        assert_ne!(saved.system_fields, tag);
    }

    #[tokio::test]
    async fn tag_for_missing_record_is_unknown() {
        let remote = MemoryRemote::new();
        let results = remote
            .save_batch(vec![record("a", Some(b"tag9".to_vec()))])
            .await
            .unwrap();
        assert!(matches!(
            results[&RecordId::new("Note", "a")],
            Err(RecordError::UnknownRecord)
        ));
    }

    #[tokio::test]
    async fn modification_times_strictly_increase() {
        let remote = MemoryRemote::new();
        let a = remote.put_record(record("a", None));
        let b = remote.put_record(record("b", None));
        assert!(b.modified_at > a.modified_at);
    }

    #[tokio::test]
    async fn fetch_since_is_exclusive_and_paged() {
        let remote = MemoryRemote::new();
        let first = remote.put_record(record("a", None));
        remote.put_record(record("b", None));
        remote.put_record(record("c", None));

        let since = first.modified_at.unwrap();
        let page = remote.fetch_since("Note", since, 1).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id.name, "b");
        let cursor = page.cursor.expect("more records");

        let next = remote.fetch_continuing(&cursor, 1).await.unwrap();
        assert_eq!(next.records[0].id.name, "c");
        assert!(next.cursor.is_none());
        assert!(next.max_modified > page.max_modified);
    }

    #[tokio::test]
    async fn fetch_filters_by_type() {
        let remote = MemoryRemote::new();
        remote.put_record(record("a", None));
        let page = remote.fetch_since("Task", 0, 10).await.unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.max_modified, None);
    }

    #[tokio::test]
    async fn bad_cursor_is_rejected() {
        let remote = MemoryRemote::new();
        let result = remote
            .fetch_continuing(&FetchCursor::new("garbage"), 10)
            .await;
        assert!(matches!(result, Err(RemoteError::InvalidCursor(_))));
    }

    #[tokio::test]
    async fn forced_failures_apply_once() {
        let remote = MemoryRemote::new();
        remote.fail_next_save("offline");
        assert!(remote.save_batch(vec![record("a", None)]).await.is_err());
        assert!(remote.save_batch(vec![record("a", None)]).await.is_ok());

        remote.fail_next_fetch("offline");
        assert!(remote.fetch_since("Note", 0, 10).await.is_err());
        assert!(remote.fetch_since("Note", 0, 10).await.is_ok());
    }

    #[tokio::test]
    async fn per_record_failure_leaves_batch_intact() {
        let remote = MemoryRemote::new();
        remote.fail_record(
            RecordId::new("Note", "a"),
            RecordError::Failed {
                message: "throttled".into(),
                retry_after: Some(Duration::from_secs(5)),
            },
        );

        let results = remote
            .save_batch(vec![record("a", None), record("b", None)])
            .await
            .unwrap();
        assert!(results[&RecordId::new("Note", "a")].is_err());
        assert!(results[&RecordId::new("Note", "b")].is_ok());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let remote = MemoryRemote::with_user("alice");
        let other = remote.clone();
        other.put_record(record("a", None));
        assert_eq!(remote.len(), 1);
        assert_eq!(remote.current_user().await.unwrap(), Some("alice".into()));
    }
}
