//! Conversion between syncable objects and remote records.

use crate::remote::{RecordId, RemoteRecord};
use objsync_types::hash::canonicalize;
use objsync_types::{Commit, Locator, SyncableObject};
use thiserror::Error;

/// Record mapping errors.
#[derive(Debug, Clone, Error)]
pub enum MappingError {
    /// An object could not be turned into a record.
    #[error("cannot encode {locator}: {message}")]
    Encode {
        /// Object being encoded.
        locator: Locator,
        /// What went wrong.
        message: String,
    },

    /// A record could not be turned into an object.
    #[error("cannot decode record {id}: {message}")]
    Decode {
        /// Record being decoded.
        id: RecordId,
        /// What went wrong.
        message: String,
    },
}

/// Maps objects of one type to and from the remote's record schema.
pub trait RecordMapping: Send + Sync {
    /// Build the record to write for `object`.
    fn to_record(&self, object: &SyncableObject) -> Result<RemoteRecord, MappingError>;

    /// Build the object a fetched record describes, in `user`'s scope.
    fn from_record(
        &self,
        record: &RemoteRecord,
        user: Option<&str>,
    ) -> Result<SyncableObject, MappingError>;
}

/// Stores the object's canonical JSON payload as the record payload.
///
/// A commit string that cannot be parsed decodes as
/// [`Commit::empty()`], which the coordinator replaces before persisting.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordMapping;

impl RecordMapping for JsonRecordMapping {
    fn to_record(&self, object: &SyncableObject) -> Result<RemoteRecord, MappingError> {
        let payload = if object.is_tombstone {
            String::new()
        } else {
            canonicalize(&object.payload).map_err(|e| MappingError::Encode {
                locator: object.locator.clone(),
                message: e.to_string(),
            })?
        };

        Ok(RemoteRecord {
            id: RecordId::for_locator(&object.locator),
            payload,
            tombstone: object.is_tombstone,
            commit: object.commit.to_string(),
            system_fields: object.metadata.clone(),
            modified_at: None,
        })
    }

    fn from_record(
        &self,
        record: &RemoteRecord,
        user: Option<&str>,
    ) -> Result<SyncableObject, MappingError> {
        let locator = record.id.locator(user);
        let commit = record.commit.parse().unwrap_or_else(|e| {
            tracing::warn!("Record {} has unreadable commit: {}", record.id, e);
            Commit::empty()
        });

        if record.tombstone {
            return Ok(SyncableObject::tombstone(
                locator,
                record.system_fields.clone(),
                commit,
            ));
        }

        let payload = canonicalize(&record.payload).map_err(|e| MappingError::Decode {
            id: record.id.clone(),
            message: e.to_string(),
        })?;
        Ok(SyncableObject::new(
            locator,
            payload,
            record.system_fields.clone(),
            commit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> SyncableObject {
        SyncableObject::new(
            Locator::new("n1", "Note", Some("alice".into())),
            r#"{"b":2,"a":1}"#,
            Some(b"tag1".to_vec()),
            Commit::from_parts("dev", "hash", 10, "abc"),
        )
    }

    #[test]
    fn record_carries_commit_and_system_fields() {
        let record = JsonRecordMapping.to_record(&object()).unwrap();
        assert_eq!(record.id, RecordId::new("Note", "n1"));
        assert_eq!(record.payload, r#"{"a":1,"b":2}"#);
        assert_eq!(record.commit, "dev-hash-10-abc");
        assert_eq!(record.system_fields, Some(b"tag1".to_vec()));
    }

    #[test]
    fn record_maps_back_into_user_scope() {
        let record = JsonRecordMapping.to_record(&object()).unwrap();
        let back = JsonRecordMapping.from_record(&record, Some("alice")).unwrap();
        assert_eq!(back.locator, object().locator);
        assert!(back.commit.is_identical(&object().commit));
        assert_eq!(back.metadata, Some(b"tag1".to_vec()));
    }

    #[test]
    fn tombstone_record_has_no_payload() {
        let tomb = SyncableObject::tombstone(object().locator, None, object().commit);
        let record = JsonRecordMapping.to_record(&tomb).unwrap();
        assert!(record.tombstone);
        assert!(record.payload.is_empty());

        let back = JsonRecordMapping.from_record(&record, Some("alice")).unwrap();
        assert!(back.is_tombstone);
        assert!(back.commit.is_tombstone());
    }

    #[test]
    fn invalid_payload_fails_to_encode() {
        let mut bad = object();
        bad.payload = "not json".into();
        assert!(matches!(
            JsonRecordMapping.to_record(&bad),
            Err(MappingError::Encode { .. })
        ));
    }

    #[test]
    fn unreadable_commit_decodes_as_empty() {
        let mut record = JsonRecordMapping.to_record(&object()).unwrap();
        record.commit = "garbage".into();
        let back = JsonRecordMapping.from_record(&record, None).unwrap();
        assert!(back.commit.is_empty());
    }
}
