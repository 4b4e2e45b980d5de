//! Commits: one revision of an object's content.
//!
//! A commit is serialized on the wire as `device-hash-time-commitid`. The
//! delimiter is stripped from every string field on construction, so a
//! commit always round-trips through its wire form. The stripping is lossy
//! but deterministic, and existing persisted data depends on it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CommitParseError;
use crate::hash::{random_id, COMMIT_ID_LEN};

/// Reserved content hash marking a deletion.
pub const TOMBSTONE_HASH: &str = "tombstone";

const DELIMITER: char = '-';
const RESOLVE: &str = "resolve";

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn sanitize(field: impl Into<String>) -> String {
    let field = field.into();
    if field.contains(DELIMITER) {
        field.replace(DELIMITER, "")
    } else {
        field
    }
}

/// One revision of an object's content.
///
/// Two commits are the same revision when hash, time and commit id match.
/// The device id only records which device last acknowledged the revision
/// and is excluded from equality.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct Commit {
    device_id: String,
    hash: String,
    time: u64,
    commit_id: String,
}

impl Commit {
    /// Mint a new commit for `hash`, stamped with the current time and a
    /// fresh random commit id.
    pub fn new(device_id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self::from_parts(device_id, hash, unix_now(), random_id(COMMIT_ID_LEN))
    }

    /// Build a commit from its four fields.
    pub fn from_parts(
        device_id: impl Into<String>,
        hash: impl Into<String>,
        time: u64,
        commit_id: impl Into<String>,
    ) -> Self {
        Self {
            device_id: sanitize(device_id),
            hash: sanitize(hash),
            time,
            commit_id: sanitize(commit_id),
        }
    }

    /// The not-yet-assigned sentinel.
    pub fn empty() -> Self {
        Self::from_parts("", "", 0, "")
    }

    /// The sentinel a conflict resolver returns to request a fresh commit.
    pub fn resolve() -> Self {
        Self::from_parts(RESOLVE, RESOLVE, 0, RESOLVE)
    }

    /// Device that minted or last acknowledged this revision.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Content hash, or [`TOMBSTONE_HASH`].
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Commit time in unix seconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Random revision id.
    pub fn commit_id(&self) -> &str {
        &self.commit_id
    }

    /// Whether this revision is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        self.hash == TOMBSTONE_HASH
    }

    /// Whether all four fields match the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.is_identical(&Self::empty())
    }

    /// Whether all four fields match the resolve sentinel.
    pub fn is_resolve(&self) -> bool {
        self.is_identical(&Self::resolve())
    }

    /// Whether this commit must be replaced before it is persisted.
    pub fn is_placeholder(&self) -> bool {
        self.is_empty() || self.is_resolve()
    }

    /// Field-by-field equality, including the device id.
    pub fn is_identical(&self, other: &Self) -> bool {
        self == other && self.device_id == other.device_id
    }

    /// The same revision marked as a deletion.
    pub fn tombstone(&self) -> Self {
        Self {
            hash: TOMBSTONE_HASH.to_string(),
            ..self.clone()
        }
    }

    /// The same revision attributed to `device_id`.
    pub fn restamped(&self, device_id: &str) -> Self {
        Self {
            device_id: sanitize(device_id),
            ..self.clone()
        }
    }

    /// The same revision with its time capped at `max_time`.
    pub fn clamp_time(&self, max_time: u64) -> Self {
        if self.time > max_time {
            Self {
                time: max_time,
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.time == other.time && self.commit_id == other.commit_id
    }
}

impl Hash for Commit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.time.hash(state);
        self.commit_id.hash(state);
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{d}{}{d}{}{d}{}",
            self.device_id,
            self.hash,
            self.time,
            self.commit_id,
            d = DELIMITER
        )
    }
}

impl FromStr for Commit {
    type Err = CommitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(DELIMITER).collect();
        if fields.len() < 4 {
            return Err(CommitParseError::TooFewFields(fields.len()));
        }
        Ok(Self {
            device_id: fields[0].to_string(),
            hash: fields[1].to_string(),
            time: fields[2].parse().unwrap_or(0),
            commit_id: fields[3].to_string(),
        })
    }
}
