//! Short hashes for content, commit ids and device ids.
//!
//! Every hash is SHA-256, base64 encoded, reduced to its ASCII alphanumeric
//! characters and truncated. The alphabet never contains the commit
//! delimiter, so hashes can be embedded in commit strings as-is.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of payload content hashes.
pub const CONTENT_HASH_LEN: usize = 16;

/// Length of freshly minted commit ids.
pub const COMMIT_ID_LEN: usize = 6;

/// Length of device identifiers.
pub const DEVICE_ID_LEN: usize = 16;

/// Hash arbitrary bytes into an alphanumeric string of at most `length` chars.
pub fn short_hash(data: &[u8], length: usize) -> String {
    let digest = Sha256::digest(data);
    STANDARD
        .encode(digest)
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(length)
        .collect()
}

/// A random alphanumeric id of `length` characters, derived from a UUID v4.
pub fn random_id(length: usize) -> String {
    short_hash(uuid::Uuid::new_v4().to_string().as_bytes(), length)
}

/// Generate a fresh device identifier.
pub fn new_device_id() -> String {
    random_id(DEVICE_ID_LEN)
}

/// Canonical JSON form of a serializable value (object keys sorted).
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::to_value(value)?)
}

/// Re-encode JSON text in canonical form.
pub fn canonicalize(json: &str) -> Result<String, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    serde_json::to_string(&value)
}

/// Content hash of a JSON payload.
///
/// Equal JSON documents hash equally regardless of key order. Text that is
/// not JSON is hashed verbatim.
pub fn content_hash(json: &str) -> String {
    match canonicalize(json) {
        Ok(canonical) => short_hash(canonical.as_bytes(), CONTENT_HASH_LEN),
        Err(_) => short_hash(json.as_bytes(), CONTENT_HASH_LEN),
    }
}
