//! On-disk layout shared by the file-backed stores.
//!
//! ```text
//! <root>/<user or _>/objects/<type>/<id>.json
//! <root>/<user or _>/syncdata/<type>/<id>.json
//! <root>/<user or _>/metadata/<type>/<id>.bin
//! <root>/<user or _>/queue.json
//! <root>/<user or _>/watermarks.json
//! <root>/device_id
//! ```
//!
//! Names made of ASCII letters, digits and `-` are used verbatim; anything
//! else is replaced by `~` plus a hex hash, which cannot collide with a
//! verbatim name.

use objsync_types::Locator;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

const SHARED_SCOPE: &str = "_";

/// File-name-safe form of a type, id or user name.
pub(crate) fn segment(name: &str) -> String {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        name.to_string()
    } else {
        let digest = Sha256::digest(name.as_bytes());
        format!("~{}", hex::encode(&digest[..16]))
    }
}

/// Directory holding everything stored for `user`.
pub(crate) fn scope_dir(root: &Path, user: Option<&str>) -> PathBuf {
    match user {
        Some(user) => root.join(segment(user)),
        None => root.join(SHARED_SCOPE),
    }
}

/// Directory holding one kind of per-object file for a type.
pub(crate) fn type_dir(root: &Path, kind: &str, object_type: &str, user: Option<&str>) -> PathBuf {
    scope_dir(root, user).join(kind).join(segment(object_type))
}

/// Path of one per-object file.
pub(crate) fn object_file(root: &Path, kind: &str, locator: &Locator, extension: &str) -> PathBuf {
    type_dir(root, kind, &locator.object_type, locator.user.as_deref())
        .join(format!("{}.{}", segment(&locator.id), extension))
}

/// Replace a file's contents via a temporary sibling and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Read a file, treating a missing file as `None`.
pub(crate) fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file, ignoring a missing one.
pub(crate) fn remove_optional(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Files in `dir` with the given extension. A missing directory is empty.
pub(crate) fn list_files(dir: &Path, extension: &str) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
