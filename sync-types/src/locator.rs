//! Object locators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one logical object instance across local and remote stores.
///
/// `user` is `None` for the globally shared scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Locator {
    /// Object identifier, unique within its type.
    pub id: String,
    /// Registered object type name.
    #[serde(rename = "type")]
    pub object_type: String,
    /// Owning user, if the object lives in a private scope.
    pub user: Option<String>,
}

impl Locator {
    /// Create a new locator.
    pub fn new(id: impl Into<String>, object_type: impl Into<String>, user: Option<String>) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            user,
        }
    }

    /// Short human-readable description, used in logs.
    pub fn summary(&self) -> String {
        match &self.user {
            Some(user) => format!("{}/{}@{}", self.object_type, self.id, user),
            None => format!("{}/{}", self.object_type, self.id),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}
