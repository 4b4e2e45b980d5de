//! Change notifications.

use crate::commit::Commit;
use crate::locator::Locator;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    /// The object appeared.
    Created,
    /// The object's content changed.
    Modified,
    /// The object was deleted.
    Deleted,
}

/// Which side produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// A local save, delete or merge.
    Local,
    /// A revision received from the remote store.
    Cloud,
}

/// One observable state transition of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    /// The object that changed.
    pub locator: Locator,
    /// Its revision after the change.
    pub commit: Commit,
    /// Kind of change.
    pub action: ChangeAction,
    /// Side that produced it.
    pub origin: ChangeOrigin,
}

impl ObjectChange {
    /// Create a change notification.
    pub fn new(locator: Locator, commit: Commit, action: ChangeAction, origin: ChangeOrigin) -> Self {
        Self {
            locator,
            commit,
            action,
            origin,
        }
    }
}
