//! Error types for objsync types.

use thiserror::Error;

/// Errors from parsing a commit wire string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitParseError {
    /// The string did not contain the four delimited fields.
    #[error("commit needs 4 fields, found {0}")]
    TooFewFields(usize),
}
