//! # sync-types
//!
//! Versioning and locator types for objsync.
//!
//! This crate provides the foundational types used across all objsync crates:
//! - [`Locator`] - Identity of one logical object across local and remote stores
//! - [`Commit`] - One revision of an object's content
//! - [`Syncdata`], [`SyncStatus`] - Per-object sync state
//! - [`SyncableObject`] - Reconciliation-time view of an object
//! - [`ObjectChange`] - Change notifications for downstream consumers
//! - [`CommitParseError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commit;
mod error;
mod events;
pub mod hash;
mod locator;
mod object;
mod syncdata;

pub use commit::{unix_now, Commit, TOMBSTONE_HASH};
pub use error::CommitParseError;
pub use events::{ChangeAction, ChangeOrigin, ObjectChange};
pub use locator::Locator;
pub use object::SyncableObject;
pub use syncdata::{SyncStatus, Syncdata};
