//! # sync-core
//!
//! Pure reconciliation logic for objsync (no I/O, instant tests).
//!
//! This crate implements the decisions the sync coordinator makes without
//! touching any store, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual persistence and network calls are performed by `sync-client`,
//! which applies the decisions produced here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod reconcile;
pub mod retry;
pub mod watermark;

pub use conflict::{
    classify, last_writer_wins, resolve_conflict, tombstone_winner, ConflictError,
    ConflictOutcome, Resolution, Side,
};
pub use reconcile::{decide_fetched, FetchDecision};
pub use retry::{RetryPolicy, RetrySchedule, DEFAULT_MAX_RETRY_INTERVAL, DEFAULT_RETRY_BASE_DELAY};
pub use watermark::HighWaterMark;
