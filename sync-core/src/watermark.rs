//! High-water mark tracking for down-sync.
//!
//! A down-sync cycle fetches every remote change with a modification time
//! strictly greater than the committed mark, following pagination cursors
//! until exhausted. The largest modification time seen along the way is only
//! *observed*; it becomes the committed mark when the caller confirms that
//! every page was reconciled. A cycle aborted by a fetch error never moves
//! the mark, so nothing is skipped on the next attempt.

/// Per-type down-sync position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HighWaterMark {
    committed: u64,
    observed: Option<u64>,
}

impl HighWaterMark {
    /// Start from a persisted mark (0 if never synced).
    pub fn new(committed: u64) -> Self {
        Self {
            committed,
            observed: None,
        }
    }

    /// Exclusive lower bound for the next fetch.
    pub fn since(&self) -> u64 {
        self.committed
    }

    /// Record the maximum modification time reported by one fetched page.
    pub fn observe(&mut self, max_modified: Option<u64>) {
        if let Some(value) = max_modified {
            self.observed = Some(self.observed.map_or(value, |seen| seen.max(value)));
        }
    }

    /// Observed value that would advance the mark, if any.
    pub fn pending(&self) -> Option<u64> {
        self.observed.filter(|&seen| seen > self.committed)
    }

    /// Promote the observed maximum to the committed mark.
    ///
    /// Returns the new mark when it moved, so the caller knows whether to
    /// persist it.
    pub fn commit(&mut self) -> Option<u64> {
        let next = self.pending();
        if let Some(value) = next {
            self.committed = value;
        }
        self.observed = None;
        next
    }
}
