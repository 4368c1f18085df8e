//! Driver counters
//!
//! Updated from the completion context with relaxed atomics; read at any
//! time through [`DriverStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DriverStats {
    notes_forwarded: AtomicU64,
    notes_dropped: AtomicU64,
    resubmissions: AtomicU64,
    stream_errors: AtomicU64,
}

impl DriverStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_forwarded(&self) {
        self.notes_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Note lost to a full, closed or unbound sink
    pub fn note_dropped(&self) {
        self.notes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resubmitted(&self) {
        self.resubmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_error(&self) {
        self.stream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            notes_forwarded: self.notes_forwarded.load(Ordering::Relaxed),
            notes_dropped: self.notes_dropped.load(Ordering::Relaxed),
            resubmissions: self.resubmissions.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DriverStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub notes_forwarded: u64,
    pub notes_dropped: u64,
    pub resubmissions: u64,
    pub stream_errors: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} notes forwarded, {} dropped, {} resubmissions, {} stream errors",
            self.notes_forwarded, self.notes_dropped, self.resubmissions, self.stream_errors
        )
    }
}
