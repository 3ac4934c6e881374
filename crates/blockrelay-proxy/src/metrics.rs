//! Instrumentation counters
//!
//! Relaxed atomic counters bumped along the I/O paths. Tests assert the
//! alignment laws through these (an aligned write takes no pre-read and no
//! lock); operators read them through `snapshot`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one proxy instance.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Reads submitted.
    pub reads: AtomicU64,
    /// Writes submitted.
    pub writes: AtomicU64,
    /// Writes that were fully aligned and bypassed the RMW path.
    pub aligned_writes: AtomicU64,
    /// Writes that required a read-modify-write sequence.
    pub rmw_writes: AtomicU64,
    /// Pre-reads issued.
    pub pre_reads: AtomicU64,
    /// Pre-reads that completed with an error (write still issued).
    pub pre_read_failures: AtomicU64,
    /// Range locks granted immediately.
    pub locks_granted: AtomicU64,
    /// Range locks that had to queue behind an overlapping range.
    pub locks_queued: AtomicU64,
    /// Contexts resumed off the retry queue.
    pub retries_resumed: AtomicU64,
    /// Geometry negotiations issued to the physical service.
    pub geometry_negotiations: AtomicU64,
    /// I/O calls that hit the configured timeout.
    pub timeouts: AtomicU64,
    /// Requests completed with a client-visible error.
    pub failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub aligned_writes: u64,
    pub rmw_writes: u64,
    pub pre_reads: u64,
    pub pre_read_failures: u64,
    pub locks_granted: u64,
    pub locks_queued: u64,
    pub retries_resumed: u64,
    pub geometry_negotiations: u64,
    pub timeouts: u64,
    pub failures: u64,
}

impl EngineStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            aligned_writes: self.aligned_writes.load(Ordering::Relaxed),
            rmw_writes: self.rmw_writes.load(Ordering::Relaxed),
            pre_reads: self.pre_reads.load(Ordering::Relaxed),
            pre_read_failures: self.pre_read_failures.load(Ordering::Relaxed),
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            locks_queued: self.locks_queued.load(Ordering::Relaxed),
            retries_resumed: self.retries_resumed.load(Ordering::Relaxed),
            geometry_negotiations: self.geometry_negotiations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
