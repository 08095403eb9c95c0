//! Engine statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by [`SagaDataStep`](crate::SagaDataStep).
#[derive(Default)]
pub struct SagaStats {
    /// Instances loaded from storage via a correlation value.
    pub instances_loaded: AtomicU64,
    /// Instances freshly created for an initiating message.
    pub instances_created: AtomicU64,
    /// Messages routed to the correlation-error handler.
    pub uncorrelated_messages: AtomicU64,
    /// Successful inserts.
    pub inserts: AtomicU64,
    /// Successful updates.
    pub updates: AtomicU64,
    /// Successful deletes.
    pub deletes: AtomicU64,
    /// Update conflicts merged by a resolver and retried.
    pub conflicts_resolved: AtomicU64,
    /// Conflicts surfaced to the caller.
    pub conflicts_surfaced: AtomicU64,
}

impl SagaStats {
    /// Fresh, zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of all counters.
    pub fn snapshot(&self) -> SagaStatsSnapshot {
        SagaStatsSnapshot {
            instances_loaded: self.instances_loaded.load(Ordering::Relaxed),
            instances_created: self.instances_created.load(Ordering::Relaxed),
            uncorrelated_messages: self.uncorrelated_messages.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts_resolved.load(Ordering::Relaxed),
            conflicts_surfaced: self.conflicts_surfaced.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`SagaStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SagaStatsSnapshot {
    /// Instances loaded from storage via a correlation value.
    pub instances_loaded: u64,
    /// Instances freshly created for an initiating message.
    pub instances_created: u64,
    /// Messages routed to the correlation-error handler.
    pub uncorrelated_messages: u64,
    /// Successful inserts.
    pub inserts: u64,
    /// Successful updates.
    pub updates: u64,
    /// Successful deletes.
    pub deletes: u64,
    /// Update conflicts merged by a resolver and retried.
    pub conflicts_resolved: u64,
    /// Conflicts surfaced to the caller.
    pub conflicts_surfaced: u64,
}
