//! Map statistics and telemetry.
//!
//! Counters are atomic and can be read while operations are in progress.

use std::sync::atomic::{AtomicU64, Ordering};

/// Runtime counters for a [`SnapMap`](crate::SnapMap).
///
/// All values are monotonically increasing.
#[derive(Debug, Default)]
pub struct MapStats {
    /// Transactions started.
    transactions_started: AtomicU64,
    /// Transactions that committed successfully.
    transactions_committed: AtomicU64,
    /// Transactions that ended in rollback, including failed commits.
    transactions_rolled_back: AtomicU64,
    /// Commits rejected by write-write conflict detection.
    commit_conflicts: AtomicU64,
    /// Versions collected by the reclaimer.
    versions_reclaimed: AtomicU64,
    /// Deadlock cycles resolved by aborting a victim.
    deadlocks_resolved: AtomicU64,
}

impl MapStats {
    /// Creates a new stats instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_rollback(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_conflict(&self) {
        self.commit_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_versions_reclaimed(&self, count: u64) {
        self.versions_reclaimed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock_resolved(&self) {
        self.deadlocks_resolved.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions that ended in rollback.
    pub fn transactions_rolled_back(&self) -> u64 {
        self.transactions_rolled_back.load(Ordering::Relaxed)
    }

    /// Returns the number of commits rejected with a conflict.
    pub fn commit_conflicts(&self) -> u64 {
        self.commit_conflicts.load(Ordering::Relaxed)
    }

    /// Returns the number of versions collected by the reclaimer.
    pub fn versions_reclaimed(&self) -> u64 {
        self.versions_reclaimed.load(Ordering::Relaxed)
    }

    /// Returns the number of deadlock cycles resolved.
    pub fn deadlocks_resolved(&self) -> u64 {
        self.deadlocks_resolved.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_rolled_back: self.transactions_rolled_back(),
            commit_conflicts: self.commit_conflicts(),
            versions_reclaimed: self.versions_reclaimed(),
            deadlocks_resolved: self.deadlocks_resolved(),
        }
    }
}

/// A point-in-time snapshot of map statistics.
///
/// Unlike [`MapStats`], this is a plain value that can be compared or passed
/// across threads without atomics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions that ended in rollback.
    pub transactions_rolled_back: u64,
    /// Commits rejected with a conflict.
    pub commit_conflicts: u64,
    /// Versions collected by the reclaimer.
    pub versions_reclaimed: u64,
    /// Deadlock cycles resolved.
    pub deadlocks_resolved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = MapStats::new();
        assert_eq!(stats.transactions_started(), 0);
        assert_eq!(stats.commit_conflicts(), 0);
        assert_eq!(stats.versions_reclaimed(), 0);
    }

    #[test]
    fn record_counters() {
        let stats = MapStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_rollback();
        stats.record_commit_conflict();
        stats.record_versions_reclaimed(3);
        stats.record_deadlock_resolved();

        assert_eq!(stats.transactions_started(), 2);
        assert_eq!(stats.transactions_committed(), 1);
        assert_eq!(stats.transactions_rolled_back(), 1);
        assert_eq!(stats.commit_conflicts(), 1);
        assert_eq!(stats.versions_reclaimed(), 3);
        assert_eq!(stats.deadlocks_resolved(), 1);
    }

    #[test]
    fn snapshot_copies_counters() {
        let stats = MapStats::new();
        stats.record_transaction_start();
        stats.record_transaction_commit();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 1);
        assert_eq!(snap.transactions_committed, 1);

        stats.record_transaction_start();
        assert_eq!(snap.transactions_started, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(MapStats::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_transaction_start();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.transactions_started(), 800);
    }
}
