//! Background reclamation of obsolete versions.
//!
//! Every commit publishes a new version, so without reclamation the version
//! list grows without bound. The reclaimer runs on a ticker and drops every
//! version that is not the current one, is not pinned by an active
//! transaction, and is older than the oldest active snapshot.

use tracing::debug;

use crate::map::MapCore;

impl<K, V> MapCore<K, V> {
    /// One reclamation pass.
    ///
    /// A version is retained when any of the following holds:
    /// - it is the current version,
    /// - its pin count is positive (a transaction holds it, or is between
    ///   capturing and pinning it),
    /// - its ID is at least the smallest snapshot ID among active
    ///   transactions, so transactions that registered but have not pinned
    ///   yet stay safe.
    ///
    /// With no active transactions the lower bound is the current version's
    /// ID. The list is compacted in place; dropping a version's last handle
    /// frees its map transitively.
    pub(crate) fn collect_versions(&self) {
        let current_id = self.current.load_full().id();

        let min_active_snapshot_id = self
            .active_txs
            .read()
            .values()
            .map(|meta| meta.snapshot_id)
            .min()
            .unwrap_or(current_id);

        let mut versions = self.versions.lock();
        let before = versions.len();
        versions.retain(|version| {
            let keep = version.id() == current_id
                || version.pin_count() > 0
                || version.id() >= min_active_snapshot_id;
            if !keep {
                let id = version.id();
                debug!(version = %id, "reclaimed version");
            }
            keep
        });

        let reclaimed = before - versions.len();
        if reclaimed > 0 {
            self.stats.record_versions_reclaimed(reclaimed as u64);
        }
    }
}
