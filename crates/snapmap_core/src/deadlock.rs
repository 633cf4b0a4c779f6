//! Periodic wait-for-graph deadlock detection.
//!
//! The engine itself takes no pessimistic key locks, but transactions may
//! declare what they are waiting on through their registry entry. The
//! detector snapshots those edges on a ticker, walks the graph for cycles,
//! and aborts the youngest transaction in the first cycle it finds by firing
//! that transaction's cancellation token. The victim observes the abort at
//! its next `put` or `commit`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

use tracing::warn;

use crate::cancel::CancelReason;
use crate::map::MapCore;
use crate::types::TransactionId;

impl<K, V> MapCore<K, V> {
    /// One detection pass. Aborts at most one victim; the next tick
    /// re-evaluates.
    pub(crate) fn detect_deadlocks(&self) {
        // Snapshot the wait-for edges under the read lock. Each transaction
        // waits on at most one other, so the graph is a functional graph and
        // a single walk per node finds every cycle.
        let graph: HashMap<u64, u64> = {
            let txs = self.active_txs.read();
            txs.values()
                .filter_map(|meta| {
                    let target = meta.wait_for.load(Ordering::SeqCst);
                    (target != 0).then_some((meta.id.as_u64(), target))
                })
                .collect()
        };

        let mut visited = HashSet::new();
        for &start in graph.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = find_cycle(&graph, start, &mut visited) {
                if self.resolve_deadlock(&cycle) {
                    return;
                }
            }
        }
    }

    /// Aborts the youngest transaction in the cycle. The youngest has done
    /// the least work, so aborting it wastes the least.
    ///
    /// Returns false when the cycle needs no action: its victim already
    /// completed or was already canceled by an earlier pass.
    fn resolve_deadlock(&self, cycle: &[u64]) -> bool {
        let Some(&victim) = cycle.iter().max() else {
            return false;
        };

        let meta = self
            .active_txs
            .read()
            .get(&TransactionId::new(victim))
            .cloned();

        let Some(meta) = meta else { return false };
        if meta.cancel.is_canceled() {
            return false;
        }

        warn!(?cycle, victim, "deadlock detected, aborting youngest transaction");
        meta.cancel.cancel(CancelReason::Deadlock);
        self.stats.record_deadlock_resolved();
        true
    }
}

/// Follows the wait-for chain from `start`, returning the cycle if the walk
/// re-enters its own path. Nodes already visited by earlier walks cannot be
/// part of an undiscovered cycle.
fn find_cycle(
    graph: &HashMap<u64, u64>,
    start: u64,
    visited: &mut HashSet<u64>,
) -> Option<Vec<u64>> {
    let mut path = Vec::new();
    let mut on_path: HashMap<u64, usize> = HashMap::new();
    let mut node = start;

    loop {
        if let Some(&position) = on_path.get(&node) {
            return Some(path[position..].to_vec());
        }
        if !visited.insert(node) {
            return None;
        }
        on_path.insert(node, path.len());
        path.push(node);

        match graph.get(&node) {
            Some(&next) => node = next,
            None => return None,
        }
    }
}
