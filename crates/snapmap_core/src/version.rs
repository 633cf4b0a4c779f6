//! Immutable published versions of the map.
//!
//! Commits never mutate the current version. Instead the committer clones the
//! current data, overlays its write set, and publishes the result as a new
//! `Version`. Readers that captured the old version keep reading it
//! unchanged, which is what makes the read path lock-free.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::types::{TransactionId, VersionId};

/// A value together with the ID of the transaction that wrote it.
///
/// The writer stamp is the sole witness for write-write conflict detection:
/// at commit time, a key conflicts when the stamp in the current version
/// differs from the stamp in the committer's snapshot.
#[derive(Debug, Clone)]
pub(crate) struct VersionedValue<V> {
    /// The stored value.
    pub(crate) value: V,
    /// The transaction that last committed this key.
    pub(crate) writer: TransactionId,
}

/// An immutable snapshot of the whole map.
///
/// The pin count tracks transactions currently holding this version as their
/// snapshot. The reclaimer treats a count of zero as a necessary (but not
/// sufficient) condition for collection; the `Arc` holding the version is
/// what actually frees the data.
pub(crate) struct Version<K, V> {
    id: VersionId,
    data: HashMap<K, VersionedValue<V>>,
    pins: AtomicI64,
}

impl<K, V> Version<K, V> {
    /// Creates a version with an initially unpinned snapshot.
    pub(crate) fn new(id: VersionId, data: HashMap<K, VersionedValue<V>>) -> Self {
        Self {
            id,
            data,
            pins: AtomicI64::new(0),
        }
    }

    pub(crate) fn id(&self) -> VersionId {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Marks the version as held by one more active transaction.
    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one hold. Called exactly once per completed transaction.
    pub(crate) fn unpin(&self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn pin_count(&self) -> i64 {
        self.pins.load(Ordering::SeqCst)
    }
}

impl<K, V> Version<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn get(&self, key: &K) -> Option<&VersionedValue<V>> {
        self.data.get(key)
    }

    /// Returns a fresh owned copy of the entries, sharing nothing with this
    /// version. O(n) in map size; this is the engine's dominant allocation.
    pub(crate) fn clone_data(&self) -> HashMap<K, VersionedValue<V>> {
        self.data.clone()
    }
}

impl<K, V> fmt::Debug for Version<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Version")
            .field("id", &self.id)
            .field("entries", &self.data.len())
            .field("pins", &self.pin_count())
            .finish()
    }
}
