//! The MVCC map: version publication, commit protocol, and background tasks.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{TxError, TxResult};
use crate::stats::MapStats;
use crate::transaction::Transaction;
use crate::types::{TransactionId, VersionId};
use crate::version::{Version, VersionedValue};

/// Metadata the map keeps per active transaction.
///
/// Deliberately minimal: the reclaimer and deadlock detector work from this
/// record without holding the full `Transaction`, which avoids a lifetime
/// cycle between the map and its transactions. Cancellation is mediated
/// through the shared token.
pub(crate) struct TxMeta {
    pub(crate) id: TransactionId,
    /// Version ID of the snapshot captured at `begin`; the reclaimer's lower
    /// bound for versions that must be retained.
    pub(crate) snapshot_id: VersionId,
    /// Raw ID of the transaction this one is waiting on, or 0 for none.
    /// Sampled by the deadlock detector.
    pub(crate) wait_for: AtomicU64,
    pub(crate) cancel: CancelToken,
}

/// Shared engine state, co-owned by the map handle, its transactions, and
/// the background workers.
pub(crate) struct MapCore<K, V> {
    /// The currently published version. Read lock-free by `begin`; written
    /// only while `commit_mu` is held.
    pub(crate) current: ArcSwap<Version<K, V>>,
    /// Guards the commit critical section only: conflict check, clone, and
    /// publication. The read path never touches it.
    commit_mu: Mutex<()>,
    next_tx_id: AtomicU64,
    next_version_id: AtomicU64,
    /// Registry of active transactions, keyed by ID. Reads dominate (the
    /// detector and reclaimer scan it); `begin` inserts, completion removes.
    pub(crate) active_txs: RwLock<HashMap<TransactionId, Arc<TxMeta>>>,
    /// Every live version, in publication order. Only commit appends and
    /// only the reclaimer compacts. Always acquired after `commit_mu`,
    /// never the other way around.
    pub(crate) versions: Mutex<Vec<Arc<Version<K, V>>>>,
    pub(crate) stats: MapStats,
}

impl<K, V> MapCore<K, V> {
    pub(crate) fn new() -> Self {
        let genesis = Arc::new(Version::new(VersionId::new(0), HashMap::new()));
        Self {
            current: ArcSwap::new(Arc::clone(&genesis)),
            commit_mu: Mutex::new(()),
            next_tx_id: AtomicU64::new(0),
            next_version_id: AtomicU64::new(0),
            active_txs: RwLock::new(HashMap::new()),
            versions: Mutex::new(vec![genesis]),
            stats: MapStats::new(),
        }
    }

    /// Removes a completed transaction from the registry.
    pub(crate) fn unregister(&self, id: TransactionId) {
        self.active_txs.write().remove(&id);
    }

    pub(crate) fn version_count(&self) -> usize {
        self.versions.lock().len()
    }

    pub(crate) fn active_transaction_count(&self) -> usize {
        self.active_txs.read().len()
    }
}

impl<K, V> MapCore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Starts a transaction on the current version.
    ///
    /// Never blocks on the commit mutex or on any writer: the snapshot is
    /// captured with a single atomic load and pinned with an atomic add.
    pub(crate) fn begin(core: &Arc<Self>, parent: Option<&CancelToken>) -> Transaction<K, V> {
        let id = TransactionId::new(core.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1);

        // The load synchronizes with the store in `commit`: every write that
        // produced this version is visible to the new transaction.
        let snapshot = core.current.load_full();
        snapshot.pin();

        let cancel = match parent {
            Some(parent) => parent.child(),
            None => CancelToken::new(),
        };

        let meta = Arc::new(TxMeta {
            id,
            snapshot_id: snapshot.id(),
            wait_for: AtomicU64::new(0),
            cancel: cancel.clone(),
        });
        core.active_txs.write().insert(id, meta);
        core.stats.record_transaction_start();

        Transaction::new(id, snapshot, cancel, Arc::clone(core))
    }

    /// The commit critical section. O(|writes|) plus the cost of cloning the
    /// current map.
    ///
    /// A mutex rather than a CAS retry loop: with a non-trivial clone cost a
    /// CAS loop can livelock under write contention, while the mutex keeps
    /// forward progress bounded.
    pub(crate) fn commit(
        &self,
        id: TransactionId,
        snapshot: &Version<K, V>,
        writes: HashMap<K, VersionedValue<V>>,
    ) -> TxResult<()> {
        let _guard = self.commit_mu.lock();
        let current = self.current.load_full();

        // A key conflicts when the current version carries a writer stamp
        // that differs from the one in our snapshot, including the case
        // where the key did not exist in the snapshot at all. A key absent
        // from the current version has never been written and cannot
        // conflict.
        for key in writes.keys() {
            if let Some(entry) = current.get(key) {
                let snapshot_writer = snapshot.get(key).map(|e| e.writer);
                if snapshot_writer != Some(entry.writer) {
                    self.stats.record_commit_conflict();
                    return Err(TxError::Conflict);
                }
            }
        }

        let written = writes.len();
        let mut data = current.clone_data();
        for (key, entry) in writes {
            data.insert(key, entry);
        }

        let version_id = VersionId::new(self.next_version_id.fetch_add(1, Ordering::SeqCst) + 1);
        let new_version = Arc::new(Version::new(version_id, data));

        // Release store; paired with the acquire load in `begin`.
        self.current.store(Arc::clone(&new_version));
        self.versions.lock().push(new_version);

        self.stats.record_transaction_commit();
        debug!(tx = %id, version = %version_id, written, "committed transaction");
        Ok(())
    }
}

/// A background worker stopped by dropping its channel sender.
struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

fn spawn_ticker(name: &str, interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Worker {
    let (stop, wake): (Sender<()>, Receiver<()>) = mpsc::channel();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || loop {
            match wake.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => tick(),
                _ => return,
            }
        })
        .expect("failed to spawn background thread");
    Worker { stop, handle }
}

/// A transactional in-memory key/value map with snapshot isolation.
///
/// Readers never block writers and writers never block readers. A
/// transaction reads a coherent point-in-time view of the map, buffers its
/// writes privately, and commits them atomically; write-write conflicts with
/// concurrent transactions surface as [`TxError::Conflict`] at commit.
///
/// Two background workers run on configurable intervals: a reclaimer that
/// collects versions no longer visible to any active or future reader, and a
/// deadlock detector that scans the wait-for graph and aborts the youngest
/// transaction in a cycle. [`SnapMap::close`] stops both; dropping the map
/// closes it.
///
/// # Example
///
/// ```
/// use snapmap_core::SnapMap;
///
/// let map: SnapMap<String, i32> = SnapMap::new();
///
/// let mut tx = map.begin();
/// tx.put("balance".to_string(), 100)?;
/// tx.commit()?;
///
/// let mut reader = map.begin();
/// assert_eq!(reader.get(&"balance".to_string()), Some(100));
/// reader.rollback();
///
/// map.close();
/// # Ok::<(), snapmap_core::TxError>(())
/// ```
pub struct SnapMap<K, V> {
    core: Arc<MapCore<K, V>>,
    config: Config,
    workers: Mutex<Vec<Worker>>,
}

impl<K, V> SnapMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a map with the default configuration and starts the
    /// background workers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a map with a custom configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        let core = Arc::new(MapCore::new());

        let gc = {
            let core = Arc::clone(&core);
            spawn_ticker("snapmap-gc", config.gc_interval, move || {
                core.collect_versions();
            })
        };
        let detector = {
            let core = Arc::clone(&core);
            spawn_ticker(
                "snapmap-deadlock",
                config.deadlock_check_interval,
                move || {
                    core.detect_deadlocks();
                },
            )
        };

        Self {
            core,
            config,
            workers: Mutex::new(vec![gc, detector]),
        }
    }

    /// Begins a transaction on the current version.
    #[must_use]
    pub fn begin(&self) -> Transaction<K, V> {
        MapCore::begin(&self.core, None)
    }

    /// Begins a transaction whose cancellation token is derived from the
    /// caller's.
    ///
    /// When `parent` fires, the transaction's next `put` or `commit` reports
    /// the cancellation and rolls the transaction back.
    #[must_use]
    pub fn begin_with_cancel(&self, parent: &CancelToken) -> Transaction<K, V> {
        MapCore::begin(&self.core, Some(parent))
    }

    /// Returns the number of entries in the current version.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.current.load_full().len()
    }

    /// Checks whether the current version is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> SnapMap<K, V> {
    /// Returns the number of live versions. Diagnostic; bounded over time by
    /// the reclaimer.
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.core.version_count()
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_transaction_count(&self) -> usize {
        self.core.active_transaction_count()
    }

    /// Returns the map's runtime counters.
    #[must_use]
    pub fn stats(&self) -> &MapStats {
        &self.core.stats
    }

    /// Returns the map's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops the background workers and blocks until they exit.
    ///
    /// Idempotent. Transactions already begun remain usable; no further
    /// reclamation or deadlock detection happens.
    pub fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let Worker { stop, handle } = worker;
            drop(stop);
            let _ = handle.join();
        }
    }
}

impl<K, V> Default for SnapMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for SnapMap<K, V> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K, V> std::fmt::Debug for SnapMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapMap")
            .field("versions", &self.version_count())
            .field("active_transactions", &self.active_transaction_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use std::sync::mpsc;
    use std::time::Duration;

    fn create_map() -> SnapMap<String, i32> {
        SnapMap::with_config(Config::new().gc_interval(Duration::from_millis(25)))
    }

    #[test]
    fn no_read_skew() {
        let map = create_map();

        let mut setup = map.begin();
        setup.put("balance".to_string(), 100).unwrap();
        setup.commit().unwrap();

        // A long-running reader opened before the writer commits.
        let mut reader = map.begin();

        let mut writer = map.begin();
        writer.put("balance".to_string(), 200).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.get(&"balance".to_string()), Some(100));
        reader.rollback();

        // A fresh transaction sees the new value.
        let mut fresh = map.begin();
        assert_eq!(fresh.get(&"balance".to_string()), Some(200));
    }

    #[test]
    fn repeatable_read() {
        let map = create_map();

        let mut setup = map.begin();
        setup.put("k".to_string(), 1).unwrap();
        setup.commit().unwrap();

        let mut reader = map.begin();
        let first = reader.get(&"k".to_string());

        let mut writer = map.begin();
        writer.put("k".to_string(), 2).unwrap();
        writer.commit().unwrap();

        let second = reader.get(&"k".to_string());
        assert_eq!(first, second);
    }

    #[test]
    fn write_write_conflict() {
        let map = create_map();

        let mut tx1 = map.begin();
        let mut tx2 = map.begin();

        tx1.put("counter".to_string(), 1).unwrap();
        tx2.put("counter".to_string(), 2).unwrap();

        tx1.commit().unwrap();

        let err = tx2.commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(map.stats().commit_conflicts(), 1);
    }

    #[test]
    fn disjoint_writes_do_not_conflict() {
        let map = create_map();

        let mut tx1 = map.begin();
        let mut tx2 = map.begin();

        tx1.put("a".to_string(), 1).unwrap();
        tx2.put("b".to_string(), 2).unwrap();

        tx1.commit().unwrap();
        tx2.commit().unwrap();

        let mut reader = map.begin();
        assert_eq!(reader.get(&"a".to_string()), Some(1));
        assert_eq!(reader.get(&"b".to_string()), Some(2));
    }

    #[test]
    fn rewrite_of_unchanged_key_does_not_conflict() {
        let map = create_map();

        let mut setup = map.begin();
        setup.put("k".to_string(), 1).unwrap();
        setup.commit().unwrap();

        // Writes a key that existed in its snapshot; the stamp matches, so
        // there is no conflict even though the entry carries a writer ID.
        let mut tx = map.begin();
        tx.put("k".to_string(), 2).unwrap();
        tx.commit().unwrap();

        let mut reader = map.begin();
        assert_eq!(reader.get(&"k".to_string()), Some(2));
    }

    #[test]
    fn version_ids_respect_commit_order() {
        let map = create_map();

        for i in 0..5 {
            let mut tx = map.begin();
            tx.put("k".to_string(), i).unwrap();
            tx.commit().unwrap();
        }

        let versions = map.core.versions.lock();
        let ids: Vec<u64> = versions.iter().map(|v| v.id().as_u64()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(*ids.last().unwrap(), 5);
    }

    #[test]
    fn readers_do_not_block_writers() {
        let map = Arc::new(create_map());

        // 100 long-lived readers holding their snapshots.
        let mut readers = Vec::new();
        for _ in 0..100 {
            let map = Arc::clone(&map);
            readers.push(thread::spawn(move || {
                let mut tx = map.begin();
                let _ = tx.get(&"key".to_string());
                thread::sleep(Duration::from_millis(50));
                tx.rollback();
            }));
        }

        let (done_tx, done_rx) = mpsc::channel();
        let writer_map = Arc::clone(&map);
        let writer = thread::spawn(move || {
            let mut tx = writer_map.begin();
            tx.put("key".to_string(), 42).unwrap();
            tx.commit().unwrap();
            done_tx.send(()).unwrap();
        });

        // The writer must finish while the readers are still sleeping.
        done_rx
            .recv_timeout(Duration::from_millis(25))
            .expect("writer was blocked by readers");

        writer.join().unwrap();
        for handle in readers {
            handle.join().unwrap();
        }
    }

    #[test]
    fn version_count_stays_bounded() {
        let map = create_map();

        for i in 0..1000 {
            let mut tx = map.begin();
            tx.put("key".to_string(), i).unwrap();
            tx.commit().unwrap();
        }

        // Give the reclaimer a few ticks at the 25 ms test interval.
        thread::sleep(Duration::from_millis(250));

        let count = map.version_count();
        assert!(count <= 5, "version leak: {count} versions still alive");
        assert!(map.stats().versions_reclaimed() > 0);
    }

    #[test]
    fn read_your_own_writes_without_commit() {
        let map = create_map();

        let mut tx = map.begin();
        tx.put("x".to_string(), 42).unwrap();
        assert_eq!(tx.get(&"x".to_string()), Some(42));
        tx.rollback();

        let mut reader = map.begin();
        assert_eq!(reader.get(&"x".to_string()), None);
    }

    #[test]
    fn idempotent_rollback_releases_pin_once() {
        let map = create_map();

        let snapshot = map.core.current.load_full();
        let pins_before = snapshot.pin_count();

        let mut tx = map.begin();
        tx.rollback();
        tx.rollback();
        assert_eq!(tx.commit(), Err(TxError::TxDone));

        assert_eq!(snapshot.pin_count(), pins_before);
    }

    #[test]
    fn parent_cancellation_reaches_transaction() {
        let map = create_map();
        let parent = CancelToken::new();

        let mut tx = map.begin_with_cancel(&parent);
        parent.cancel(CancelReason::Caller);

        assert_eq!(
            tx.put("x".to_string(), 1),
            Err(TxError::Canceled {
                reason: CancelReason::Caller
            })
        );
        assert_eq!(map.active_transaction_count(), 0);
    }

    #[test]
    fn deadlock_victim_is_youngest() {
        let map = SnapMap::<String, i32>::with_config(
            Config::new().deadlock_check_interval(Duration::from_millis(10)),
        );

        let mut tx1 = map.begin();
        let mut tx2 = map.begin();

        // Wire a two-cycle in the wait-for graph by hand.
        {
            let txs = map.core.active_txs.read();
            txs[&tx1.id()]
                .wait_for
                .store(tx2.id().as_u64(), Ordering::SeqCst);
            txs[&tx2.id()]
                .wait_for
                .store(tx1.id().as_u64(), Ordering::SeqCst);
        }

        // Wait for the detector to fire the victim's token.
        thread::sleep(Duration::from_millis(100));

        assert_eq!(tx2.put("x".to_string(), 1), Err(TxError::Deadlock));
        assert!(tx1.put("x".to_string(), 1).is_ok());
        assert_eq!(map.stats().deadlocks_resolved(), 1);

        tx1.rollback();
    }

    #[test]
    fn close_is_idempotent() {
        let map = create_map();
        map.close();
        map.close();

        // The map stays usable for transactions after close.
        let mut tx = map.begin();
        tx.put("x".to_string(), 1).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn len_tracks_current_version() {
        let map = create_map();
        assert!(map.is_empty());

        let mut tx = map.begin();
        tx.put("a".to_string(), 1).unwrap();
        tx.put("b".to_string(), 2).unwrap();
        tx.commit().unwrap();

        assert_eq!(map.len(), 2);
    }

    #[test]
    fn stats_track_lifecycle() {
        let map = create_map();

        let mut tx = map.begin();
        tx.put("x".to_string(), 1).unwrap();
        tx.commit().unwrap();

        let mut rolled = map.begin();
        rolled.rollback();

        let snap = map.stats().snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_rolled_back, 1);
    }

    #[test]
    fn debug_impl() {
        let map = create_map();
        let rendered = format!("{map:?}");
        assert!(rendered.contains("SnapMap"));
        assert!(rendered.contains("versions"));
    }
}
