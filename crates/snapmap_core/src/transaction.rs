//! Transactions with snapshot isolation.
//!
//! A transaction reads from the snapshot captured at `begin`, accumulates
//! writes in a private buffer, and applies them atomically at commit.
//! Write-write conflicts with transactions that committed after the snapshot
//! are detected at commit time.
//!
//! A `Transaction` is owned by a single thread of control and is not meant
//! for concurrent use. The state field is atomic only so the terminal
//! transition happens at most once regardless of which path (commit,
//! rollback, drop, cancellation) fires first.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::cancel::{CancelReason, CancelToken};
use crate::error::{TxError, TxResult};
use crate::map::MapCore;
use crate::types::TransactionId;
use crate::version::{Version, VersionedValue};

/// Lifecycle state of a transaction.
///
/// Transitions are `Active -> Committed` or `Active -> RolledBack`; both are
/// mutually exclusive and happen at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The transaction can read and buffer writes.
    Active,
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
}

impl TransactionState {
    const ACTIVE: u32 = 0;
    const COMMITTED: u32 = 1;
    const ROLLED_BACK: u32 = 2;

    fn as_u32(self) -> u32 {
        match self {
            TransactionState::Active => Self::ACTIVE,
            TransactionState::Committed => Self::COMMITTED,
            TransactionState::RolledBack => Self::ROLLED_BACK,
        }
    }

    fn from_u32(raw: u32) -> Self {
        match raw {
            Self::ACTIVE => TransactionState::Active,
            Self::COMMITTED => TransactionState::Committed,
            _ => TransactionState::RolledBack,
        }
    }
}

/// A transaction over a [`SnapMap`](crate::SnapMap).
///
/// Reads see the snapshot taken at `begin` plus the transaction's own
/// buffered writes. Dropping an active transaction rolls it back.
pub struct Transaction<K, V> {
    id: TransactionId,
    snapshot: Arc<Version<K, V>>,
    writes: HashMap<K, VersionedValue<V>>,
    read_set: HashSet<K>,
    state: AtomicU32,
    cancel: CancelToken,
    map: Arc<MapCore<K, V>>,
}

impl<K, V> Transaction<K, V> {
    pub(crate) fn new(
        id: TransactionId,
        snapshot: Arc<Version<K, V>>,
        cancel: CancelToken,
        map: Arc<MapCore<K, V>>,
    ) -> Self {
        Self {
            id,
            snapshot,
            writes: HashMap::new(),
            read_set: HashSet::new(),
            state: AtomicU32::new(TransactionState::ACTIVE),
            cancel,
            map,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        TransactionState::from_u32(self.state.load(Ordering::SeqCst))
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Returns the number of buffered writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Returns the keys this transaction has observed.
    ///
    /// Tracked for a future read-set validation extension; not consulted by
    /// the current conflict check.
    pub fn read_set(&self) -> impl Iterator<Item = &K> {
        self.read_set.iter()
    }

    /// Rolls the transaction back, discarding buffered writes.
    ///
    /// Idempotent: safe to call repeatedly and after `commit`, in which case
    /// it is a no-op.
    pub fn rollback(&mut self) {
        self.rollback_inner();
    }

    fn rollback_inner(&self) {
        if !self.transition(TransactionState::Active, TransactionState::RolledBack) {
            return;
        }
        self.map.stats.record_transaction_rollback();
        self.release();
    }

    fn transition(&self, from: TransactionState, to: TransactionState) -> bool {
        self.state
            .compare_exchange(from.as_u32(), to.as_u32(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Releases resources held by the transaction: fires the token, removes
    /// the registry entry, and drops the snapshot pin. Runs exactly once,
    /// guarded by the terminal state transition.
    fn release(&self) {
        self.cancel.cancel(CancelReason::Caller);
        self.map.unregister(self.id);
        self.snapshot.unpin();
    }
}

impl<K, V> Transaction<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Returns the value visible to this transaction, or `None` if the key
    /// is absent or the transaction has completed.
    ///
    /// The write buffer has priority over the snapshot, so a transaction
    /// sees its own uncommitted writes.
    pub fn get(&mut self, key: &K) -> Option<V> {
        if !self.is_active() {
            return None;
        }

        if let Some(entry) = self.writes.get(key) {
            self.read_set.insert(key.clone());
            return Some(entry.value.clone());
        }

        if let Some(entry) = self.snapshot.get(key) {
            self.read_set.insert(key.clone());
            return Some(entry.value.clone());
        }

        None
    }

    /// Buffers a write. Not visible to other transactions until commit.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::TxDone`] if the transaction has completed, or the
    /// cancellation error (rolling the transaction back) if its token fired.
    pub fn put(&mut self, key: K, value: V) -> TxResult<()> {
        self.ensure_active()?;
        if let Some(reason) = self.cancel.reason() {
            self.rollback_inner();
            return Err(TxError::from_cancel(reason));
        }

        self.writes.insert(
            key,
            VersionedValue {
                value,
                writer: self.id,
            },
        );
        Ok(())
    }

    /// Applies the buffered writes to the map atomically.
    ///
    /// The terminal transition happens first: once a commit attempt is in
    /// flight, rollback and duplicate commits become no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Conflict`] if another transaction overwrote a key
    /// in the write set after this transaction's snapshot, [`TxError::TxDone`]
    /// if the transaction already completed, or the cancellation error if
    /// its token fired before the commit started. On any error the
    /// transaction ends in the `RolledBack` state.
    pub fn commit(&mut self) -> TxResult<()> {
        if !self.transition(TransactionState::Active, TransactionState::Committed) {
            return Err(TxError::TxDone);
        }
        let result = self.try_commit();
        self.release();
        result
    }

    fn try_commit(&mut self) -> TxResult<()> {
        if let Some(reason) = self.cancel.reason() {
            self.fail_commit();
            return Err(TxError::from_cancel(reason));
        }

        let writes = std::mem::take(&mut self.writes);
        match self.map.commit(self.id, &self.snapshot, writes) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail_commit();
                Err(err)
            }
        }
    }

    fn fail_commit(&self) {
        self.state
            .store(TransactionState::ROLLED_BACK, Ordering::SeqCst);
        self.map.stats.record_transaction_rollback();
    }

    fn ensure_active(&self) -> TxResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(TxError::TxDone)
        }
    }
}

impl<K, V> Drop for Transaction<K, V> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

impl<K, V> std::fmt::Debug for Transaction<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("snapshot", &self.snapshot.id())
            .field("write_count", &self.writes.len())
            .finish_non_exhaustive()
    }
}
