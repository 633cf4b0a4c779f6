//! # snapmap
//!
//! A transactional in-memory key/value map with snapshot isolation and
//! optimistic write-write conflict detection.
//!
//! This crate provides:
//! - **Snapshot isolation**: every transaction reads a coherent point-in-time
//!   view captured at `begin`; concurrent commits are never visible to it.
//! - **Lock-free reads**: readers never block writers and writers never block
//!   readers; snapshot acquisition is a single atomic load.
//! - **Optimistic commits**: writes are buffered privately and applied
//!   atomically; write-write conflicts surface as [`TxError::Conflict`].
//! - **Version reclamation**: a background worker collects versions no longer
//!   visible to any active or future reader.
//! - **Deadlock detection**: a background worker scans the wait-for graph and
//!   aborts the youngest transaction in a cycle.
//!
//! ## Isolation model
//!
//! Commits serialize through a single mutex whose critical section is linear
//! in the write-set size: it validates that no key in the write set was
//! overwritten since the transaction's snapshot, then publishes a freshly
//! cloned version as current. Reads within a transaction are repeatable and
//! see the transaction's own writes. Write skew is an accepted anomaly:
//! read sets are tracked but not validated.
//!
//! Keys need `Eq + Hash + Clone`; values are opaque and shallow-cloned.
//! Transactions belong to a single thread of control, like a database
//! connection; the map itself is freely shared.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod deadlock;
mod error;
mod gc;
mod map;
mod stats;
mod transaction;
mod types;
mod version;

pub use cancel::{CancelReason, CancelToken};
pub use config::Config;
pub use error::{TxError, TxResult};
pub use map::SnapMap;
pub use stats::{MapStats, StatsSnapshot};
pub use transaction::{Transaction, TransactionState};
pub use types::{TransactionId, VersionId};
