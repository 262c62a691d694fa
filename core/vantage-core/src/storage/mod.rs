//! The key-value storage substrate.
//!
//! Everything above this module sees ordered byte-keyed stores with prefix
//! scans, MVCC read snapshots and exclusive serializable write transactions.
//! The substrate is backed by redb: plain stores are tables, duplicate-key
//! stores are multimap tables, and a store's lifetime (create / truncate /
//! drop) is managed through the owning transaction.

mod cursor;
mod env;
mod keys;
mod tx;

pub use cursor::{SnapshotCursor, TxCursor, TxDupCursor};
pub use env::{DB_VERSION, StorageEnv};
pub use keys::{decode_tuple_id, encode_tuple_id, prefix_end};
pub use tx::StorageTx;
