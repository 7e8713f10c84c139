//! ferndb: a single-node, disk-backed key/value engine.
//!
//! Two interchangeable primary indexes (extendible hash and B+-tree)
//! sit over a fixed-size page cache. Transactions take strict
//! two-phase per-key locks with waits-for deadlock detection, and a
//! write-ahead log with checkpoints drives undo/redo crash recovery.

pub mod common;
pub mod concurrency;
pub mod database;
pub mod index;
pub mod query;
pub mod recovery;
pub mod storage;

pub use common::types::Entry;
pub use concurrency::{LockManager, LockMode, TransactionManager};
pub use database::Database;
pub use index::{BTreeIndex, HashTable, Index, IndexKind};
pub use query::{Engine, Session};
pub use recovery::RecoveryManager;
pub use storage::Pager;
