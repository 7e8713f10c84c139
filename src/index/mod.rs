pub mod btree;
pub mod hash;

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{Entry, PageNum};
use crate::storage::pager::{Pager, PagerError};

pub use btree::BTreeIndex;
pub use hash::HashTable;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("key not found")]
    NotFound,

    #[error("cannot insert existing key")]
    Duplicate,

    #[error("hash directory depth limit exceeded")]
    DepthLimit,

    #[error("corrupt index: {0}")]
    Corruption(String),

    #[error("pager error: {0}")]
    Pager(#[from] PagerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The two interchangeable primary index kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Hash,
    BTree,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Hash => write!(f, "hash"),
            IndexKind::BTree => write!(f, "btree"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hash" => Ok(IndexKind::Hash),
            "btree" => Ok(IndexKind::BTree),
            other => Err(IndexError::Corruption(format!("unknown index kind: {}", other))),
        }
    }
}

/// Sidecar metadata persisted next to each index's page file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexMeta {
    Hash { global_depth: i64, buckets: Vec<PageNum> },
    BTree { root_pn: PageNum },
}

impl IndexMeta {
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexMeta::Hash { .. } => IndexKind::Hash,
            IndexMeta::BTree { .. } => IndexKind::BTree,
        }
    }

    pub fn read_from(path: &Path) -> Result<Self, IndexError> {
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes)
            .map_err(|e| IndexError::Corruption(format!("bad meta file {}: {}", path.display(), e)))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), IndexError> {
        let bytes = bincode::serialize(self)
            .map_err(|e| IndexError::Corruption(format!("meta encode: {}", e)))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// Common surface of both index kinds. Keys and values are `i64`;
/// keys are unique within an index.
pub trait Index: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> IndexKind;

    fn insert(&self, key: i64, value: i64) -> Result<(), IndexError>;
    fn update(&self, key: i64, value: i64) -> Result<(), IndexError>;
    fn delete(&self, key: i64) -> Result<(), IndexError>;
    fn find(&self, key: i64) -> Result<Entry, IndexError>;
    fn select(&self) -> Result<Vec<Entry>, IndexError>;

    fn pager(&self) -> &Arc<Pager>;

    /// Downcast hook for operations only the B+-tree supports
    /// (range scans, cursors).
    fn as_btree(&self) -> Option<&BTreeIndex> {
        None
    }

    /// Persist the sidecar metadata and flush every dirty page.
    fn flush(&self) -> Result<(), IndexError>;

    /// Flush and release the backing file.
    fn close(&self) -> Result<(), IndexError>;
}

/// Create a fresh index of `kind` backed by `db_path`/`meta_path`.
pub fn create_index(
    kind: IndexKind,
    name: &str,
    db_path: &Path,
    meta_path: &Path,
    frames: usize,
) -> Result<Arc<dyn Index>, IndexError> {
    let pager = Pager::open_with_frames(db_path, frames)?;
    match kind {
        IndexKind::Hash => Ok(Arc::new(HashTable::create(name, pager, meta_path)?)),
        IndexKind::BTree => Ok(Arc::new(BTreeIndex::create(name, pager, meta_path)?)),
    }
}

/// Reopen an index from its sidecar metadata.
pub fn open_index(
    name: &str,
    db_path: &Path,
    meta_path: &Path,
    frames: usize,
) -> Result<Arc<dyn Index>, IndexError> {
    let pager = Pager::open_with_frames(db_path, frames)?;
    let meta = IndexMeta::read_from(meta_path)?;
    match meta {
        IndexMeta::Hash { global_depth, buckets } => Ok(Arc::new(HashTable::open(
            name,
            pager,
            meta_path,
            global_depth,
            buckets,
        ))),
        IndexMeta::BTree { root_pn } => {
            Ok(Arc::new(BTreeIndex::open(name, pager, meta_path, root_pn)))
        }
    }
}
