use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::RwLock;
use thiserror::Error;

use crate::index::{create_index, open_index, Index, IndexError, IndexKind};
use crate::storage::pager::NUM_FRAMES;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("table {0} already exists")]
    TableExists(String),

    #[error("table {0} not found")]
    TableNotFound(String),

    #[error("invalid table name: {0}")]
    InvalidName(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A directory of tables. Each table is one index backed by
/// `<dir>/<name>.db` plus a `<name>.meta` sidecar describing how to
/// reopen it.
pub struct Database {
    base_path: PathBuf,
    /// Buffer pool frames per table pager.
    frames: usize,
    tables: RwLock<HashMap<String, Arc<dyn Index>>>,
}

impl Database {
    /// Open the database directory with the default buffer pool
    /// size, reopening every table found in it.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        Self::open_with_frames(base_path, NUM_FRAMES)
    }

    pub fn open_with_frames(
        base_path: impl AsRef<Path>,
        frames: usize,
    ) -> Result<Self, DatabaseError> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        let mut tables: HashMap<String, Arc<dyn Index>> = HashMap::new();
        for entry in std::fs::read_dir(&base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let db_path = base_path.join(format!("{}.db", name));
            let index = open_index(&name, &db_path, &path, frames)?;
            tables.insert(name, index);
        }
        info!("database open: {} ({} tables)", base_path.display(), tables.len());
        Ok(Self { base_path, frames, tables: RwLock::new(tables) })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create a new table of `kind`.
    pub fn create_table(&self, kind: IndexKind, name: &str) -> Result<Arc<dyn Index>, DatabaseError> {
        if name.is_empty() || name.contains(['/', '.', ',']) || name.contains(char::is_whitespace) {
            return Err(DatabaseError::InvalidName(name.to_string()));
        }
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(DatabaseError::TableExists(name.to_string()));
        }
        let db_path = self.base_path.join(format!("{}.db", name));
        let meta_path = self.base_path.join(format!("{}.meta", name));
        let index = create_index(kind, name, &db_path, &meta_path, self.frames)?;
        tables.insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<dyn Index>, DatabaseError> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::TableNotFound(name.to_string()))
    }

    pub fn tables(&self) -> Vec<Arc<dyn Index>> {
        self.tables.read().values().cloned().collect()
    }

    /// Persist every table's meta and flush every dirty page.
    pub fn flush_all(&self) -> Result<(), DatabaseError> {
        for table in self.tables() {
            table.flush()?;
        }
        Ok(())
    }

    /// Flush and release every table.
    pub fn close(&self) -> Result<(), DatabaseError> {
        for table in self.tables() {
            table.close()?;
        }
        Ok(())
    }
}
