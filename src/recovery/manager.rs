use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::ClientId;
use crate::concurrency::lock_manager::LockMode;
use crate::concurrency::transaction::{TransactionError, TransactionManager};
use crate::database::{Database, DatabaseError};
use crate::index::{IndexError, IndexKind};
use crate::recovery::log_record::{EditAction, LogRecord, LogRecordError};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt log: {0}")]
    Corruption(String),

    #[error("log record error: {0}")]
    Record(#[from] LogRecordError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

struct RecoveryInner {
    file: File,
    /// Per-transaction record stacks, walked backwards by rollback.
    tx_stack: HashMap<ClientId, Vec<LogRecord>>,
}

/// Write-ahead log plus checkpoint/undo/redo recovery.
///
/// Every append is fsync'd before it returns, so a record is durable
/// before its mutation can reach a commit. The transactional write
/// path (`insert_logged` and friends) acquires the resource lock,
/// applies the index operation, then appends the edit record; undo
/// drives the same path so compensation is itself logged and replay
/// stays convergent.
pub struct RecoveryManager {
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    log_path: PathBuf,
    inner: Mutex<RecoveryInner>,
}

impl RecoveryManager {
    pub fn new(
        db: Arc<Database>,
        tm: Arc<TransactionManager>,
        log_path: impl AsRef<Path>,
    ) -> Result<Self, RecoveryError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(log_path.as_ref())?;
        Ok(Self {
            db,
            tm,
            log_path: log_path.as_ref().to_path_buf(),
            inner: Mutex::new(RecoveryInner { file, tx_stack: HashMap::new() }),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn append(inner: &mut RecoveryInner, record: &LogRecord) -> Result<(), RecoveryError> {
        writeln!(inner.file, "{}", record)?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Log a table creation.
    pub fn table(&self, kind: IndexKind, name: &str) -> Result<(), RecoveryError> {
        let mut inner = self.inner.lock();
        Self::append(&mut inner, &LogRecord::Table { kind, name: name.to_string() })
    }

    /// Log a transaction start and open its record stack.
    pub fn start(&self, id: ClientId) -> Result<(), RecoveryError> {
        let mut inner = self.inner.lock();
        let record = LogRecord::Start { id };
        inner.tx_stack.insert(id, vec![record.clone()]);
        Self::append(&mut inner, &record)
    }

    /// Log an edit; pushed onto the transaction's stack when one is
    /// open (recovery-time compensation edits have none).
    pub fn edit(
        &self,
        id: ClientId,
        table: &str,
        action: EditAction,
        key: i64,
        oldval: i64,
        newval: i64,
    ) -> Result<(), RecoveryError> {
        let mut inner = self.inner.lock();
        let record = LogRecord::Edit { id, table: table.to_string(), action, key, oldval, newval };
        if let Some(stack) = inner.tx_stack.get_mut(&id) {
            stack.push(record.clone());
        }
        Self::append(&mut inner, &record)
    }

    /// Log a commit and discard the transaction's stack.
    pub fn commit(&self, id: ClientId) -> Result<(), RecoveryError> {
        let mut inner = self.inner.lock();
        inner.tx_stack.remove(&id);
        Self::append(&mut inner, &LogRecord::Commit { id })
    }

    /// Flush everything and write a checkpoint record, then snapshot
    /// the database directory so startup can roll forward from a
    /// known-good image.
    pub fn checkpoint(&self) -> Result<(), RecoveryError> {
        let mut inner = self.inner.lock();
        let ids: Vec<ClientId> = inner.tx_stack.keys().copied().collect();
        // Each flush quiesces its own table: index latch, then the
        // pager's eviction gate, then the flush itself.
        for table in self.db.tables() {
            table.flush()?;
        }
        Self::append(&mut inner, &LogRecord::Checkpoint { ids })?;
        self.snapshot()?;
        info!("checkpoint complete ({} active transactions)", inner.tx_stack.len());
        Ok(())
    }

    /// Copy the database directory to its `-recovery` sibling.
    fn snapshot(&self) -> Result<(), RecoveryError> {
        let base = self.db.base_path();
        let snapshot = recovery_dir(base);
        if snapshot.exists() {
            std::fs::remove_dir_all(&snapshot)?;
        }
        copy_dir(base, &snapshot)?;
        Ok(())
    }

    // ---- transactional write path ----

    /// Insert through locks and the log: X-lock the key, apply, then
    /// append the edit record.
    pub fn insert_logged(
        &self,
        id: ClientId,
        table_name: &str,
        key: i64,
        value: i64,
    ) -> Result<(), RecoveryError> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(id, table_name, key, LockMode::Exclusive)?;
        table.insert(key, value)?;
        self.edit(id, table_name, EditAction::Insert, key, 0, value)
    }

    pub fn update_logged(
        &self,
        id: ClientId,
        table_name: &str,
        key: i64,
        value: i64,
    ) -> Result<(), RecoveryError> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(id, table_name, key, LockMode::Exclusive)?;
        let old = table.find(key)?.value;
        table.update(key, value)?;
        self.edit(id, table_name, EditAction::Update, key, old, value)
    }

    pub fn delete_logged(
        &self,
        id: ClientId,
        table_name: &str,
        key: i64,
    ) -> Result<(), RecoveryError> {
        let table = self.db.get_table(table_name)?;
        self.tm.lock(id, table_name, key, LockMode::Exclusive)?;
        let old = table.find(key)?.value;
        table.delete(key)?;
        self.edit(id, table_name, EditAction::Delete, key, old, 0)
    }

    // ---- replay ----

    /// Reapply a table or edit record through the plain database
    /// path. Redo is idempotent: an insert that collides falls
    /// through to an update, an update on a missing key falls through
    /// to an insert.
    fn redo(&self, record: &LogRecord) -> Result<(), RecoveryError> {
        match record {
            LogRecord::Table { kind, name } => match self.db.create_table(*kind, name) {
                Ok(_) | Err(DatabaseError::TableExists(_)) => Ok(()),
                Err(e) => Err(e.into()),
            },
            LogRecord::Edit { table, action, key, newval, .. } => {
                let table = self.db.get_table(table)?;
                match action {
                    EditAction::Insert => match table.insert(*key, *newval) {
                        Ok(()) => Ok(()),
                        Err(IndexError::Duplicate) => Ok(table.update(*key, *newval)?),
                        Err(e) => Err(e.into()),
                    },
                    EditAction::Update => match table.update(*key, *newval) {
                        Ok(()) => Ok(()),
                        Err(IndexError::NotFound) => Ok(table.insert(*key, *newval)?),
                        Err(e) => Err(e.into()),
                    },
                    EditAction::Delete => Ok(table.delete(*key)?),
                }
            }
            _ => Err(RecoveryError::Corruption("can only redo table and edit records".to_string())),
        }
    }

    /// Apply the inverse of an edit through the transactional path,
    /// so the compensation is logged too.
    fn undo(&self, record: &LogRecord) -> Result<(), RecoveryError> {
        match record {
            LogRecord::Edit { id, table, action, key, oldval, .. } => match action {
                EditAction::Insert => self.delete_logged(*id, table, *key),
                EditAction::Update => self.update_logged(*id, table, *key, *oldval),
                EditAction::Delete => self.insert_logged(*id, table, *key, *oldval),
            },
            _ => Err(RecoveryError::Corruption("can only undo edit records".to_string())),
        }
    }

    fn read_log(&self) -> Result<Vec<LogRecord>, RecoveryError> {
        let content = std::fs::read_to_string(&self.log_path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.parse().map_err(RecoveryError::from))
            .collect()
    }

    fn begin_tolerant(&self, id: ClientId) -> Result<(), RecoveryError> {
        match self.tm.begin(id) {
            Ok(()) | Err(TransactionError::AlreadyRunning) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Full startup recovery: redo everything since the last
    /// checkpoint, then walk backwards undoing every transaction
    /// without a commit record.
    pub fn recover(&self) -> Result<(), RecoveryError> {
        let records = self.read_log()?;
        let checkpoint_pos = records
            .iter()
            .rposition(|r| matches!(r, LogRecord::Checkpoint { .. }))
            .unwrap_or(0);

        let mut undo_set: HashSet<ClientId> = HashSet::new();
        if let Some(LogRecord::Checkpoint { ids }) = records.get(checkpoint_pos) {
            for &id in ids {
                undo_set.insert(id);
                self.begin_tolerant(id)?;
            }
        }

        for record in &records[checkpoint_pos..] {
            match record {
                LogRecord::Start { id } => {
                    undo_set.insert(*id);
                    self.begin_tolerant(*id)?;
                }
                LogRecord::Edit { .. } | LogRecord::Table { .. } => self.redo(record)?,
                LogRecord::Commit { id } => {
                    undo_set.remove(id);
                    self.tm.commit(*id)?;
                }
                LogRecord::Checkpoint { .. } => {}
            }
        }
        debug!("recovery: {} transaction(s) to undo", undo_set.len());

        for record in records.iter().rev() {
            if undo_set.is_empty() {
                break;
            }
            match record {
                LogRecord::Edit { id, .. } if undo_set.contains(id) => self.undo(record)?,
                LogRecord::Start { id } if undo_set.contains(id) => {
                    undo_set.remove(id);
                    self.commit(*id)?;
                    self.tm.commit(*id)?;
                }
                _ => {}
            }
        }
        info!("recovery complete");
        Ok(())
    }

    /// Roll back one live transaction by undoing its stack from the
    /// most recent record down to (but excluding) the start record,
    /// then committing.
    pub fn rollback(&self, id: ClientId) -> Result<(), RecoveryError> {
        let stack = self.inner.lock().tx_stack.get(&id).cloned().unwrap_or_default();
        if stack.is_empty() {
            self.commit(id)?;
            self.tm.commit(id)?;
            return Ok(());
        }
        if !matches!(stack[0], LogRecord::Start { .. }) {
            return Err(TransactionError::ProtocolViolation(
                "rollback on a transaction that did not begin with a start record".to_string(),
            )
            .into());
        }
        for record in stack[1..].iter().rev() {
            self.undo(record)?;
        }
        self.commit(id)?;
        self.tm.commit(id)?;
        Ok(())
    }
}

/// The sibling directory holding the last checkpoint's snapshot.
pub fn recovery_dir(base: &Path) -> PathBuf {
    let name = base
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}-recovery", name))
}

/// Default log file location: a sibling of the database directory,
/// outside it so checkpoint snapshots never capture the log.
pub fn log_path(base: &Path) -> PathBuf {
    let name = base
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}.log", name))
}

/// Prime the database directory before opening it: if a recovery
/// snapshot exists, discard the directory and restore the snapshot so
/// startup rolls forward from the last checkpoint image.
pub fn prime(base: &Path) -> Result<(), RecoveryError> {
    let snapshot = recovery_dir(base);
    if !base.exists() {
        std::fs::create_dir_all(&snapshot)?;
        return Ok(());
    }
    if !snapshot.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(base)?;
    copy_dir(&snapshot, base)?;
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
