use std::fmt;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::common::types::{ClientId, Entry};
use crate::concurrency::lock_manager::LockMode;
use crate::concurrency::transaction::{TransactionError, TransactionManager};
use crate::database::{Database, DatabaseError};
use crate::index::{IndexError, IndexKind};
use crate::recovery::manager::{RecoveryError, RecoveryManager};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed statement: {0}")]
    Parse(String),

    #[error("{0}")]
    Unsupported(String),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

/// One parsed client statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable { kind: IndexKind, name: String },
    Insert { key: i64, value: i64, table: String },
    Update { table: String, key: i64, value: i64 },
    Delete { key: i64, table: String },
    Find { key: i64, table: String },
    Select { table: String },
    Range { start: i64, end: i64, table: String },
    Begin,
    Commit,
    Rollback,
    Checkpoint,
}

impl Statement {
    /// Parse the REPL's line grammar:
    ///
    /// ```text
    /// create {hash|btree} table <name>
    /// insert <key> <value> into <name>
    /// update <name> <key> <value>
    /// delete <key> from <name>
    /// find <key> from <name>
    /// select from <name>
    /// range <start> <end> from <name>
    /// transaction begin|commit|rollback
    /// .checkpoint
    /// ```
    pub fn parse(line: &str) -> Result<Statement, EngineError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let malformed = || EngineError::Parse(line.trim().to_string());
        match tokens.as_slice() {
            ["create", kind, "table", name] => {
                let kind = kind.parse().map_err(|_| malformed())?;
                Ok(Statement::CreateTable { kind, name: name.to_string() })
            }
            ["insert", key, value, "into", table] => Ok(Statement::Insert {
                key: parse_i64(key, line)?,
                value: parse_i64(value, line)?,
                table: table.to_string(),
            }),
            ["update", table, key, value] => Ok(Statement::Update {
                table: table.to_string(),
                key: parse_i64(key, line)?,
                value: parse_i64(value, line)?,
            }),
            ["delete", key, "from", table] => Ok(Statement::Delete {
                key: parse_i64(key, line)?,
                table: table.to_string(),
            }),
            ["find", key, "from", table] => Ok(Statement::Find {
                key: parse_i64(key, line)?,
                table: table.to_string(),
            }),
            ["select", "from", table] => Ok(Statement::Select { table: table.to_string() }),
            ["range", start, end, "from", table] => Ok(Statement::Range {
                start: parse_i64(start, line)?,
                end: parse_i64(end, line)?,
                table: table.to_string(),
            }),
            ["transaction", "begin"] => Ok(Statement::Begin),
            ["transaction", "commit"] => Ok(Statement::Commit),
            ["transaction", "rollback"] => Ok(Statement::Rollback),
            [".checkpoint"] => Ok(Statement::Checkpoint),
            [] => Err(malformed()),
            [command, ..] => Err(EngineError::UnknownCommand(command.to_string())),
        }
    }
}

fn parse_i64(s: &str, line: &str) -> Result<i64, EngineError> {
    s.parse().map_err(|_| EngineError::Parse(line.trim().to_string()))
}

/// What a statement produced, for the REPL to print.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Entry(Entry),
    Entries(Vec<Entry>),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => write!(f, "ok"),
            Response::Entry(e) => write!(f, "({}, {})", e.key, e.value),
            Response::Entries(entries) => {
                for e in entries {
                    writeln!(f, "({}, {})", e.key, e.value)?;
                }
                write!(f, "{} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" })
            }
        }
    }
}

/// The wired-together engine: database, transaction manager, and
/// recovery manager in the documented startup order.
pub struct Engine {
    db: Arc<Database>,
    tm: Arc<TransactionManager>,
    rm: Arc<RecoveryManager>,
}

impl Engine {
    pub fn new(db: Arc<Database>, tm: Arc<TransactionManager>, rm: Arc<RecoveryManager>) -> Self {
        Self { db, tm, rm }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn tm(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn rm(&self) -> &Arc<RecoveryManager> {
        &self.rm
    }

    pub fn session(self: &Arc<Self>) -> Session {
        Session {
            engine: Arc::clone(self),
            client_id: uuid::Uuid::new_v4(),
            in_txn: false,
        }
    }
}

/// One client's connection: a client id plus the state of its
/// explicit transaction, if any. Statements outside an explicit
/// transaction run as single-statement transactions so every
/// mutation flows through locks and the log.
pub struct Session {
    engine: Arc<Engine>,
    client_id: ClientId,
    in_txn: bool,
}

impl Session {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn in_transaction(&self) -> bool {
        self.in_txn
    }

    pub fn execute_line(&mut self, line: &str) -> Result<Response, EngineError> {
        let statement = Statement::parse(line)?;
        self.execute(statement)
    }

    pub fn execute(&mut self, statement: Statement) -> Result<Response, EngineError> {
        debug!("client {}: {:?}", self.client_id, statement);
        let engine = Arc::clone(&self.engine);
        match statement {
            Statement::CreateTable { kind, name } => {
                engine.db.create_table(kind, &name)?;
                engine.rm.table(kind, &name)?;
                Ok(Response::Ok)
            }
            Statement::Insert { key, value, table } => {
                self.mutate(|id| engine.rm.insert_logged(id, &table, key, value))?;
                Ok(Response::Ok)
            }
            Statement::Update { table, key, value } => {
                self.mutate(|id| engine.rm.update_logged(id, &table, key, value))?;
                Ok(Response::Ok)
            }
            Statement::Delete { key, table } => {
                self.mutate(|id| engine.rm.delete_logged(id, &table, key))?;
                Ok(Response::Ok)
            }
            Statement::Find { key, table } => {
                let index = engine.db.get_table(&table)?;
                if self.in_txn {
                    engine.tm.lock(self.client_id, &table, key, LockMode::Shared)?;
                }
                Ok(Response::Entry(index.find(key)?))
            }
            Statement::Select { table } => {
                let index = engine.db.get_table(&table)?;
                Ok(Response::Entries(index.select()?))
            }
            Statement::Range { start, end, table } => {
                let index = engine.db.get_table(&table)?;
                let btree = index
                    .as_btree()
                    .ok_or_else(|| Engine::range_unsupported(&table))?;
                Ok(Response::Entries(btree.range(start, end)?))
            }
            Statement::Begin => {
                if self.in_txn {
                    return Err(TransactionError::ProtocolViolation(
                        "transaction already in progress".to_string(),
                    )
                    .into());
                }
                engine.tm.begin(self.client_id)?;
                engine.rm.start(self.client_id)?;
                self.in_txn = true;
                Ok(Response::Ok)
            }
            Statement::Commit => {
                if !self.in_txn {
                    return Err(TransactionError::ProtocolViolation(
                        "commit without a transaction".to_string(),
                    )
                    .into());
                }
                engine.rm.commit(self.client_id)?;
                engine.tm.commit(self.client_id)?;
                self.in_txn = false;
                Ok(Response::Ok)
            }
            Statement::Rollback => {
                if !self.in_txn {
                    return Err(TransactionError::ProtocolViolation(
                        "rollback without a transaction".to_string(),
                    )
                    .into());
                }
                engine.rm.rollback(self.client_id)?;
                self.in_txn = false;
                Ok(Response::Ok)
            }
            Statement::Checkpoint => {
                engine.rm.checkpoint()?;
                Ok(Response::Ok)
            }
        }
    }

    /// Run one write inside the current transaction, or inside a
    /// fresh single-statement transaction that commits on success and
    /// rolls back on failure.
    fn mutate<F>(&mut self, op: F) -> Result<(), EngineError>
    where
        F: FnOnce(ClientId) -> Result<(), RecoveryError>,
    {
        if self.in_txn {
            return Ok(op(self.client_id)?);
        }
        let id = uuid::Uuid::new_v4();
        self.engine.tm.begin(id)?;
        self.engine.rm.start(id)?;
        match op(id) {
            Ok(()) => {
                self.engine.rm.commit(id)?;
                self.engine.tm.commit(id)?;
                Ok(())
            }
            Err(e) => {
                self.engine.rm.rollback(id)?;
                Err(e.into())
            }
        }
    }
}

impl Engine {
    fn range_unsupported(table: &str) -> EngineError {
        EngineError::Unsupported(format!("range requires a btree table, {} is a hash table", table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create() {
        assert_eq!(
            Statement::parse("create hash table t").unwrap(),
            Statement::CreateTable { kind: IndexKind::Hash, name: "t".to_string() }
        );
        assert_eq!(
            Statement::parse("create btree table nums").unwrap(),
            Statement::CreateTable { kind: IndexKind::BTree, name: "nums".to_string() }
        );
        assert!(Statement::parse("create wedge table t").is_err());
    }

    #[test]
    fn test_parse_dml() {
        assert_eq!(
            Statement::parse("insert 1 10 into t").unwrap(),
            Statement::Insert { key: 1, value: 10, table: "t".to_string() }
        );
        assert_eq!(
            Statement::parse("update t 1 20").unwrap(),
            Statement::Update { table: "t".to_string(), key: 1, value: 20 }
        );
        assert_eq!(
            Statement::parse("delete 1 from t").unwrap(),
            Statement::Delete { key: 1, table: "t".to_string() }
        );
        assert_eq!(
            Statement::parse("find -3 from t").unwrap(),
            Statement::Find { key: -3, table: "t".to_string() }
        );
        assert_eq!(
            Statement::parse("range 1 10 from t").unwrap(),
            Statement::Range { start: 1, end: 10, table: "t".to_string() }
        );
    }

    #[test]
    fn test_parse_transaction_forms() {
        assert_eq!(Statement::parse("transaction begin").unwrap(), Statement::Begin);
        assert_eq!(Statement::parse("transaction commit").unwrap(), Statement::Commit);
        assert_eq!(Statement::parse("transaction rollback").unwrap(), Statement::Rollback);
        assert_eq!(Statement::parse(".checkpoint").unwrap(), Statement::Checkpoint);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Statement::parse("frobnicate the database"),
            Err(EngineError::UnknownCommand(_))
        ));
        assert!(matches!(Statement::parse("insert x y into t"), Err(EngineError::Parse(_))));
        assert!(matches!(Statement::parse(""), Err(EngineError::Parse(_))));
        assert!(matches!(Statement::parse("select everything"), Err(EngineError::UnknownCommand(_))));
    }
}
