use anyhow::Result;

use ferndb::database::DatabaseError;
use ferndb::index::IndexError;
use ferndb::query::{EngineError, Response};

mod common;

#[test]
fn test_statement_round_trip_on_both_index_kinds() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();

    for (kind, table) in [("hash", "h"), ("btree", "b")] {
        session.execute_line(&format!("create {} table {}", kind, table))?;
        session.execute_line(&format!("insert 1 10 into {}", table))?;
        session.execute_line(&format!("insert 2 20 into {}", table))?;

        match session.execute_line(&format!("find 1 from {}", table))? {
            Response::Entry(e) => assert_eq!((e.key, e.value), (1, 10)),
            other => panic!("{:?}", other),
        }

        session.execute_line(&format!("update {} 1 11", table))?;
        match session.execute_line(&format!("find 1 from {}", table))? {
            Response::Entry(e) => assert_eq!(e.value, 11),
            other => panic!("{:?}", other),
        }

        session.execute_line(&format!("delete 1 from {}", table))?;
        match session.execute_line(&format!("find 1 from {}", table)) {
            Err(EngineError::Index(IndexError::NotFound)) => {}
            other => panic!("{:?}", other.map(|_| ())),
        }

        match session.execute_line(&format!("select from {}", table))? {
            Response::Entries(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].key, 2);
            }
            other => panic!("{:?}", other),
        }
    }
    Ok(())
}

#[test]
fn test_duplicate_insert_reported() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();
    session.execute_line("create btree table t")?;
    session.execute_line("insert 1 10 into t")?;
    match session.execute_line("insert 1 99 into t") {
        Err(EngineError::Recovery(_)) | Err(EngineError::Index(IndexError::Duplicate)) => {}
        other => panic!("{:?}", other.map(|_| ())),
    }
    // The failed auto-transaction rolled back; the original value
    // is intact and the key remains usable.
    match session.execute_line("find 1 from t")? {
        Response::Entry(e) => assert_eq!(e.value, 10),
        other => panic!("{:?}", other),
    }
    session.execute_line("update t 1 12")?;
    Ok(())
}

#[test]
fn test_range_on_btree_and_rejected_on_hash() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();
    session.execute_line("create btree table b")?;
    session.execute_line("create hash table h")?;
    for key in 0..20 {
        session.execute_line(&format!("insert {} {} into b", key, key))?;
        session.execute_line(&format!("insert {} {} into h", key, key))?;
    }

    match session.execute_line("range 5 10 from b")? {
        Response::Entries(entries) => {
            let keys: Vec<i64> = entries.iter().map(|e| e.key).collect();
            assert_eq!(keys, vec![5, 6, 7, 8, 9]);
        }
        other => panic!("{:?}", other),
    }
    match session.execute_line("range 10 5 from b")? {
        Response::Entries(entries) => assert!(entries.is_empty()),
        other => panic!("{:?}", other),
    }
    assert!(matches!(
        session.execute_line("range 5 10 from h"),
        Err(EngineError::Unsupported(_))
    ));
    Ok(())
}

#[test]
fn test_missing_table_reported() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();
    for statement in ["insert 1 2 into ghost", "find 1 from ghost", "select from ghost"] {
        match session.execute_line(statement) {
            Err(EngineError::Database(DatabaseError::TableNotFound(name))) => {
                assert_eq!(name, "ghost")
            }
            Err(EngineError::Recovery(_)) => {}
            other => panic!("{} -> {:?}", statement, other.map(|_| ())),
        }
    }
    Ok(())
}

#[test]
fn test_duplicate_table_rejected() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();
    session.execute_line("create hash table t")?;
    assert!(matches!(
        session.execute_line("create btree table t"),
        Err(EngineError::Database(DatabaseError::TableExists(_)))
    ));
    Ok(())
}

#[test]
fn test_explicit_transaction_spans_statements() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();
    session.execute_line("create btree table t")?;
    session.execute_line("transaction begin")?;
    session.execute_line("insert 1 10 into t")?;
    session.execute_line("insert 2 20 into t")?;
    session.execute_line("update t 1 11")?;
    session.execute_line("transaction commit")?;

    match session.execute_line("select from t")? {
        Response::Entries(entries) => {
            let got: Vec<(i64, i64)> = entries.iter().map(|e| (e.key, e.value)).collect();
            assert_eq!(got, vec![(1, 11), (2, 20)]);
        }
        other => panic!("{:?}", other),
    }
    Ok(())
}
