use anyhow::Result;

use ferndb::query::{EngineError, Response};
use ferndb::recovery::{log_path, LogRecord};
use ferndb::index::IndexError;

mod common;

fn find_value(engine: &std::sync::Arc<ferndb::Engine>, table: &str, key: i64) -> Result<Option<i64>> {
    let mut session = engine.session();
    match session.execute_line(&format!("find {} from {}", key, table)) {
        Ok(Response::Entry(e)) => Ok(Some(e.value)),
        Ok(other) => anyhow::bail!("unexpected response: {:?}", other),
        Err(EngineError::Index(IndexError::NotFound)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[test]
fn test_committed_survives_uncommitted_rolled_back() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut a = engine.session();
        a.execute_line("create hash table t")?;
        a.execute_line("transaction begin")?;
        a.execute_line("insert 1 10 into t")?;
        a.execute_line("transaction commit")?;

        let mut b = engine.session();
        b.execute_line("transaction begin")?;
        b.execute_line("insert 2 20 into t")?;
        // Kill without committing B and without closing the engine.
    }

    let engine = common::boot(root.path())?;
    assert_eq!(find_value(&engine, "t", 1)?, Some(10));
    assert_eq!(find_value(&engine, "t", 2)?, None);
    Ok(())
}

#[test]
fn test_rollback_restores_state_and_logs_compensation() -> Result<()> {
    let root = common::scratch()?;
    let engine = common::boot(root.path())?;
    let mut session = engine.session();
    session.execute_line("create btree table t")?;

    session.execute_line("transaction begin")?;
    session.execute_line("insert 5 50 into t")?;
    session.execute_line("update t 5 55")?;
    session.execute_line("delete 5 from t")?;
    session.execute_line("transaction rollback")?;

    assert_eq!(find_value(&engine, "t", 5)?, None);

    // The log carries the compensation edits: the rollback replays
    // the inverse operations (insert back, downgrade the update,
    // delete the insert) before the synthetic commit.
    let content = std::fs::read_to_string(log_path(&root.path().join("data")))?;
    let records: Vec<LogRecord> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.parse().unwrap())
        .collect();
    let edits = records
        .iter()
        .filter(|r| matches!(r, LogRecord::Edit { .. }))
        .count();
    assert_eq!(edits, 6, "3 forward edits + 3 compensation edits");
    assert!(matches!(records.last(), Some(LogRecord::Commit { .. })));
    Ok(())
}

#[test]
fn test_checkpoint_then_crash_restores_committed_and_undoes_active() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut d = engine.session();
        d.execute_line("create hash table t")?;
        d.execute_line("transaction begin")?;
        d.execute_line("insert 1 1 into t")?;
        d.execute_line("insert 2 2 into t")?;
        d.execute_line("transaction commit")?;

        let mut e = engine.session();
        e.execute_line("transaction begin")?;
        e.execute_line("insert 3 3 into t")?;
        engine.rm().checkpoint()?;
        // Kill with E still active.
    }

    let engine = common::boot(root.path())?;
    assert_eq!(find_value(&engine, "t", 1)?, Some(1));
    assert_eq!(find_value(&engine, "t", 2)?, Some(2));
    assert_eq!(find_value(&engine, "t", 3)?, None);
    Ok(())
}

#[test]
fn test_recovery_replays_edits_after_checkpoint() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut session = engine.session();
        session.execute_line("create btree table t")?;
        session.execute_line("insert 1 100 into t")?;
        session.execute_line(".checkpoint")?;
        session.execute_line("insert 2 200 into t")?;
        session.execute_line("update t 1 101")?;
        session.execute_line("delete 1 from t")?;
    }

    let engine = common::boot(root.path())?;
    assert_eq!(find_value(&engine, "t", 1)?, None);
    assert_eq!(find_value(&engine, "t", 2)?, Some(200));
    Ok(())
}

#[test]
fn test_checkpoint_is_idempotent() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut session = engine.session();
        session.execute_line("create hash table t")?;
        for key in 0..20 {
            session.execute_line(&format!("insert {} {} into t", key, key * 2))?;
        }
        session.execute_line(".checkpoint")?;
        session.execute_line(".checkpoint")?;
    }

    let engine = common::boot(root.path())?;
    for key in 0..20 {
        assert_eq!(find_value(&engine, "t", key)?, Some(key * 2));
    }
    Ok(())
}

#[test]
fn test_log_is_readable_line_grammar() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut session = engine.session();
        session.execute_line("create btree table nums")?;
        session.execute_line("transaction begin")?;
        session.execute_line("insert 7 70 into nums")?;
        session.execute_line("transaction commit")?;
    }

    let content = std::fs::read_to_string(log_path(&root.path().join("data")))?;
    let records: Vec<LogRecord> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.parse().expect("unparseable log line"))
        .collect();

    assert!(matches!(&records[0], LogRecord::Table { name, .. } if name == "nums"));
    let start_pos = records.iter().position(|r| matches!(r, LogRecord::Start { .. })).unwrap();
    let edit_pos = records.iter().position(|r| matches!(r, LogRecord::Edit { .. })).unwrap();
    let commit_pos = records.iter().position(|r| matches!(r, LogRecord::Commit { .. })).unwrap();
    // WAL ordering: start < edit < commit in the file.
    assert!(start_pos < edit_pos && edit_pos < commit_pos);

    if let LogRecord::Edit { table, key, newval, .. } = &records[edit_pos] {
        assert_eq!(table, "nums");
        assert_eq!(*key, 7);
        assert_eq!(*newval, 70);
    }
    Ok(())
}

#[test]
fn test_reboot_without_crash_is_clean() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut session = engine.session();
        session.execute_line("create btree table t")?;
        session.execute_line("insert 1 10 into t")?;
        engine.db().close()?;
    }
    // Two clean reboots in a row must converge on the same state.
    for _ in 0..2 {
        let engine = common::boot(root.path())?;
        assert_eq!(find_value(&engine, "t", 1)?, Some(10));
    }
    Ok(())
}

#[test]
fn test_crash_mid_transaction_with_many_edits() -> Result<()> {
    let root = common::scratch()?;
    {
        let engine = common::boot(root.path())?;
        let mut session = engine.session();
        session.execute_line("create btree table t")?;
        for key in 0..10 {
            session.execute_line(&format!("insert {} {} into t", key, key))?;
        }
        let mut open = engine.session();
        open.execute_line("transaction begin")?;
        for key in 0..5 {
            open.execute_line(&format!("update t {} 999", key))?;
        }
        open.execute_line("delete 9 from t")?;
        // Kill mid-transaction.
    }

    let engine = common::boot(root.path())?;
    for key in 0..10 {
        assert_eq!(find_value(&engine, "t", key)?, Some(key), "key {} damaged", key);
    }
    Ok(())
}
