use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use ferndb::concurrency::{LockManager, TransactionManager};
use ferndb::database::Database;
use ferndb::query::Engine;
use ferndb::recovery::{self, RecoveryManager};

/// A scratch root for one test. The database directory, its recovery
/// sibling, and the log all live under it.
#[allow(dead_code)]
pub fn scratch() -> Result<TempDir> {
    Ok(TempDir::new()?)
}

/// Wire up a full engine over `<root>/data`, mirroring the binary's
/// startup order: prime, open, lock manager, transaction manager,
/// recovery manager, recover.
#[allow(dead_code)]
pub fn boot(root: &Path) -> Result<Arc<Engine>> {
    let base = root.join("data");
    recovery::prime(&base)?;
    let db = Arc::new(Database::open(&base)?);
    let lm = Arc::new(LockManager::new());
    let tm = Arc::new(TransactionManager::new(lm));
    let rm = Arc::new(RecoveryManager::new(
        Arc::clone(&db),
        Arc::clone(&tm),
        recovery::log_path(&base),
    )?);
    rm.recover()?;
    Ok(Arc::new(Engine::new(db, tm, rm)))
}
