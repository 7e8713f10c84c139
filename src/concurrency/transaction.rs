use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use thiserror::Error;

use crate::common::types::ClientId;
use crate::concurrency::lock_manager::{LockError, LockManager, LockMode, Resource};
use crate::concurrency::waits_for::WaitsForGraph;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("deadlock detected")]
    Deadlock,

    #[error("transaction already running for this client")]
    AlreadyRunning,

    #[error("no transaction running for this client")]
    NotRunning,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),
}

/// One client's transaction: the set of resource locks it holds.
pub struct Transaction {
    client_id: ClientId,
    resources: RwLock<HashMap<Resource, LockMode>>,
}

impl Transaction {
    fn new(client_id: ClientId) -> Self {
        Self { client_id, resources: RwLock::new(HashMap::new()) }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn held_locks(&self) -> HashMap<Resource, LockMode> {
        self.resources.read().clone()
    }
}

/// Tracks every running transaction, acquires resource locks on
/// their behalf, and refuses acquisitions that would close a cycle
/// in the waits-for graph.
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    graph: WaitsForGraph,
    transactions: RwLock<HashMap<ClientId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            graph: WaitsForGraph::new(),
            transactions: RwLock::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, client_id: ClientId) -> Result<(), TransactionError> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&client_id) {
            return Err(TransactionError::AlreadyRunning);
        }
        transactions.insert(client_id, Arc::new(Transaction::new(client_id)));
        Ok(())
    }

    pub fn is_running(&self, client_id: ClientId) -> bool {
        self.transactions.read().contains_key(&client_id)
    }

    pub fn active_ids(&self) -> Vec<ClientId> {
        self.transactions.read().keys().copied().collect()
    }

    fn transaction(&self, client_id: ClientId) -> Result<Arc<Transaction>, TransactionError> {
        self.transactions
            .read()
            .get(&client_id)
            .cloned()
            .ok_or(TransactionError::NotRunning)
    }

    /// Acquire `mode` on `(table, key)` for the client, first wiring
    /// the prospective wait into the waits-for graph and refusing
    /// with `Deadlock` if it would close a cycle. Holding the
    /// resource at `mode` or stronger is a no-op; holding it weaker
    /// turns into an upgrade.
    pub fn lock(
        &self,
        client_id: ClientId,
        table: &str,
        key: i64,
        mode: LockMode,
    ) -> Result<(), TransactionError> {
        let txn = self.transaction(client_id)?;
        let resource = Resource::new(table, key);
        let held = txn.resources.read().get(&resource).copied();
        if let Some(held_mode) = held {
            if held_mode >= mode {
                return Ok(());
            }
        }

        let conflicts = self.conflicting_holders(&resource, mode, client_id);
        for &holder in &conflicts {
            self.graph.add_edge(client_id, holder);
        }
        if self.graph.detect_cycle() {
            for &holder in &conflicts {
                self.graph.remove_edge(client_id, holder);
            }
            debug!("lock refused (deadlock): client={} table={} key={}", client_id, table, key);
            return Err(TransactionError::Deadlock);
        }

        let result = if held.is_some() {
            self.lock_manager.upgrade(client_id, &resource).map_err(TransactionError::from)
        } else {
            self.lock_manager.lock(client_id, resource.clone(), mode);
            Ok(())
        };
        for &holder in &conflicts {
            self.graph.remove_edge(client_id, holder);
        }
        result?;

        txn.resources.write().insert(resource, mode);
        Ok(())
    }

    /// Release one lock mid-transaction. The mode must match what is
    /// held.
    pub fn unlock(
        &self,
        client_id: ClientId,
        table: &str,
        key: i64,
        mode: LockMode,
    ) -> Result<(), TransactionError> {
        let txn = self.transaction(client_id)?;
        let resource = Resource::new(table, key);
        {
            let mut resources = txn.resources.write();
            match resources.get(&resource) {
                None => {
                    return Err(TransactionError::ProtocolViolation(
                        "unlock without a matching lock".to_string(),
                    ))
                }
                Some(&held) if held != mode => {
                    return Err(TransactionError::ProtocolViolation(
                        "unlock with mismatched lock type".to_string(),
                    ))
                }
                Some(_) => {
                    resources.remove(&resource);
                }
            }
        }
        self.lock_manager.unlock(client_id, &resource, mode)?;
        Ok(())
    }

    /// Release every lock the transaction holds and forget it.
    pub fn commit(&self, client_id: ClientId) -> Result<(), TransactionError> {
        let txn = {
            let mut transactions = self.transactions.write();
            transactions.remove(&client_id).ok_or(TransactionError::NotRunning)?
        };
        for (resource, mode) in txn.resources.read().iter() {
            self.lock_manager.unlock(client_id, resource, *mode)?;
        }
        Ok(())
    }

    /// Every transaction holding `resource` in a mode incompatible
    /// with a request for `mode`.
    fn conflicting_holders(&self, resource: &Resource, mode: LockMode, requester: ClientId) -> Vec<ClientId> {
        let transactions = self.transactions.read();
        let mut holders = Vec::new();
        for (&id, txn) in transactions.iter() {
            if id == requester {
                continue;
            }
            if let Some(&held) = txn.resources.read().get(resource) {
                if held == LockMode::Exclusive || mode == LockMode::Exclusive {
                    holders.push(id);
                }
            }
        }
        holders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    fn client() -> ClientId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn test_begin_twice_fails() {
        let tm = manager();
        let a = client();
        tm.begin(a).unwrap();
        assert!(matches!(tm.begin(a), Err(TransactionError::AlreadyRunning)));
    }

    #[test]
    fn test_lock_requires_begin() {
        let tm = manager();
        assert!(matches!(
            tm.lock(client(), "t", 1, LockMode::Shared),
            Err(TransactionError::NotRunning)
        ));
    }

    #[test]
    fn test_relock_same_mode_is_noop() {
        let tm = manager();
        let a = client();
        tm.begin(a).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();
        tm.lock(a, "t", 1, LockMode::Shared).unwrap();
        tm.commit(a).unwrap();
    }

    #[test]
    fn test_shared_then_upgrade() {
        let tm = manager();
        let a = client();
        tm.begin(a).unwrap();
        tm.lock(a, "t", 1, LockMode::Shared).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();
        assert_eq!(
            tm.transaction(a).unwrap().held_locks().get(&Resource::new("t", 1)),
            Some(&LockMode::Exclusive)
        );
        tm.commit(a).unwrap();
    }

    #[test]
    fn test_unlock_mismatched_mode() {
        let tm = manager();
        let a = client();
        tm.begin(a).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();
        assert!(matches!(
            tm.unlock(a, "t", 1, LockMode::Shared),
            Err(TransactionError::ProtocolViolation(_))
        ));
        tm.unlock(a, "t", 1, LockMode::Exclusive).unwrap();
        tm.commit(a).unwrap();
    }

    #[test]
    fn test_unlock_unheld_resource() {
        let tm = manager();
        let a = client();
        tm.begin(a).unwrap();
        assert!(matches!(
            tm.unlock(a, "t", 9, LockMode::Shared),
            Err(TransactionError::ProtocolViolation(_))
        ));
        tm.commit(a).unwrap();
    }

    #[test]
    fn test_commit_releases_for_waiters() {
        use std::thread;

        let tm = Arc::new(manager());
        let (a, b) = (client(), client());
        tm.begin(a).unwrap();
        tm.begin(b).unwrap();
        tm.lock(a, "t", 1, LockMode::Exclusive).unwrap();

        let handle = {
            let tm = Arc::clone(&tm);
            thread::spawn(move || {
                tm.lock(b, "t", 1, LockMode::Exclusive).unwrap();
                tm.commit(b).unwrap();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        tm.commit(a).unwrap();
        handle.join().unwrap();
    }
}
