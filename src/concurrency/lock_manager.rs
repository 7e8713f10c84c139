use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use thiserror::Error;

use crate::common::types::ClientId;

/// Lock modes, ordered so that `Shared < Exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lockable resource: one key of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub table: String,
    pub key: i64,
}

impl Resource {
    pub fn new(table: &str, key: i64) -> Self {
        Self { table: table.to_string(), key }
    }
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock not held on this resource")]
    NotHeld,
}

#[derive(Debug)]
struct LockRequest {
    owner: ClientId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct RequestQueue {
    requests: VecDeque<LockRequest>,
    shared_granted: usize,
    exclusive_granted: bool,
}

impl RequestQueue {
    /// Grant the longest compatible prefix of waiting requests,
    /// preserving FIFO order.
    fn grant_compatible(&mut self) {
        for req in self.requests.iter_mut() {
            if req.granted {
                continue;
            }
            let compatible = match req.mode {
                LockMode::Shared => !self.exclusive_granted,
                LockMode::Exclusive => self.shared_granted == 0 && !self.exclusive_granted,
            };
            if !compatible {
                break;
            }
            req.granted = true;
            match req.mode {
                LockMode::Shared => self.shared_granted += 1,
                LockMode::Exclusive => self.exclusive_granted = true,
            }
        }
    }
}

/// Per-resource read/write locks with FIFO wait queues. Callers
/// block until their request is compatible; deadlock avoidance is the
/// transaction manager's job and happens before `lock` is called.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<Resource, RequestQueue>>,
    cvar: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `mode` on `resource`, suspending the caller until the
    /// request is compatible with every granted holder.
    pub fn lock(&self, owner: ClientId, resource: Resource, mode: LockMode) {
        let mut table = self.table.lock().unwrap();
        table
            .entry(resource.clone())
            .or_default()
            .requests
            .push_back(LockRequest { owner, mode, granted: false });
        loop {
            let queue = table.get_mut(&resource).expect("queue exists while a request waits");
            queue.grant_compatible();
            let granted = queue
                .requests
                .iter()
                .find(|r| r.owner == owner && r.mode == mode)
                .map(|r| r.granted)
                .unwrap_or(false);
            if granted {
                return;
            }
            table = self.cvar.wait(table).unwrap();
        }
    }

    /// Release `mode` on `resource` and wake the queue.
    pub fn unlock(&self, owner: ClientId, resource: &Resource, mode: LockMode) -> Result<(), LockError> {
        let mut table = self.table.lock().unwrap();
        let queue = table.get_mut(resource).ok_or(LockError::NotHeld)?;
        let pos = queue
            .requests
            .iter()
            .position(|r| r.owner == owner && r.mode == mode && r.granted)
            .ok_or(LockError::NotHeld)?;
        queue.requests.remove(pos);
        match mode {
            LockMode::Shared => queue.shared_granted -= 1,
            LockMode::Exclusive => queue.exclusive_granted = false,
        }
        queue.grant_compatible();
        if queue.requests.is_empty() {
            table.remove(resource);
        }
        self.cvar.notify_all();
        Ok(())
    }

    /// Upgrade an already-held Shared lock to Exclusive. Converts in
    /// place once the caller is the only reader; until then the
    /// caller waits (its Shared lock stays held).
    pub fn upgrade(&self, owner: ClientId, resource: &Resource) -> Result<(), LockError> {
        let mut table = self.table.lock().unwrap();
        loop {
            let queue = table.get_mut(resource).ok_or(LockError::NotHeld)?;
            let pos = queue
                .requests
                .iter()
                .position(|r| r.owner == owner && r.mode == LockMode::Shared && r.granted)
                .ok_or(LockError::NotHeld)?;
            if queue.shared_granted == 1 && !queue.exclusive_granted {
                queue.requests[pos].mode = LockMode::Exclusive;
                queue.shared_granted = 0;
                queue.exclusive_granted = true;
                return Ok(());
            }
            table = self.cvar.wait(table).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn client() -> ClientId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let r = Resource::new("t", 1);
        let (a, b) = (client(), client());
        lm.lock(a, r.clone(), LockMode::Shared);
        lm.lock(b, r.clone(), LockMode::Shared);
        lm.unlock(a, &r, LockMode::Shared).unwrap();
        lm.unlock(b, &r, LockMode::Shared).unwrap();
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let lm = Arc::new(LockManager::new());
        let r = Resource::new("t", 1);
        let (a, b) = (client(), client());
        lm.lock(a, r.clone(), LockMode::Exclusive);

        let acquired = Arc::new(AtomicUsize::new(0));
        let handle = {
            let lm = Arc::clone(&lm);
            let r = r.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                lm.lock(b, r.clone(), LockMode::Exclusive);
                acquired.store(1, Ordering::SeqCst);
                lm.unlock(b, &r, LockMode::Exclusive).unwrap();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0, "waiter ran before release");
        lm.unlock(a, &r, LockMode::Exclusive).unwrap();
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unlock_without_lock_fails() {
        let lm = LockManager::new();
        let r = Resource::new("t", 1);
        assert!(matches!(lm.unlock(client(), &r, LockMode::Shared), Err(LockError::NotHeld)));
    }

    #[test]
    fn test_upgrade_sole_reader() {
        let lm = LockManager::new();
        let r = Resource::new("t", 1);
        let a = client();
        lm.lock(a, r.clone(), LockMode::Shared);
        lm.upgrade(a, &r).unwrap();
        lm.unlock(a, &r, LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_upgrade_waits_for_other_readers() {
        let lm = Arc::new(LockManager::new());
        let r = Resource::new("t", 1);
        let (a, b) = (client(), client());
        lm.lock(a, r.clone(), LockMode::Shared);
        lm.lock(b, r.clone(), LockMode::Shared);

        let upgraded = Arc::new(AtomicUsize::new(0));
        let handle = {
            let lm = Arc::clone(&lm);
            let r = r.clone();
            let upgraded = Arc::clone(&upgraded);
            thread::spawn(move || {
                lm.upgrade(a, &r).unwrap();
                upgraded.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(upgraded.load(Ordering::SeqCst), 0);
        lm.unlock(b, &r, LockMode::Shared).unwrap();
        handle.join().unwrap();
        assert_eq!(upgraded.load(Ordering::SeqCst), 1);
    }
}
