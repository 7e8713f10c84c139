pub mod lock_manager;
pub mod transaction;
pub mod waits_for;

pub use lock_manager::{LockError, LockManager, LockMode, Resource};
pub use transaction::{Transaction, TransactionError, TransactionManager};
pub use waits_for::WaitsForGraph;
