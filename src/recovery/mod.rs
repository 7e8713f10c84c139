pub mod log_record;
pub mod manager;

pub use log_record::{EditAction, LogRecord, LogRecordError};
pub use manager::{log_path, prime, recovery_dir, RecoveryError, RecoveryManager};
