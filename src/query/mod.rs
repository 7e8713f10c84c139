pub mod bloom;
pub mod engine;
pub mod join;

pub use bloom::BloomFilter;
pub use engine::{Engine, EngineError, Response, Session, Statement};
pub use join::{grace_hash_join, Join, JoinError};
