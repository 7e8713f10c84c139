use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB, matching the direct-I/O block size)
pub const PAGE_SIZE: usize = 4096;

/// Page number type; a page's number is its offset in the backing
/// file divided by `PAGE_SIZE`
pub type PageNum = i64;

/// Sentinel page number for "no page" (free frames, tail siblings)
pub const NOPAGE: PageNum = -1;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// Client/transaction identifier
pub type ClientId = uuid::Uuid;

/// An immutable key/value pair stored in an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: i64,
    pub value: i64,
}

impl Entry {
    pub fn new(key: i64, value: i64) -> Self {
        Self { key, value }
    }
}
