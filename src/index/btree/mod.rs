pub mod cursor;
pub mod index;
pub mod node;

pub use cursor::BTreeCursor;
pub use index::BTreeIndex;
pub use node::{Layout, ENTRIES_PER_LEAF_NODE, KEYS_PER_INTERNAL_NODE};
