pub mod disk;
pub mod page;
pub mod pager;

pub use disk::{DiskError, DiskManager};
pub use page::{Page, PageBuf};
pub use pager::{EvictionGuard, PageHandle, Pager, PagerError, NUM_FRAMES};
