pub mod types;

pub use types::{ClientId, Entry, FrameId, PageNum, NOPAGE, PAGE_SIZE};
