use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::types::{FrameId, PAGE_SIZE};

/// One page worth of bytes, aligned for direct I/O.
#[repr(align(4096))]
pub struct PageBuf(pub [u8; PAGE_SIZE]);

impl PageBuf {
    pub fn zeroed() -> Box<Self> {
        Box::new(PageBuf([0u8; PAGE_SIZE]))
    }
}

impl Deref for PageBuf {
    type Target = [u8; PAGE_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A buffer pool frame. The `RwLock` around the bytes is the page
/// latch; the pager never takes it implicitly, and it is independent
/// of the pin count (which lives in the pager's book-keeping).
pub struct Page {
    frame_id: FrameId,
    data: Arc<RwLock<Box<PageBuf>>>,
}

impl Page {
    pub(crate) fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            data: Arc::new(RwLock::new(PageBuf::zeroed())),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub(crate) fn data(&self) -> &Arc<RwLock<Box<PageBuf>>> {
        &self.data
    }
}
