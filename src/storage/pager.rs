use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, warn};
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, MutexGuard, RawRwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::common::types::{FrameId, PageNum, NOPAGE};
use crate::storage::disk::{DiskError, DiskManager};
use crate::storage::page::{Page, PageBuf};

/// Default number of frames in the buffer pool.
pub const NUM_FRAMES: usize = 256;

/// Owned latch guards, usable in a latch stack that outlives any one
/// borrow of the handle.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Box<PageBuf>>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<PageBuf>>;

#[derive(Error, Debug)]
pub enum PagerError {
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),

    #[error("no evictable frame available")]
    OutOfPages,

    #[error("invalid page number: {0}")]
    InvalidPage(PageNum),
}

struct FrameMeta {
    pagenum: PageNum,
    pin_count: u32,
    dirty: bool,
}

struct PagerCore {
    metas: Vec<FrameMeta>,
    /// pagenum -> frame holding it; contains exactly the loaded frames
    page_table: HashMap<PageNum, FrameId>,
    /// never-loaded frames
    free_list: VecDeque<FrameId>,
    /// loaded frames with pin count zero, LRU order (head = next victim)
    unpinned_list: VecDeque<FrameId>,
    /// loaded frames with pin count above zero
    pinned: HashSet<FrameId>,
    /// pages used by this database; the next new page gets this number
    n_pages: i64,
}

/// Fixed-size page cache over one database file.
///
/// Frames live in an arena of `Arc<Page>`; all list and pin-count
/// book-keeping sits behind one mutex. Lock order is
/// `update_lock -> core`; page latches are always taken outside both.
pub struct Pager {
    path: PathBuf,
    disk: DiskManager,
    frames: Vec<Arc<Page>>,
    core: Mutex<PagerCore>,
    /// held for the duration of a checkpoint to stop page-ins/evictions
    update_lock: Mutex<()>,
}

impl Pager {
    /// Open the pager over `path` with the default frame count.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, PagerError> {
        Self::open_with_frames(path, NUM_FRAMES)
    }

    pub fn open_with_frames(path: impl AsRef<Path>, num_frames: usize) -> Result<Arc<Self>, PagerError> {
        let disk = DiskManager::open(path.as_ref())?;
        let n_pages = disk.n_pages();
        let mut metas = Vec::with_capacity(num_frames);
        let mut frames = Vec::with_capacity(num_frames);
        let mut free_list = VecDeque::with_capacity(num_frames);
        for fid in 0..num_frames {
            frames.push(Arc::new(Page::new(fid)));
            metas.push(FrameMeta { pagenum: NOPAGE, pin_count: 0, dirty: false });
            free_list.push_back(fid);
        }
        Ok(Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            disk,
            frames,
            core: Mutex::new(PagerCore {
                metas,
                page_table: HashMap::new(),
                free_list,
                unpinned_list: VecDeque::new(),
                pinned: HashSet::new(),
                n_pages,
            }),
            update_lock: Mutex::new(()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn n_pages(&self) -> i64 {
        self.core.lock().n_pages
    }

    /// Fetch an existing page, pinned. The caller holds the pin until
    /// the returned handle drops.
    pub fn get_page(self: &Arc<Self>, pagenum: PageNum) -> Result<PageHandle, PagerError> {
        let _ev = self.update_lock.lock();
        let mut core = self.core.lock();
        if pagenum < 0 || pagenum >= core.n_pages {
            return Err(PagerError::InvalidPage(pagenum));
        }
        if let Some(&fid) = core.page_table.get(&pagenum) {
            self.pin_frame(&mut core, fid);
            return Ok(self.handle(fid, pagenum));
        }
        let fid = self.take_frame(&mut core)?;
        {
            let mut data = self.frames[fid].data().write();
            self.disk.read_page(pagenum, &mut data)?;
        }
        self.install_frame(&mut core, fid, pagenum);
        Ok(self.handle(fid, pagenum))
    }

    /// Reserve the next page number and hand back a pinned, zeroed
    /// page for it. Nothing is read from disk.
    pub fn new_page(self: &Arc<Self>) -> Result<PageHandle, PagerError> {
        let _ev = self.update_lock.lock();
        let mut core = self.core.lock();
        let fid = self.take_frame(&mut core)?;
        let pagenum = core.n_pages;
        core.n_pages += 1;
        self.frames[fid].data().write().fill(0);
        self.install_frame(&mut core, fid, pagenum);
        Ok(self.handle(fid, pagenum))
    }

    /// Flush `pagenum` if it is cached and dirty.
    pub fn flush_page(&self, pagenum: PageNum) -> Result<(), PagerError> {
        let mut core = self.core.lock();
        let fid = match core.page_table.get(&pagenum) {
            Some(&fid) => fid,
            None => return Ok(()),
        };
        self.flush_frame(&mut core, fid)
    }

    /// Flush every dirty cached page.
    pub fn flush_all_pages(&self) -> Result<(), PagerError> {
        let mut core = self.core.lock();
        let fids: Vec<FrameId> = core.page_table.values().copied().collect();
        for fid in fids {
            self.flush_frame(&mut core, fid)?;
        }
        Ok(())
    }

    /// Block page-ins and evictions until the returned guard drops.
    /// Held by the recovery manager across a checkpoint flush.
    pub fn block_evictions(&self) -> EvictionGuard<'_> {
        EvictionGuard(self.update_lock.lock())
    }

    /// Flush everything and release the file. Pages still pinned are
    /// reported but do not abort the close.
    pub fn close(&self) -> Result<(), PagerError> {
        {
            let core = self.core.lock();
            if !core.pinned.is_empty() {
                error!("pager close: {} page(s) still pinned", core.pinned.len());
            }
        }
        self.flush_all_pages()
    }

    /// (free, unpinned, pinned, page-table size) — used by invariant
    /// checks in tests.
    pub fn frame_stats(&self) -> (usize, usize, usize, usize) {
        let core = self.core.lock();
        (
            core.free_list.len(),
            core.unpinned_list.len(),
            core.pinned.len(),
            core.page_table.len(),
        )
    }

    fn handle(self: &Arc<Self>, fid: FrameId, pagenum: PageNum) -> PageHandle {
        PageHandle {
            pager: Arc::clone(self),
            page: Arc::clone(&self.frames[fid]),
            pagenum,
            dirty: AtomicBool::new(false),
        }
    }

    fn pin_frame(&self, core: &mut PagerCore, fid: FrameId) {
        let pins = core.metas[fid].pin_count;
        if pins == 0 {
            if let Some(pos) = core.unpinned_list.iter().position(|&f| f == fid) {
                core.unpinned_list.remove(pos);
            }
            core.pinned.insert(fid);
        }
        core.metas[fid].pin_count = pins + 1;
    }

    fn install_frame(&self, core: &mut PagerCore, fid: FrameId, pagenum: PageNum) {
        core.metas[fid] = FrameMeta { pagenum, pin_count: 1, dirty: false };
        core.page_table.insert(pagenum, fid);
        core.pinned.insert(fid);
    }

    /// Take a frame from the free list, or evict the LRU unpinned
    /// frame (flushing it first if dirty). All frames pinned means
    /// there is nothing to evict.
    fn take_frame(&self, core: &mut PagerCore) -> Result<FrameId, PagerError> {
        if let Some(fid) = core.free_list.pop_front() {
            return Ok(fid);
        }
        let fid = core.unpinned_list.pop_front().ok_or(PagerError::OutOfPages)?;
        let old_pn = core.metas[fid].pagenum;
        if core.metas[fid].dirty {
            let data = self.frames[fid].data().read();
            self.disk.write_page(old_pn, &data)?;
            core.metas[fid].dirty = false;
        }
        core.page_table.remove(&old_pn);
        core.metas[fid].pagenum = NOPAGE;
        Ok(fid)
    }

    /// Flush one frame if dirty. A page latched by an in-flight
    /// operation is skipped and stays dirty: its edit record lands
    /// after any concurrent checkpoint record, so replay covers it.
    fn flush_frame(&self, core: &mut PagerCore, fid: FrameId) -> Result<(), PagerError> {
        if !core.metas[fid].dirty {
            return Ok(());
        }
        let pn = core.metas[fid].pagenum;
        let data = match self.frames[fid].data().try_read() {
            Some(data) => data,
            None => {
                warn!("flush: page {} is latched, leaving it dirty", pn);
                return Ok(());
            }
        };
        self.disk.write_page(pn, &data)?;
        drop(data);
        core.metas[fid].dirty = false;
        Ok(())
    }

    fn unpin(&self, pagenum: PageNum, dirty: bool) {
        let mut core = self.core.lock();
        let fid = match core.page_table.get(&pagenum) {
            Some(&fid) => fid,
            None => return,
        };
        if dirty {
            core.metas[fid].dirty = true;
        }
        let pins = core.metas[fid].pin_count;
        if pins == 0 {
            return;
        }
        core.metas[fid].pin_count = pins - 1;
        if pins == 1 {
            core.pinned.remove(&fid);
            core.unpinned_list.push_back(fid);
        }
    }
}

/// Blocks evictions while alive; see [`Pager::block_evictions`].
pub struct EvictionGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

/// A pinned page. The pin is released when the handle drops; marking
/// the handle dirty carries over to the frame on release, mirroring
/// an unpin-with-dirty.
pub struct PageHandle {
    pager: Arc<Pager>,
    page: Arc<Page>,
    pagenum: PageNum,
    dirty: AtomicBool,
}

impl PageHandle {
    pub fn pagenum(&self) -> PageNum {
        self.pagenum
    }

    /// Take the page latch for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<PageBuf>> {
        self.page.data().read()
    }

    /// Take the page latch for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<PageBuf>> {
        self.page.data().write()
    }

    /// Owned latch guards for latch stacks (crabbed descents).
    pub fn read_arc(&self) -> PageReadGuard {
        self.page.data().read_arc()
    }

    pub fn write_arc(&self) -> PageWriteGuard {
        self.page.data().write_arc()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.pager.unpin(self.pagenum, self.dirty.load(Ordering::Relaxed));
    }
}
