use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;

use crate::common::types::{Entry, PageNum};
use crate::index::hash::{bucket, hasher};
use crate::index::{Index, IndexError, IndexKind, IndexMeta};
use crate::storage::pager::{PageHandle, Pager};

/// Global depth a fresh table starts with (2^2 buckets).
pub const INIT_DEPTH: i64 = 2;

/// Hard ceiling on the directory depth. Splitting past this bound
/// means the key distribution cannot be dispersed (e.g. adversarial
/// identical hashes) and the insert fails instead of looping.
pub const MAX_DEPTH: i64 = 20;

struct Directory {
    global_depth: i64,
    buckets: Vec<PageNum>,
}

/// Extendible hash index: a directory of 2^global-depth bucket page
/// numbers, where each bucket carries its own local depth.
pub struct HashTable {
    name: String,
    pager: Arc<Pager>,
    meta_path: PathBuf,
    dir: RwLock<Directory>,
}

impl HashTable {
    /// Create a fresh table with 2^INIT_DEPTH buckets.
    pub fn create(name: &str, pager: Arc<Pager>, meta_path: &Path) -> Result<Self, IndexError> {
        let mut buckets = Vec::with_capacity(1 << INIT_DEPTH);
        for _ in 0..(1 << INIT_DEPTH) {
            let page = pager.new_page()?;
            bucket::init(&mut page.write().0, INIT_DEPTH);
            page.mark_dirty();
            buckets.push(page.pagenum());
        }
        let table = Self {
            name: name.to_string(),
            pager,
            meta_path: meta_path.to_path_buf(),
            dir: RwLock::new(Directory { global_depth: INIT_DEPTH, buckets }),
        };
        table.write_meta()?;
        Ok(table)
    }

    /// Reopen a table from its persisted directory.
    pub fn open(
        name: &str,
        pager: Arc<Pager>,
        meta_path: &Path,
        global_depth: i64,
        buckets: Vec<PageNum>,
    ) -> Self {
        Self {
            name: name.to_string(),
            pager,
            meta_path: meta_path.to_path_buf(),
            dir: RwLock::new(Directory { global_depth, buckets }),
        }
    }

    pub fn global_depth(&self) -> i64 {
        self.dir.read().global_depth
    }

    pub fn bucket_pns(&self) -> Vec<PageNum> {
        self.dir.read().buckets.clone()
    }

    /// Double the directory without splitting any bucket: siblings
    /// under the new bit keep pointing at the same pages. Used on
    /// overflow and by the join to equalize two directories.
    pub fn extend_directory(&self) {
        let mut dir = self.dir.write();
        dir.global_depth += 1;
        let doubled = dir.buckets.clone();
        dir.buckets.extend(doubled);
    }

    /// Local depth and entries of the bucket at `pn`. Used by the
    /// join's probe phase and by invariant checks in tests.
    pub fn bucket_entries(&self, pn: PageNum) -> Result<(i64, Vec<Entry>), IndexError> {
        let page = self.pager.get_page(pn)?;
        let data = page.read();
        Ok((bucket::local_depth(&data.0), bucket::select(&data.0)))
    }

    fn write_meta_for(&self, dir: &Directory) -> Result<(), IndexError> {
        IndexMeta::Hash {
            global_depth: dir.global_depth,
            buckets: dir.buckets.clone(),
        }
        .write_to(&self.meta_path)
    }

    fn write_meta(&self) -> Result<(), IndexError> {
        let dir = self.dir.read();
        self.write_meta_for(&dir)
    }

    /// Split the latched bucket reached through directory slot
    /// `hash`, extending the directory first when the bucket is
    /// already at global depth. Entries are redistributed before any
    /// directory slot is re-pointed, so a reader landing on either
    /// half sees a consistent bucket for its key.
    fn split(
        &self,
        dir: &mut Directory,
        old_handle: &PageHandle,
        old: &mut [u8],
        hash: i64,
    ) -> Result<(), IndexError> {
        let old_local = bucket::local_depth(old);
        if old_local >= MAX_DEPTH {
            return Err(IndexError::DepthLimit);
        }
        if old_local == dir.global_depth {
            dir.global_depth += 1;
            let doubled = dir.buckets.clone();
            dir.buckets.extend(doubled);
        }

        let old_hash = hash % (1 << old_local);
        let new_hash = old_hash + (1 << old_local);
        let new_depth = old_local + 1;
        bucket::set_local_depth(old, new_depth);

        let new_handle = self.pager.new_page()?;
        let mut new_guard = new_handle.write();
        bucket::init(&mut new_guard.0, new_depth);

        // Redistribute under the deeper hash: matching entries stay,
        // the rest move to the new bucket.
        let n = bucket::num_keys(old);
        let mut kept = 0i64;
        let mut moved = 0i64;
        for i in 0..n {
            let key = bucket::key_at(old, i);
            let value = bucket::value_at(old, i);
            if hasher::hash_key(key, new_depth) == old_hash {
                bucket::set_cell(old, kept, key, value);
                kept += 1;
            } else {
                bucket::set_cell(&mut new_guard.0, moved, key, value);
                moved += 1;
            }
        }
        bucket::set_num_keys(old, kept);
        bucket::set_num_keys(&mut new_guard.0, moved);

        let new_pn = new_handle.pagenum();
        let mask = (1i64 << new_depth) - 1;
        for (i, slot) in dir.buckets.iter_mut().enumerate() {
            if (i as i64) & mask == new_hash {
                *slot = new_pn;
            }
        }

        old_handle.mark_dirty();
        new_handle.mark_dirty();
        debug!(
            "hash split: table={} old_pn={} new_pn={} depth={} kept={} moved={}",
            self.name,
            old_handle.pagenum(),
            new_pn,
            new_depth,
            kept,
            moved
        );

        // One side swallowed everything: it is still full, keep
        // splitting it until the entries disperse.
        if kept == 0 {
            return self.split(dir, &new_handle, &mut new_guard.0, new_hash);
        }
        if moved == 0 {
            return self.split(dir, old_handle, old, old_hash);
        }
        Ok(())
    }
}

impl Index for HashTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hash
    }

    fn insert(&self, key: i64, value: i64) -> Result<(), IndexError> {
        let mut dir = self.dir.write();
        let hashed = hasher::hash_key(key, dir.global_depth);
        let page = self.pager.get_page(dir.buckets[hashed as usize])?;
        let mut data = page.write();
        if bucket::find(&data.0, key).is_some() {
            return Err(IndexError::Duplicate);
        }
        let full = bucket::append(&mut data.0, key, value);
        page.mark_dirty();
        if full {
            self.split(&mut dir, &page, &mut data.0, hashed)?;
        }
        Ok(())
    }

    fn update(&self, key: i64, value: i64) -> Result<(), IndexError> {
        let dir = self.dir.read();
        let hashed = hasher::hash_key(key, dir.global_depth);
        let page = self.pager.get_page(dir.buckets[hashed as usize])?;
        let mut data = page.write();
        drop(dir);
        if !bucket::update(&mut data.0, key, value) {
            return Err(IndexError::NotFound);
        }
        page.mark_dirty();
        Ok(())
    }

    fn delete(&self, key: i64) -> Result<(), IndexError> {
        let dir = self.dir.read();
        let hashed = hasher::hash_key(key, dir.global_depth);
        let page = self.pager.get_page(dir.buckets[hashed as usize])?;
        let mut data = page.write();
        drop(dir);
        if !bucket::delete(&mut data.0, key) {
            return Err(IndexError::NotFound);
        }
        page.mark_dirty();
        Ok(())
    }

    fn find(&self, key: i64) -> Result<Entry, IndexError> {
        let dir = self.dir.read();
        let hashed = hasher::hash_key(key, dir.global_depth);
        let page = self.pager.get_page(dir.buckets[hashed as usize])?;
        let data = page.read();
        drop(dir);
        bucket::find(&data.0, key).ok_or(IndexError::NotFound)
    }

    fn select(&self) -> Result<Vec<Entry>, IndexError> {
        let dir = self.dir.read();
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for &pn in &dir.buckets {
            if !seen.insert(pn) {
                continue;
            }
            let page = self.pager.get_page(pn)?;
            let data = page.read();
            entries.extend(bucket::select(&data.0));
        }
        Ok(entries)
    }

    fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Quiesce the table and flush it. Lock order is directory ->
    /// eviction gate -> pager core; taking the directory latch first
    /// lets an in-flight insert finish instead of deadlocking against
    /// the gate.
    fn flush(&self) -> Result<(), IndexError> {
        let dir = self.dir.write();
        let _evictions = self.pager.block_evictions();
        self.write_meta_for(&dir)?;
        self.pager.flush_all_pages()?;
        Ok(())
    }

    fn close(&self) -> Result<(), IndexError> {
        self.flush()?;
        self.pager.close()?;
        Ok(())
    }
}
