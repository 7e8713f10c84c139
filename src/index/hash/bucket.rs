//! On-page layout of one hash bucket.
//!
//! ```text
//! offset 0   local depth (i64)
//! offset 8   number of keys (i64)
//! offset 16  cells: (key i64, value i64) pairs
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Entry, PAGE_SIZE};

const DEPTH_OFFSET: usize = 0;
const NUM_KEYS_OFFSET: usize = 8;
const CELLS_OFFSET: usize = 16;
const CELL_SIZE: usize = 16;

/// Entries per bucket page. A bucket splits the moment it reaches
/// this count, so `append` always has a free cell.
pub const BUCKET_SIZE: i64 = ((PAGE_SIZE - CELLS_OFFSET) / CELL_SIZE) as i64;

pub fn init(buf: &mut [u8], depth: i64) {
    buf[..PAGE_SIZE].fill(0);
    set_local_depth(buf, depth);
}

pub fn local_depth(buf: &[u8]) -> i64 {
    LittleEndian::read_i64(&buf[DEPTH_OFFSET..DEPTH_OFFSET + 8])
}

pub fn set_local_depth(buf: &mut [u8], depth: i64) {
    LittleEndian::write_i64(&mut buf[DEPTH_OFFSET..DEPTH_OFFSET + 8], depth);
}

pub fn num_keys(buf: &[u8]) -> i64 {
    LittleEndian::read_i64(&buf[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + 8])
}

pub fn set_num_keys(buf: &mut [u8], n: i64) {
    LittleEndian::write_i64(&mut buf[NUM_KEYS_OFFSET..NUM_KEYS_OFFSET + 8], n);
}

fn cell_offset(idx: i64) -> usize {
    CELLS_OFFSET + idx as usize * CELL_SIZE
}

pub fn key_at(buf: &[u8], idx: i64) -> i64 {
    let off = cell_offset(idx);
    LittleEndian::read_i64(&buf[off..off + 8])
}

pub fn value_at(buf: &[u8], idx: i64) -> i64 {
    let off = cell_offset(idx) + 8;
    LittleEndian::read_i64(&buf[off..off + 8])
}

pub fn set_cell(buf: &mut [u8], idx: i64, key: i64, value: i64) {
    let off = cell_offset(idx);
    LittleEndian::write_i64(&mut buf[off..off + 8], key);
    LittleEndian::write_i64(&mut buf[off + 8..off + 16], value);
}

pub fn set_value_at(buf: &mut [u8], idx: i64, value: i64) {
    let off = cell_offset(idx) + 8;
    LittleEndian::write_i64(&mut buf[off..off + 8], value);
}

/// Linear scan for `key`.
pub fn find(buf: &[u8], key: i64) -> Option<Entry> {
    for i in 0..num_keys(buf) {
        if key_at(buf, i) == key {
            return Some(Entry::new(key, value_at(buf, i)));
        }
    }
    None
}

/// Append a cell. Returns true when the bucket has just become full
/// and must be split.
pub fn append(buf: &mut [u8], key: i64, value: i64) -> bool {
    let n = num_keys(buf);
    set_cell(buf, n, key, value);
    set_num_keys(buf, n + 1);
    n + 1 >= BUCKET_SIZE
}

/// Overwrite the value for `key` in place; false if absent.
pub fn update(buf: &mut [u8], key: i64, value: i64) -> bool {
    for i in 0..num_keys(buf) {
        if key_at(buf, i) == key {
            set_value_at(buf, i, value);
            return true;
        }
    }
    false
}

/// Shift-remove `key`; false if absent. Does not coalesce.
pub fn delete(buf: &mut [u8], key: i64) -> bool {
    let n = num_keys(buf);
    let idx = match (0..n).find(|&i| key_at(buf, i) == key) {
        Some(i) => i,
        None => return false,
    };
    for i in idx + 1..n {
        set_cell(buf, i - 1, key_at(buf, i), value_at(buf, i));
    }
    set_num_keys(buf, n - 1);
    true
}

/// All entries in this bucket, in cell order.
pub fn select(buf: &[u8]) -> Vec<Entry> {
    (0..num_keys(buf))
        .map(|i| Entry::new(key_at(buf, i), value_at(buf, i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageBuf;

    #[test]
    fn test_append_find_delete() {
        let mut buf = PageBuf::zeroed();
        init(&mut buf.0, 2);
        assert_eq!(local_depth(&buf.0), 2);
        assert!(!append(&mut buf.0, 10, 100));
        assert!(!append(&mut buf.0, 20, 200));
        assert_eq!(find(&buf.0, 10), Some(Entry::new(10, 100)));
        assert_eq!(find(&buf.0, 30), None);
        assert!(delete(&mut buf.0, 10));
        assert!(!delete(&mut buf.0, 10));
        assert_eq!(num_keys(&buf.0), 1);
        assert_eq!(select(&buf.0), vec![Entry::new(20, 200)]);
    }

    #[test]
    fn test_append_reports_full() {
        let mut buf = PageBuf::zeroed();
        init(&mut buf.0, 0);
        for i in 0..BUCKET_SIZE - 1 {
            assert!(!append(&mut buf.0, i, i), "bucket full too early at {}", i);
        }
        assert!(append(&mut buf.0, BUCKET_SIZE - 1, 0));
    }
}
