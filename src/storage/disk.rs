use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageNum, PAGE_SIZE};
use crate::storage::page::PageBuf;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt database file: {0}")]
    Corruption(String),

    #[error("invalid page number: {0}")]
    InvalidPage(PageNum),
}

/// DiskManager handles the actual page-granular disk I/O for one
/// database file.
pub struct DiskManager {
    file: Mutex<File>,
    n_pages: i64,
}

impl DiskManager {
    /// Open or create the database file. The file length must be a
    /// multiple of the page size, otherwise the file is corrupt.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DiskError> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = open_rw(path.as_ref())?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(DiskError::Corruption(format!(
                "file length {} is not a multiple of the page size",
                len
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            n_pages: (len / PAGE_SIZE as u64) as i64,
        })
    }

    /// Number of pages the backing file held when it was opened.
    pub fn n_pages(&self) -> i64 {
        self.n_pages
    }

    /// Read page `pn` into `buf`. Reads past the end of the file
    /// zero-fill the buffer: a newly reserved page has no bytes on
    /// disk until its first flush.
    pub fn read_page(&self, pn: PageNum, buf: &mut PageBuf) -> Result<(), DiskError> {
        if pn < 0 {
            return Err(DiskError::InvalidPage(pn));
        }
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let offset = pn as u64 * PAGE_SIZE as u64;
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf.0)?;
        Ok(())
    }

    /// Write `buf` at page `pn`'s offset.
    pub fn write_page(&self, pn: PageNum, buf: &PageBuf) -> Result<(), DiskError> {
        if pn < 0 {
            return Err(DiskError::InvalidPage(pn));
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pn as u64 * PAGE_SIZE as u64))?;
        file.write_all(&buf.0)?;
        file.flush()?;
        Ok(())
    }
}

/// Open a file read-write, requesting direct I/O where the platform
/// supports it. Direct opens fail on some filesystems (tmpfs), in
/// which case we fall back to a buffered open.
#[cfg(target_os = "linux")]
fn open_rw(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let direct = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .custom_flags(libc::O_DIRECT)
        .open(path);
    match direct {
        Ok(file) => Ok(file),
        Err(_) => OpenOptions::new().read(true).write(true).create(true).open(path),
    }
}

#[cfg(not(target_os = "linux"))]
fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}
