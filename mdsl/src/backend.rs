//! Storage backend abstraction.
//!
//! Generalizes the teacher's `disk_driver::DiskDriver` trait (open / seek /
//! read / write / ioctl against a single block device) into a byte-addressable
//! backend for the MDSL's named on-disk files (`md`, `itb-N`, `range-N`,
//! `bitmap`). `FileBackend` is the production implementation; `MemoryBackend`
//! backs unit tests the way the teacher's `MemoryDiskDriver` did.

use crate::error::{MdslError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

/// A named, growable byte store. Implementors need not be thread-safe on
/// their own; callers serialize access per descriptor (see `fdht`).
pub trait StorageBackend: Send {
    fn seek(&mut self, offset: i64, whence: SeekType) -> Result<u64>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize>;
    /// Append `buf` at the current end-of-file, returning the offset it was
    /// written at.
    fn append(&mut self, buf: &[u8]) -> Result<u64>;
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn sync(&mut self) -> Result<()>;
}

pub struct FileBackend {
    path: PathBuf,
    file: File,
    length: u64,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| MdslError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        let length = file
            .metadata()
            .map_err(|e| MdslError::Io {
                path: path.display().to_string(),
                source: e,
            })?
            .len();
        Ok(Self {
            path,
            file,
            length,
        })
    }

    fn io_err(&self, e: std::io::Error) -> MdslError {
        MdslError::Io {
            path: self.path.display().to_string(),
            source: e,
        }
    }
}

impl StorageBackend for FileBackend {
    fn seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        let pos = match whence {
            SeekType::Set => SeekFrom::Start(offset as u64),
            SeekType::Cur => SeekFrom::Current(offset),
            SeekType::End => SeekFrom::End(offset),
        };
        self.file.seek(pos).map_err(|e| self.io_err(e))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err(e))?;
        self.file.read(buf).map_err(|e| self.io_err(e))
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err(e))?;
        self.file.write_all(buf).map_err(|e| self.io_err(e))?;
        self.length = self.length.max(offset + buf.len() as u64);
        Ok(buf.len())
    }

    fn append(&mut self, buf: &[u8]) -> Result<u64> {
        let at = self.length;
        self.write_at(at, buf)?;
        Ok(at)
    }

    fn len(&self) -> u64 {
        self.length
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(|e| self.io_err(e))
    }
}

/// In-memory backend for tests, mirroring `disk_driver::memory::MemoryDiskDriver`.
#[derive(Default)]
pub struct MemoryBackend {
    mem: Vec<u8>,
    pointer: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.pointer = match whence {
            SeekType::Set => offset as usize,
            SeekType::Cur => (self.pointer as i64 + offset) as usize,
            SeekType::End => (self.mem.len() as i64 + offset) as usize,
        };
        Ok(self.pointer as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.mem.len() {
            buf.fill(0);
            return Ok(0);
        }
        let n = buf.len().min(self.mem.len() - offset);
        buf[..n].copy_from_slice(&self.mem[offset..offset + n]);
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(buf.len())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        let offset = offset as usize;
        let need = offset + buf.len();
        if self.mem.len() < need {
            self.mem.resize(need, 0);
        }
        self.mem[offset..need].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn append(&mut self, buf: &[u8]) -> Result<u64> {
        let at = self.mem.len() as u64;
        self.write_at(at, buf)?;
        Ok(at)
    }

    fn len(&self) -> u64 {
        self.mem.len() as u64
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Read-caching decorator, same shape as `disk_driver::cache::CacheDiskDriver`.
pub struct CachingBackend<T: StorageBackend> {
    inner: T,
    cache: parking_lot::Mutex<lru::LruCache<u64, Vec<u8>>>,
    page: usize,
}

impl<T: StorageBackend> CachingBackend<T> {
    pub fn new(inner: T, pages: usize, page: usize) -> Self {
        Self {
            inner,
            cache: parking_lot::Mutex::new(lru::LruCache::new(pages.max(1))),
            page,
        }
    }
}

impl<T: StorageBackend> StorageBackend for CachingBackend<T> {
    fn seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.inner.seek(offset, whence)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.len() != self.page {
            return self.inner.read_at(offset, buf);
        }
        let page_id = offset / self.page as u64;
        if let Some(cached) = self.cache.lock().get(&page_id) {
            buf.copy_from_slice(cached);
            return Ok(buf.len());
        }
        let n = self.inner.read_at(page_id * self.page as u64, buf)?;
        self.cache.lock().put(page_id, buf.to_vec());
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.len() == self.page {
            self.cache.lock().pop(&(offset / self.page as u64));
        }
        self.inner.write_at(offset, buf)
    }

    fn append(&mut self, buf: &[u8]) -> Result<u64> {
        self.inner.append(buf)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }
}
