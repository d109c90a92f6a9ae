//! Append buffer: each writable `itb-*` descriptor owns a pair of buffers.
//! `write` appends into the current buffer under a lock, handing back the
//! offset the bytes will land at; when the buffer is full it is swapped and
//! the old one retired. `StorageEngine::flush` writes every appended payload
//! through to the backend synchronously before returning (spec.md §4.2's
//! storage round-trip invariant), then hands the retired buffer (if any) to
//! the spool for its own background write-through — by that point it is
//! already redundant with what was written synchronously, so a slow or
//! dropped background job never costs correctness, only tidiness.

use crate::backend::StorageBackend;
use crate::error::{MdslError, Result};
use parking_lot::Mutex;

struct Buf {
    data: Vec<u8>,
    /// file offset the buffer's first byte will land at once flushed.
    base: u64,
}

impl Buf {
    fn new(base: u64) -> Self {
        Self {
            data: Vec::new(),
            base,
        }
    }
}

struct Inner {
    active: Buf,
    /// file-length watermark: bytes already durable or queued for flush.
    watermark: u64,
    capacity: usize,
}

/// Append buffer guarding one writable backing file. `flush_retired` writes a
/// retired buffer through; callers may run it inline or hand it to `spool`.
pub struct AppendBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl AppendBuffer {
    pub fn new(start_offset: u64, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: Buf::new(start_offset),
                watermark: start_offset,
                capacity,
            }),
            capacity,
        }
    }

    /// Appends `iov` into the active buffer, returning the offset it will be
    /// written at. Swaps (and signals retirement of) the buffer if `iov`
    /// would overflow capacity.
    pub fn write(&self, iov: &[u8]) -> Result<(u64, Option<(Vec<u8>, u64)>)> {
        if iov.len() > self.capacity {
            return Err(MdslError::Full(0));
        }
        let mut inner = self.inner.lock();
        if inner.active.data.len() + iov.len() > inner.capacity {
            let retired_base = inner.active.base;
            let retired_len = inner.active.data.len() as u64;
            let retired = std::mem::replace(&mut inner.active, Buf::new(retired_base + retired_len));
            inner.watermark = inner.active.base;
            let location = inner.active.base;
            inner.active.data.extend_from_slice(iov);
            return Ok((location, Some((retired.data, retired_base))));
        }
        let location = inner.active.base + inner.active.data.len() as u64;
        inner.active.data.extend_from_slice(iov);
        Ok((location, None))
    }

    /// Forces the current buffer to retire even if not full, for shutdown
    /// flush / TXG rotation.
    pub fn retire(&self) -> Option<(Vec<u8>, u64)> {
        let mut inner = self.inner.lock();
        if inner.active.data.is_empty() {
            return None;
        }
        let base = inner.active.base;
        let len = inner.active.data.len() as u64;
        let retired = std::mem::replace(&mut inner.active, Buf::new(base + len));
        Some((retired.data, base))
    }

    pub fn watermark(&self) -> u64 {
        self.inner.lock().watermark
    }

    /// Writes a retired buffer through to the backend at its recorded base
    /// offset and advances the watermark.
    pub fn flush_retired(&self, backend: &mut dyn StorageBackend, retired: (Vec<u8>, u64)) -> Result<()> {
        let (bytes, base) = retired;
        backend.write_at(base, &bytes)?;
        backend.sync()?;
        let mut inner = self.inner.lock();
        inner.watermark = inner.watermark.max(base + bytes.len() as u64);
        Ok(())
    }
}
