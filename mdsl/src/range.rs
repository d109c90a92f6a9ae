//! `range-N` files: a fixed-size array of `u64` byte-offsets, indexed by
//! `itbid - range.begin`. Slot value `0` means "absent" — ITBs never flush
//! at file offset 0 because the file header occupies the prefix (spec.md §3).

use crate::backend::StorageBackend;
use crate::error::Result;
use crate::mdisk::RangeRecord;

const SLOT_SIZE: u64 = 8;

pub struct RangeFile<'a> {
    backend: &'a mut dyn StorageBackend,
    range: RangeRecord,
}

impl<'a> RangeFile<'a> {
    pub fn new(backend: &'a mut dyn StorageBackend, range: RangeRecord) -> Self {
        Self { backend, range }
    }

    fn slot_offset(&self, itbid: u64) -> u64 {
        (itbid - self.range.begin) * SLOT_SIZE
    }

    pub fn lookup(&mut self, itbid: u64) -> Result<Option<u64>> {
        let mut buf = [0u8; 8];
        self.backend.read_at(self.slot_offset(itbid), &mut buf)?;
        let off = u64::from_le_bytes(buf);
        Ok(if off == 0 { None } else { Some(off) })
    }

    pub fn write(&mut self, itbid: u64, offset: u64) -> Result<()> {
        self.backend
            .write_at(self.slot_offset(itbid), &offset.to_le_bytes())?;
        self.backend.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn absent_slot_reads_as_none() {
        let mut mem = MemoryBackend::new();
        let range = RangeRecord {
            range_id: 0,
            begin: 0,
            end: 63,
        };
        let mut rf = RangeFile::new(&mut mem, range);
        assert_eq!(rf.lookup(5).unwrap(), None);
        rf.write(5, 4096).unwrap();
        assert_eq!(rf.lookup(5).unwrap(), Some(4096));
        assert_eq!(rf.lookup(6).unwrap(), None);
    }
}
