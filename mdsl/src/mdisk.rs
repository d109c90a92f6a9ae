//! mdisk: the in-memory + on-disk range index mapping `itbid -> range-file`.
//!
//! On-disk layout (little-endian, spec.md §6):
//! `{magic: u32, itb_master: u32, range_nr: u32, range[range_nr]}` where
//! `range = {range_id: u32, begin: u64, end: u64}`.

use crate::error::{MdslError, Result};
use zerocopy::{AsBytes, FromBytes};

pub const MDISK_MAGIC: u32 = 0x4d44_534b; // "MDSK"

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
#[repr(C)]
pub struct RangeRecord {
    pub range_id: u32,
    pub begin: u64,
    pub end: u64,
}

impl RangeRecord {
    pub fn contains(&self, itbid: u64) -> bool {
        self.begin <= itbid && itbid <= self.end
    }
}

/// In-memory mdisk state for one directory.
#[derive(Debug, Default)]
pub struct Mdisk {
    pub itb_master: u32,
    ranges: Vec<RangeRecord>,
}

impl Mdisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `md` file image read in full on open.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            if buf.is_empty() {
                return Ok(Self::default());
            }
            return Err(MdslError::Corrupt {
                what: "mdisk header",
                detail: format!("short header, {} bytes", buf.len()),
            });
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MDISK_MAGIC {
            return Err(MdslError::Corrupt {
                what: "mdisk header",
                detail: format!("bad magic 0x{:x}", magic),
            });
        }
        let itb_master = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let range_nr = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let rec_size = std::mem::size_of::<RangeRecord>();
        let mut ranges = Vec::with_capacity(range_nr);
        let mut off = 12;
        for _ in 0..range_nr {
            if off + rec_size > buf.len() {
                return Err(MdslError::Corrupt {
                    what: "mdisk range table",
                    detail: "truncated range record".into(),
                });
            }
            let rec =
                RangeRecord::read_from(&buf[off..off + rec_size]).expect("sized slice");
            ranges.push(rec);
            off += rec_size;
        }
        Ok(Self {
            itb_master,
            ranges,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.ranges.len() * std::mem::size_of::<RangeRecord>());
        out.extend_from_slice(&MDISK_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.itb_master.to_le_bytes());
        out.extend_from_slice(&(self.ranges.len() as u32).to_le_bytes());
        for r in &self.ranges {
            out.extend_from_slice(r.as_bytes());
        }
        out
    }

    /// Binary search for the range covering `itbid`; ranges are kept sorted
    /// by `begin` by `add_range`.
    pub fn lookup(&self, itbid: u64) -> Option<&RangeRecord> {
        let idx = self
            .ranges
            .partition_point(|r| r.end < itbid);
        self.ranges.get(idx).filter(|r| r.contains(itbid))
    }

    pub fn add_range(&mut self, range_id: u32, begin: u64, end: u64) -> &RangeRecord {
        let rec = RangeRecord {
            range_id,
            begin,
            end,
        };
        let idx = self.ranges.partition_point(|r| r.begin < begin);
        self.ranges.insert(idx, rec);
        &self.ranges[idx]
    }

    /// Extends or allocates whichever range currently covers (or would
    /// neighbor) `itbid`, growing the address space as directories split.
    pub fn ensure_range_for(&mut self, itbid: u64, range_span: u64) -> RangeRecord {
        if let Some(r) = self.lookup(itbid) {
            return *r;
        }
        let next_id = self.ranges.last().map(|r| r.range_id + 1).unwrap_or(0);
        let begin = (itbid / range_span) * range_span;
        let end = begin + range_span - 1;
        *self.add_range(next_id, begin, end)
    }

    pub fn ranges(&self) -> &[RangeRecord] {
        &self.ranges
    }
}
