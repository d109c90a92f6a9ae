//! Concurrent extendible hash table of ITB index buckets (spec.md §4.4 / C4),
//! grounded closely on `mds/cbht.c`: a growable directory of buckets, each
//! bucket holding `2^bucket_depth` bucket-entries, each entry chaining the
//! ITB headers that hash into it. A bucket splits when its active count
//! exceeds `2 * 2^bucket_depth`; the directory doubles when a bucket's local
//! depth outgrows it.

use crate::hash::{combine, fold};
use crate::itb::Ite;
use crate::types::{ItbId, Uuid64};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sub-table width inside one bucket; the C original calls this
/// `eh->bucket_depth` and keeps it fixed for the table's lifetime.
const BUCKET_DEPTH: u32 = 2;
const BUCKET_WIDTH: usize = 1 << BUCKET_DEPTH;

/// Directory segment width (`cbht_copy_dir`'s two-level segment table):
/// growing the directory appends whole segments instead of reallocating and
/// copying every existing slot.
const SEGMENT_LEN: usize = 16;

const CBHT_SALT: u64 = 0x6862_6366_7430;

fn cbht_hash(puuid: Uuid64, itbid: ItbId) -> u64 {
    combine(puuid ^ itbid.rotate_left(17), CBHT_SALT)
}

/// One ITB's CBHT-visible header: identity plus the back-pointer spec.md
/// §4.4 calls `itb.be`, here the `(bucket_id, slot)` this header currently
/// believes it lives in. Re-validated after every lock re-acquisition.
pub struct ItbHeader {
    pub puuid: Uuid64,
    pub itbid: ItbId,
    pub hash: u64,
    pub txg: AtomicUsize,
    location: RwLock<(u64, usize)>,
    /// The ITB's packed name table (spec.md §3); empty until loaded from or
    /// first written to MDSL.
    pub content: RwLock<Vec<Ite>>,
}

impl ItbHeader {
    fn new(puuid: Uuid64, itbid: ItbId, hash: u64, bucket_id: u64, slot: usize) -> Arc<Self> {
        Arc::new(Self {
            puuid,
            itbid,
            hash,
            txg: AtomicUsize::new(0),
            location: RwLock::new((bucket_id, slot)),
            content: RwLock::new(Vec::new()),
        })
    }

    pub fn be(&self) -> (u64, usize) {
        *self.location.read()
    }

    fn set_be(&self, bucket_id: u64, slot: usize) {
        *self.location.write() = (bucket_id, slot);
    }
}

/// One chain inside a bucket's sub-table (`bucket_entry` in the original).
#[derive(Default)]
struct BucketEntry {
    items: Vec<Arc<ItbHeader>>,
}

impl BucketEntry {
    fn find(&self, puuid: Uuid64, itbid: ItbId) -> Option<Arc<ItbHeader>> {
        self.items
            .iter()
            .find(|h| h.puuid == puuid && h.itbid == itbid)
            .cloned()
    }

    fn remove(&mut self, puuid: Uuid64, itbid: ItbId) -> Option<Arc<ItbHeader>> {
        let idx = self
            .items
            .iter()
            .position(|h| h.puuid == puuid && h.itbid == itbid)?;
        Some(self.items.remove(idx))
    }
}

pub struct Bucket {
    id: u64,
    depth: AtomicU32,
    active: AtomicUsize,
    content: Vec<RwLock<BucketEntry>>,
}

impl Bucket {
    fn new(id: u64, depth: u32) -> Arc<Self> {
        let mut content = Vec::with_capacity(BUCKET_WIDTH);
        content.resize_with(BUCKET_WIDTH, RwLock::<BucketEntry>::default);
        Arc::new(Self {
            id,
            depth: AtomicU32::new(depth),
            active: AtomicUsize::new(0),
            content,
        })
    }

    fn slot(&self, hash: u64) -> usize {
        (fold(hash, BUCKET_DEPTH)) as usize
    }

    fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    fn needs_split(&self) -> bool {
        self.active.load(Ordering::SeqCst) >= 2 * BUCKET_WIDTH
    }
}

/// Outcome of an insert: distinguishes a fresh ITB from a duplicate that was
/// silently folded away, matching the `ausplit` idempotence contract
/// (spec.md §4.5: "duplicate insertion is idempotent — the later arrival is
/// dropped with a warning").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// One directory segment: a fixed-size run of `SEGMENT_LEN` slots. The
/// directory grows by appending segments, never by reallocating and copying
/// every slot that already exists (`cbht_copy_dir`).
struct Segment {
    slots: Vec<RwLock<Arc<Bucket>>>,
}

impl Segment {
    fn filled(bucket: Arc<Bucket>) -> Self {
        let mut slots = Vec::with_capacity(SEGMENT_LEN);
        slots.resize_with(SEGMENT_LEN, || RwLock::new(bucket.clone()));
        Self { slots }
    }
}

/// Extendible directory: `2^dir_depth` logical slots, each naming the bucket
/// that currently owns that prefix, backed by a segment table so growth
/// appends new `Segment`s instead of moving existing ones.
pub struct Cbht {
    segments: RwLock<Vec<Arc<Segment>>>,
    dir_depth: AtomicU32,
}

impl Cbht {
    pub fn new() -> Self {
        let root = Bucket::new(0, 0);
        Self {
            segments: RwLock::new(vec![Arc::new(Segment::filled(root))]),
            dir_depth: AtomicU32::new(0),
        }
    }

    fn dir_depth(&self) -> u32 {
        self.dir_depth.load(Ordering::SeqCst)
    }

    fn get_slot(segments: &[Arc<Segment>], idx: usize) -> Arc<Bucket> {
        segments[idx / SEGMENT_LEN].slots[idx % SEGMENT_LEN].read().clone()
    }

    fn set_slot(segments: &[Arc<Segment>], idx: usize, bucket: Arc<Bucket>) {
        *segments[idx / SEGMENT_LEN].slots[idx % SEGMENT_LEN].write() = bucket;
    }

    /// Appends whole segments until the table holds at least `total` slots.
    /// New slots are filled with a clone of slot 0 as a placeholder; callers
    /// that just grew the table always overwrite every new slot immediately
    /// afterwards (see `enlarge_dir`).
    fn ensure_total_slots(segments: &mut Vec<Arc<Segment>>, total: usize) {
        if segments.len() * SEGMENT_LEN >= total {
            return;
        }
        let filler = Self::get_slot(segments, 0);
        while segments.len() * SEGMENT_LEN < total {
            segments.push(Arc::new(Segment::filled(filler.clone())));
        }
    }

    /// Directory addressing consumes hash bits above the fixed `BUCKET_DEPTH`
    /// low bits that `Bucket::slot` uses for in-bucket lock striping, so a
    /// split (which tests bits the same way, see `split`) never disagrees
    /// with the directory about where an ITB lives.
    fn search_dir(&self, hash: u64) -> Arc<Bucket> {
        let segments = self.segments.read();
        let idx = fold(hash >> BUCKET_DEPTH, self.dir_depth()) as usize;
        Self::get_slot(&segments, idx)
    }

    /// `cbht_enlarge_dir`: doubles the directory one depth step at a time so
    /// a bucket whose local depth just grew past the directory's depth gets
    /// its own distinct slots. Each step mirrors the existing slots into the
    /// newly appended segments rather than copying the whole table.
    fn enlarge_dir(&self, target_depth: u32) {
        let mut segments = self.segments.write();
        let mut depth = self.dir_depth.load(Ordering::SeqCst);
        if target_depth <= depth {
            return;
        }
        while depth < target_depth {
            let old_total = 1usize << depth;
            let new_total = old_total * 2;
            Self::ensure_total_slots(&mut segments, new_total);
            for i in 0..old_total {
                let bucket = Self::get_slot(&segments, i);
                Self::set_slot(&segments, old_total + i, bucket);
            }
            depth += 1;
        }
        self.dir_depth.store(depth, Ordering::SeqCst);
    }

    /// `segment_update_dir`: points every directory slot matching `b.id` at
    /// the new local depth's mask to `b`.
    fn update_dir(&self, bucket: &Arc<Bucket>) {
        let depth = bucket.depth();
        if depth > self.dir_depth() {
            self.enlarge_dir(depth);
        }
        let segments = self.segments.read();
        let total = 1usize << self.dir_depth();
        let mask = (1u64 << depth) - 1;
        for i in 0..total {
            if (i as u64) & mask == bucket.id & mask {
                Self::set_slot(&segments, i, bucket.clone());
            }
        }
    }

    /// `cbht_bucket_split`: redistributes a bucket's ITBs between itself and
    /// a freshly allocated sibling by the next hash bit, repeating while
    /// either half is still over threshold.
    fn split(&self, mut bucket: Arc<Bucket>) {
        loop {
            let new_depth = bucket.depth() + 1;
            let sibling_id = bucket.id | (1 << (new_depth - 1));
            let sibling = Bucket::new(sibling_id, new_depth);
            bucket.depth.store(new_depth, Ordering::SeqCst);

            for (slot_idx, slot) in bucket.content.iter().enumerate() {
                let mut entry = slot.write();
                let mut keep = Vec::new();
                for itb in entry.items.drain(..) {
                    let bit = (itb.hash >> BUCKET_DEPTH) & (1 << (new_depth - 1));
                    if bit != 0 {
                        itb.set_be(sibling.id, slot_idx);
                        sibling.content[slot_idx].write().items.push(itb);
                        sibling.active.fetch_add(1, Ordering::SeqCst);
                        bucket.active.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        keep.push(itb);
                    }
                }
                entry.items = keep;
            }

            self.update_dir(&sibling);
            self.update_dir(&bucket);

            if sibling.needs_split() {
                bucket = sibling;
                continue;
            }
            if bucket.needs_split() {
                continue;
            }
            break;
        }
    }

    /// `mds_cbht_insert_bbrlocked` generalized: inserts a fresh ITB header,
    /// splitting the owning bucket first if it is already at threshold.
    /// Returns `AlreadyPresent` without mutating state if `(puuid, itbid)`
    /// already exists — this is what makes duplicate `ausplit` delivery safe.
    pub fn insert(&self, puuid: Uuid64, itbid: ItbId) -> (InsertOutcome, Arc<ItbHeader>) {
        let hash = cbht_hash(puuid, itbid);
        loop {
            let bucket = self.search_dir(hash);
            if bucket.needs_split() {
                self.split(bucket);
                continue;
            }
            let slot_idx = bucket.slot(hash);
            let mut entry = bucket.content[slot_idx].write();
            if let Some(existing) = entry.find(puuid, itbid) {
                return (InsertOutcome::AlreadyPresent, existing);
            }
            let header = ItbHeader::new(puuid, itbid, hash, bucket.id, slot_idx);
            entry.items.push(header.clone());
            drop(entry);
            bucket.active.fetch_add(1, Ordering::SeqCst);
            return (InsertOutcome::Inserted, header);
        }
    }

    pub fn search(&self, puuid: Uuid64, itbid: ItbId) -> Option<Arc<ItbHeader>> {
        let hash = cbht_hash(puuid, itbid);
        let bucket = self.search_dir(hash);
        let slot_idx = bucket.slot(hash);
        bucket.content[slot_idx].read().find(puuid, itbid)
    }

    /// `cbht_del`: re-verifies the header is still filed under the bucket it
    /// last recorded; a concurrent split may have moved it, in which case we
    /// retry the directory lookup rather than delete from a stale bucket.
    pub fn del(&self, puuid: Uuid64, itbid: ItbId) -> bool {
        let hash = cbht_hash(puuid, itbid);
        loop {
            let bucket = self.search_dir(hash);
            let slot_idx = bucket.slot(hash);
            let mut entry = bucket.content[slot_idx].write();
            let Some(header) = entry.find(puuid, itbid) else {
                return false;
            };
            if header.be() != (bucket.id, slot_idx) {
                // Moved by a concurrent split; retry from the directory.
                drop(entry);
                continue;
            }
            entry.remove(puuid, itbid);
            drop(entry);
            bucket.active.fetch_sub(1, Ordering::SeqCst);
            return true;
        }
    }

    pub fn dir_len(&self) -> usize {
        1usize << self.dir_depth()
    }
}

impl Default for Cbht {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_search_finds_header() {
        let cbht = Cbht::new();
        let (outcome, header) = cbht.insert(1, 100);
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(header.itbid, 100);
        assert!(cbht.search(1, 100).is_some());
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let cbht = Cbht::new();
        let (first, _) = cbht.insert(1, 100);
        let (second, _) = cbht.insert(1, 100);
        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyPresent);
    }

    #[test]
    fn many_inserts_trigger_split_and_stay_searchable() {
        let cbht = Cbht::new();
        let mut ids = vec![];
        for i in 0..500u64 {
            cbht.insert(7, i);
            ids.push(i);
        }
        assert!(cbht.dir_len() > 1, "directory should have enlarged");
        for id in ids {
            assert!(cbht.search(7, id).is_some(), "itbid {id} went missing");
        }
    }

    #[test]
    fn each_itb_appears_in_exactly_one_bucket_entry() {
        let cbht = Cbht::new();
        for i in 0..300u64 {
            cbht.insert(3, i);
        }
        for i in 0..300u64 {
            let header = cbht.search(3, i).unwrap();
            let (bucket_id, slot) = header.be();
            let bucket = cbht.search_dir(header.hash);
            assert_eq!(bucket.id, bucket_id);
            assert!(bucket.content[slot].read().find(3, i).is_some());
        }
    }

    #[test]
    fn del_removes_and_is_not_found_again() {
        let cbht = Cbht::new();
        cbht.insert(2, 5);
        assert!(cbht.del(2, 5));
        assert!(cbht.search(2, 5).is_none());
        assert!(!cbht.del(2, 5));
    }
}
