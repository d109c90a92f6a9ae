//! Directory hash table and bitmap cache (spec.md §4.3 / C3), grounded on
//! `r2/mgr.h`'s `root_entry` (fsid-scoped salts/ring binding) since no
//! `mds/dh.c` was retrieved; the bitmap slice shape follows `mdsl::bitmap`.

use crate::ring::RingGroupId;
use crate::types::{Fsid, ItbId, Role, Uuid64};
use lru::LruCache;
use mdsl::bitmap::SLICE_BYTES;
use mdsl::StorageEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-directory record (DHE). `salt` seeds entry-to-ITB hashing within the
/// directory; `ring` names which consistent-hash ring group owns it.
#[derive(Debug, Clone)]
pub struct DirectoryHashEntry {
    pub uuid: Uuid64,
    pub puuid: Uuid64,
    pub salt: u64,
    pub ring: RingGroupId,
}

impl DirectoryHashEntry {
    pub fn root(fsid: Fsid, root_uuid: Uuid64, root_salt: u64) -> Self {
        Self {
            uuid: root_uuid,
            puuid: root_uuid,
            salt: root_salt,
            ring: RingGroupId {
                fsid,
                role: Role::Mds,
            },
        }
    }
}

/// A pinned DHE: while any ITB of the directory is in flight the entry must
/// not be evicted from the bounded LRU (spec.md §4.3).
struct PinnedEntry {
    dhe: DirectoryHashEntry,
    pins: AtomicUsize,
}

pub struct DirectoryHash {
    cache: Mutex<LruCache<Uuid64, Arc<PinnedEntry>>>,
}

impl DirectoryHash {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the cached DHE, or inserts `loader`'s result on miss. Mirrors
    /// `dh_search`; the actual SDT/GDT double-hop is the caller's job (it
    /// knows how to resolve `uuid` from a name when not already known).
    pub fn search_or_insert(
        &self,
        uuid: Uuid64,
        loader: impl FnOnce() -> DirectoryHashEntry,
    ) -> DirectoryHashEntry {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(&uuid) {
            return entry.dhe.clone();
        }
        let dhe = loader();
        cache.put(
            uuid,
            Arc::new(PinnedEntry {
                dhe: dhe.clone(),
                pins: AtomicUsize::new(0),
            }),
        );
        dhe
    }

    /// Pins `uuid` so the LRU won't evict it while an ITB is in flight.
    pub fn pin(&self, uuid: Uuid64) {
        if let Some(entry) = self.cache.lock().peek(&uuid) {
            entry.pins.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn unpin(&self, uuid: Uuid64) {
        if let Some(entry) = self.cache.lock().peek(&uuid) {
            entry.pins.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Rounds `offset` down to the start of the slice containing it, clamped to
/// `[0, size*8)` bits of addressable itb-id space — `bitmap_cut` in spec.md.
pub fn bitmap_cut(offset: u64, size: u64) -> u64 {
    mdsl::bitmap::bitmap_cut(offset, size)
}

#[derive(Debug, Clone)]
pub struct BitmapSlice {
    pub data: Vec<u8>,
    pub is_end: bool,
}

impl BitmapSlice {
    pub fn bit_is_set(&self, itbid: ItbId, slice_offset: u64) -> bool {
        mdsl::bitmap::bit_is_set(&self.data, slice_offset, itbid)
    }
}

/// Queued bitmap flip awaiting an `aubitmap` forward to R2 (spec.md §4.3,
/// §4.5). `sender` is who observed the flip, for duplicate suppression on
/// the receiving end.
#[derive(Debug, Clone, Copy)]
pub struct BitmapDelta {
    pub sender: crate::types::SiteId,
    pub uuid: Uuid64,
    pub itbid: ItbId,
}

/// Bitmap cache (BC): `(uuid, offset) -> slice` with asynchronous
/// miss-loading from MDSL and a drain queue for deltas headed to R2.
pub struct BitmapCache {
    slices: Mutex<HashMap<(Uuid64, u64), Arc<BitmapSlice>>>,
    deltas: Mutex<Vec<BitmapDelta>>,
}

impl BitmapCache {
    pub fn new() -> Self {
        Self {
            slices: Mutex::new(HashMap::new()),
            deltas: Mutex::new(Vec::new()),
        }
    }

    /// `bc_get`: hit returns a shared reference; a miss on slice 0 of a
    /// directory whose bitmap file has never been written synthesises an
    /// all-present default slice (spec.md §4.3). Any other miss — including
    /// a query past the stored extent of an existing, populated bitmap — is
    /// a genuine `NoEntry`, matching the `BITMAP_END` boundary behavior of
    /// spec.md §8: the slice ending exactly at the bitmap's extent reports
    /// `is_end`, and the next slice past it is absent, not "all present".
    pub fn bc_get(
        &self,
        engine: &StorageEngine,
        uuid: Uuid64,
        offset: u64,
    ) -> mdsl::Result<Arc<BitmapSlice>> {
        if let Some(hit) = self.slices.lock().get(&(uuid, offset)).cloned() {
            return Ok(hit);
        }
        let loaded = match engine.bitmap_load(uuid, offset)? {
            Some((data, flag)) => BitmapSlice {
                data,
                is_end: matches!(flag, mdsl::bitmap::SliceFlag::End),
            },
            None if offset == 0 && engine.bitmap_len(uuid)? == 0 => BitmapSlice {
                data: mdsl::bitmap::synth_default_slice(),
                is_end: true,
            },
            None => {
                return Err(mdsl::MdslError::NotFound {
                    uuid,
                    itbid: offset * 8,
                })
            }
        };
        let arc = Arc::new(loaded);
        // A race between two misses keeps the first insert; the loser's
        // work is simply discarded (spec.md §4.3).
        let mut slices = self.slices.lock();
        let winner = slices.entry((uuid, offset)).or_insert_with(|| arc.clone());
        Ok(winner.clone())
    }

    /// Queues a bitmap bit flip observed locally (e.g. after a split installs
    /// a new ITB). Drained asynchronously into `aubitmap` messages.
    pub fn queue_delta(&self, delta: BitmapDelta) {
        self.deltas.lock().push(delta);
    }

    pub fn drain_deltas(&self) -> Vec<BitmapDelta> {
        std::mem::take(&mut *self.deltas.lock())
    }

    pub fn slice_count(&self) -> usize {
        self.slices.lock().len()
    }
}

impl Default for BitmapCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, SiteId};

    #[test]
    fn bitmap_cut_rounds_down_to_slice_boundary() {
        let size = SLICE_BYTES as u64 * 4;
        assert_eq!(bitmap_cut(0, size), 0);
        assert!(bitmap_cut(size * 2 + 5, size) <= size * 2 + 5);
    }

    #[test]
    fn dh_search_or_insert_caches_loader_result() {
        let dh = DirectoryHash::new(8);
        let mut calls = 0;
        let mut load = || {
            calls += 1;
            DirectoryHashEntry::root(0, 7, 42)
        };
        let a = dh.search_or_insert(7, &mut load);
        let b = dh.search_or_insert(7, &mut load);
        assert_eq!(a.uuid, b.uuid);
        assert_eq!(calls, 1);
    }

    #[test]
    fn bc_get_synthesises_default_slice_for_new_directory() {
        let dir = std::env::temp_dir().join(format!("mdsl-dh-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let engine = StorageEngine::new(dir);
        let bc = BitmapCache::new();
        let slice = bc.bc_get(&engine, 99, 0).unwrap();
        assert!(slice.data.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn bc_get_past_populated_extent_is_not_found() {
        let dir = std::env::temp_dir().join(format!("mdsl-dh-test-past-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let engine = StorageEngine::new(dir);
        let bc = BitmapCache::new();
        engine.bitmap_store(99, 0, &mdsl::bitmap::synth_default_slice()).unwrap();
        let far_offset = mdsl::bitmap::SLICE_BYTES as u64 * 1000;
        let err = bc.bc_get(&engine, 99, far_offset).unwrap_err();
        assert!(matches!(err, mdsl::MdslError::NotFound { .. }));
    }

    #[test]
    fn delta_queue_drains_in_order() {
        let bc = BitmapCache::new();
        let site = SiteId::new(Role::Mds, 1);
        bc.queue_delta(BitmapDelta {
            sender: site,
            uuid: 1,
            itbid: 10,
        });
        bc.queue_delta(BitmapDelta {
            sender: site,
            uuid: 1,
            itbid: 11,
        });
        let drained = bc.drain_deltas();
        assert_eq!(drained.len(), 2);
        assert!(bc.drain_deltas().is_empty());
    }
}
