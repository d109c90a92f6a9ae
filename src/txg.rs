//! Transaction group commit path (spec.md §4.5 / C5), grounded on
//! `mdsl.h`'s `txg_compact_cache` and `mds/m2m.c`'s cross-site forwarding:
//! numbered epochs batch dirty ITBs, a timer rotates and flushes them
//! through C2, and `TXG_END` fences recovery. `ausplit`/`aubitmap` model the
//! two asynchronous notification kinds spec.md §4.5 calls out.

use crate::cbht::{Cbht, InsertOutcome, ItbHeader};
use crate::types::{ItbId, SiteId, Txg as TxgId, Uuid64};
use mdsl::StorageEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Outcome of registering a dirty ITB: either it joined the current epoch's
/// dirty list fresh, or it was already dirty in an older, not-yet-flushed
/// epoch and had to be COW-forked (spec.md §4.5: "An ITB may appear in at
/// most one TXG at a time; if a second mutation arrives in a later epoch the
/// ITB is COW-forked").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    CowForked,
}

/// One numbered epoch's dirty-ITB set.
pub struct TxgEpoch {
    pub id: TxgId,
    dirty: Mutex<Vec<Arc<ItbHeader>>>,
    refcount: AtomicUsize,
}

impl TxgEpoch {
    fn new(id: TxgId) -> Arc<Self> {
        Arc::new(Self {
            id,
            dirty: Mutex::new(Vec::new()),
            refcount: AtomicUsize::new(0),
        })
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }
}

/// Drives epoch rotation, dirtying, and flush for one directory's ITBs.
/// Real deployments run one of these per MDS instance; tests typically run
/// one against a scratch `StorageEngine`.
pub struct TxgManager {
    current: Mutex<Arc<TxgEpoch>>,
    next_id: AtomicU64,
    itb_epoch: Mutex<HashMap<(Uuid64, ItbId), TxgId>>,
}

impl TxgManager {
    pub fn new() -> Self {
        let first = TxgEpoch::new(0);
        Self {
            current: Mutex::new(first),
            next_id: AtomicU64::new(1),
            itb_epoch: Mutex::new(HashMap::new()),
        }
    }

    /// `get_open_txg`.
    pub fn get_open_txg(&self) -> Arc<TxgEpoch> {
        self.current.lock().clone()
    }

    /// `txg_add_itb`: pins `itb` into `txg`'s dirty list. If `itb` was
    /// already registered in an older still-open epoch, that's a COW fork —
    /// the caller is expected to have already cloned the ITB payload before
    /// calling this; we just record which epoch now owns the latest copy.
    pub fn txg_add_itb(&self, txg: &Arc<TxgEpoch>, itb: Arc<ItbHeader>) -> AddOutcome {
        let key = (itb.puuid, itb.itbid);
        let mut map = self.itb_epoch.lock();
        let outcome = match map.get(&key) {
            Some(&prior) if prior != txg.id => AddOutcome::CowForked,
            Some(_) => {
                // Already dirty in this same epoch; nothing new to pin.
                return AddOutcome::Added;
            }
            None => AddOutcome::Added,
        };
        map.insert(key, txg.id);
        drop(map);
        txg.refcount.fetch_add(1, Ordering::SeqCst);
        itb.txg.store(txg.id as usize, Ordering::SeqCst);
        txg.dirty.lock().push(itb);
        outcome
    }

    /// `txg_put`: releases this caller's interest in `txg`.
    pub fn txg_put(&self, txg: &Arc<TxgEpoch>) {
        txg.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    /// Closes the current epoch and opens a fresh one, returning the closed
    /// epoch for the caller to flush (asynchronously, per spec.md §4.5).
    pub fn rotate(&self) -> Arc<TxgEpoch> {
        let next = TxgEpoch::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut current = self.current.lock();
        std::mem::replace(&mut *current, next)
    }

    /// Flushes every dirty ITB in `epoch` for `uuid` through the storage
    /// engine, then writes the `TXG_END` fence. `serialize` turns an ITB
    /// header into the bytes MDSL should persist (the caller owns the
    /// actual ITB payload; this module only tracks headers).
    pub fn flush_epoch(
        &self,
        engine: &StorageEngine,
        uuid: Uuid64,
        epoch: &Arc<TxgEpoch>,
        serialize: impl Fn(&ItbHeader) -> Vec<u8>,
    ) -> mdsl::Result<()> {
        let items: Vec<Arc<ItbHeader>> = epoch.dirty.lock().drain(..).collect();
        for itb in &items {
            let bytes = serialize(itb);
            engine.flush(uuid, itb.itbid, &bytes)?;
        }
        engine.write_txg_end(uuid, epoch.id)?;
        let mut map = self.itb_epoch.lock();
        for itb in &items {
            map.remove(&(itb.puuid, itb.itbid));
        }
        Ok(())
    }
}

impl Default for TxgManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Recovery gate: an epoch's writes are only trustworthy once its
/// `TXG_END` fence is durable (spec.md §4.5, invariant 6). A restart that
/// finds no fence for `epoch` must treat every ITB dirtied under it as
/// absent, regardless of whatever bytes happen to already be on disk from
/// the interrupted flush.
pub fn is_committed(engine: &StorageEngine, uuid: Uuid64, epoch: TxgId) -> mdsl::Result<bool> {
    Ok(engine.last_committed_txg(uuid)?.map_or(false, |last| last >= epoch))
}

/// A migrated ITB header shipped to a peer MDS after a cross-site split
/// (spec.md §4.5 `ausplit`). Receipt is handled by `apply_ausplit`, which
/// relies on `Cbht::insert`'s own idempotence for duplicate delivery.
#[derive(Debug, Clone, Copy)]
pub struct AusplitMessage {
    pub source: SiteId,
    pub puuid: Uuid64,
    pub itbid: ItbId,
}

/// Applies an incoming `ausplit`: pre-dirties the ITB into the destination's
/// current TXG and inserts it into the destination's CBHT. A duplicate
/// delivery (the ITB already present) is dropped with a warning rather than
/// treated as an error.
pub fn apply_ausplit(
    cbht: &Cbht,
    txg_mgr: &TxgManager,
    msg: AusplitMessage,
) -> AddOutcome {
    let (outcome, header) = cbht.insert(msg.puuid, msg.itbid);
    if outcome == InsertOutcome::AlreadyPresent {
        log::warn!(
            "duplicate ausplit for ({}, {}) from {}, dropping",
            msg.puuid,
            msg.itbid,
            msg.source
        );
        return AddOutcome::Added;
    }
    let txg = txg_mgr.get_open_txg();
    let result = txg_mgr.txg_add_itb(&txg, header);
    txg_mgr.txg_put(&txg);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn engine(name: &str) -> StorageEngine {
        let dir = std::env::temp_dir().join(format!("txg-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        StorageEngine::new(dir)
    }

    #[test]
    fn add_then_rotate_and_flush_writes_txg_end() {
        let mgr = TxgManager::new();
        let cbht = Cbht::new();
        let store = engine("flush");

        let txg = mgr.get_open_txg();
        for i in 0..5u64 {
            let (_, header) = cbht.insert(1, i);
            mgr.txg_add_itb(&txg, header);
        }
        assert_eq!(txg.dirty_count(), 5);

        let closed = mgr.rotate();
        assert_eq!(closed.id, txg.id);
        mgr.flush_epoch(&store, 1, &closed, |h| h.itbid.to_le_bytes().to_vec())
            .unwrap();

        assert_eq!(store.last_committed_txg(1).unwrap(), Some(closed.id));
        for i in 0..5u64 {
            let bytes = store.read(1, i, 8).unwrap();
            assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), i);
        }
    }

    #[test]
    fn second_epoch_dirtying_same_itb_is_cow_forked() {
        let mgr = TxgManager::new();
        let cbht = Cbht::new();
        let (_, header) = cbht.insert(1, 42);

        let txg1 = mgr.get_open_txg();
        assert_eq!(mgr.txg_add_itb(&txg1, header.clone()), AddOutcome::Added);

        let _closed = mgr.rotate();
        let txg2 = mgr.get_open_txg();
        assert_eq!(mgr.txg_add_itb(&txg2, header), AddOutcome::CowForked);
    }

    #[test]
    fn ausplit_receipt_is_idempotent() {
        let cbht = Cbht::new();
        let mgr = TxgManager::new();
        let msg = AusplitMessage {
            source: SiteId::new(Role::Mds, 9),
            puuid: 3,
            itbid: 77,
        };
        apply_ausplit(&cbht, &mgr, msg);
        assert!(cbht.search(3, 77).is_some());
        // Duplicate delivery must not panic or duplicate bookkeeping.
        apply_ausplit(&cbht, &mgr, msg);
        assert!(cbht.search(3, 77).is_some());
    }
}
