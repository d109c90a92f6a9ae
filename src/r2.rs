//! Root/registry service (spec.md §4.6 / C6), grounded directly in
//! `r2/mgr.h`'s `site_mgr`/`site_entry`/`root_mgr`/`root_entry`/`addr_mgr`.
//! Owns site-id allocation, per-site checkpoint (hxi) persistence via the
//! storage engine, ring/address-table distribution, and the heartbeat
//! sweeper.

use crate::error::{Error, Result};
use crate::ring::{RingGroupId, RingMgr};
use crate::types::{Fsid, Role, SiteId};
use mdsl::StorageEngine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteState {
    Init,
    Normal,
    Transient,
    Error,
    Shutdown,
}

/// `site_entry`: per-registered-site bookkeeping, indexed by site-id.
#[derive(Debug, Clone)]
pub struct SiteEntry {
    pub site_id: SiteId,
    pub fsid: Fsid,
    pub state: SiteState,
    pub hb_lost: u8,
    pub last_hb: Instant,
}

/// Site checkpoint (hxi): monotonic counters plus fsid-scoped salts,
/// persisted on unregister and periodically (spec.md glossary "hxi").
#[derive(Debug, Clone, Copy, Default)]
pub struct Hxi {
    pub mi_tx: u64,
    pub mi_txg: u64,
    pub mi_uuid: u64,
    pub mi_fnum: u64,
}

impl Hxi {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.mi_tx.to_le_bytes());
        buf.extend_from_slice(&self.mi_txg.to_le_bytes());
        buf.extend_from_slice(&self.mi_uuid.to_le_bytes());
        buf.extend_from_slice(&self.mi_fnum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 32 {
            return None;
        }
        let take = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        Some(Self {
            mi_tx: take(0),
            mi_txg: take(8),
            mi_uuid: take(16),
            mi_fnum: take(24),
        })
    }
}

/// Root entry (per-fsid): the GDT is the directory-of-directories, rooted at
/// `root_uuid`/`root_salt` with its own growable bitmap.
#[derive(Debug, Clone)]
pub struct RootEntry {
    pub fsid: Fsid,
    pub gdt_uuid: u64,
    pub gdt_salt: u64,
    pub root_uuid: u64,
    pub root_salt: u64,
}

/// Reply payload for a successful `reg`, in the wire order spec.md §4.6
/// specifies: `hxi | mds-ring | mdsl-ring | root_tx | gdt_bitmap | addr-table`.
pub struct RegReply {
    pub hxi: Hxi,
    pub mds_ring: RingGroupId,
    pub mdsl_ring: RingGroupId,
    pub root: RootEntry,
    pub addr_table: Vec<(SiteId, String)>,
    /// Set when the site's last shutdown was unclean (spec.md §4.6: "if the
    /// last shutdown was unclean, returns Recover"). The registration itself
    /// still succeeds; this just tells the caller to run its recovery path
    /// before trusting the returned `hxi` counters.
    pub needs_recovery: bool,
}

struct AddrMgr {
    table: RwLock<HashMap<SiteId, String>>,
}

impl AddrMgr {
    fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    fn snapshot_for(&self, _fsid: Fsid) -> Vec<(SiteId, String)> {
        self.table
            .read()
            .iter()
            .map(|(s, a)| (*s, a.clone()))
            .collect()
    }

    fn set(&self, site: SiteId, addr: String) {
        self.table.write().insert(site, addr);
    }

    fn remove(&self, site: SiteId) {
        self.table.write().remove(&site);
    }
}

/// Heartbeat-loss threshold past which a site is marked `ERROR`
/// (spec.md §4.6 "Thresholds mark ERROR").
pub const HB_LOST_THRESHOLD: u8 = 3;

pub struct RootService {
    engine: StorageEngine,
    ring: RingMgr,
    addr: AddrMgr,
    sites: RwLock<HashMap<SiteId, SiteEntry>>,
    roots: RwLock<HashMap<Fsid, RootEntry>>,
    next_ordinal: AtomicU64,
    uuid_counter: AtomicU64,
}

impl RootService {
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine,
            ring: RingMgr::new(),
            addr: AddrMgr::new(),
            sites: RwLock::new(HashMap::new()),
            roots: RwLock::new(HashMap::new()),
            next_ordinal: AtomicU64::new(1),
            uuid_counter: AtomicU64::new(1),
        }
    }

    fn alloc_uuid(&self) -> u64 {
        self.uuid_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Registration: resolves or assigns a site-id, loads or creates its
    /// hxi, and returns the standing reply bundle. `requested` is `None` for
    /// `site_id == -1` (first-time registration).
    pub fn reg(
        &self,
        requested: Option<SiteId>,
        fsid: Fsid,
        role: Role,
        addr: String,
    ) -> Result<(SiteId, RegReply)> {
        let site_id = requested.unwrap_or_else(|| {
            SiteId::new(role, self.next_ordinal.fetch_add(1, Ordering::SeqCst))
        });

        let hxi_uuid = 1u64 << 48 | site_id.0;
        let (hxi, unclean) = self.load_or_create_hxi(hxi_uuid)?;

        {
            let mut sites = self.sites.write();
            sites
                .entry(site_id)
                .and_modify(|e| {
                    e.state = SiteState::Normal;
                    e.hb_lost = 0;
                    e.last_hb = Instant::now();
                })
                .or_insert_with(|| SiteEntry {
                    site_id,
                    fsid,
                    state: SiteState::Normal,
                    hb_lost: 0,
                    last_hb: Instant::now(),
                });
        }

        self.addr.set(site_id, addr);
        self.ring_group(fsid, role).add_point(site_id);

        let root = {
            let roots = self.roots.read();
            roots.get(&fsid).cloned()
        };
        let root = match root {
            Some(r) => r,
            None => self.mkfs(fsid)?,
        };

        let reply = RegReply {
            hxi,
            mds_ring: RingGroupId {
                fsid,
                role: Role::Mds,
            },
            mdsl_ring: RingGroupId {
                fsid,
                role: Role::Mdsl,
            },
            root,
            addr_table: self.addr.snapshot_for(fsid),
            needs_recovery: unclean,
        };

        Ok((site_id, reply))
    }

    fn load_or_create_hxi(&self, uuid: u64) -> Result<(Hxi, bool)> {
        match self.engine.read(uuid, 0, 32) {
            Ok(bytes) => {
                let hxi = Hxi::decode(&bytes).unwrap_or_default();
                let unclean = self.engine.last_committed_txg(uuid)?.is_none() && hxi.mi_txg > 0;
                Ok((hxi, unclean))
            }
            Err(mdsl::MdslError::NotFound { .. }) => {
                let hxi = Hxi::default();
                self.engine.flush(uuid, 0, &hxi.encode())?;
                Ok((hxi, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persists `hxi` for `site_id`, as done on unregister and periodically.
    pub fn persist_hxi(&self, site_id: SiteId, hxi: Hxi) -> Result<()> {
        let uuid = 1u64 << 48 | site_id.0;
        self.engine.flush(uuid, 0, &hxi.encode())?;
        Ok(())
    }

    pub fn unregister(&self, site_id: SiteId, hxi: Hxi) -> Result<()> {
        self.persist_hxi(site_id, hxi)?;
        if let Some(entry) = self.sites.write().get_mut(&site_id) {
            entry.state = SiteState::Shutdown;
        }
        Ok(())
    }

    pub fn update(&self, site_id: SiteId, hxi: Hxi) -> Result<()> {
        self.persist_hxi(site_id, hxi)
    }

    /// Creates the root entry for `fsid`. A second call for the same `fsid`
    /// is a no-op error: `root_tx` is established once, for good, and a
    /// caller racing a prior `mkfs` must be told nothing changed rather than
    /// silently handed back the existing record (spec.md §8 "mkfs(fsid);
    /// mkfs(fsid) -> Exists with unchanged root_tx").
    pub fn mkfs(&self, fsid: Fsid) -> Result<RootEntry> {
        if self.roots.read().contains_key(&fsid) {
            return Err(Error::Exists);
        }
        let gdt_uuid = self.alloc_uuid();
        let root_uuid = self.alloc_uuid();
        let entry = RootEntry {
            fsid,
            gdt_uuid,
            gdt_salt: crate::hash::mix64(gdt_uuid),
            root_uuid,
            root_salt: crate::hash::mix64(root_uuid ^ 0xbeef),
        };
        // First bit set: the root directory's own ITB slice 0 exists.
        self.engine.bitmap_store(gdt_uuid, 0, &mdsl::bitmap::synth_default_slice())?;
        let mut roots = self.roots.write();
        if roots.contains_key(&fsid) {
            return Err(Error::Exists);
        }
        roots.insert(fsid, entry.clone());
        Ok(entry)
    }

    fn ring_group(&self, fsid: Fsid, role: Role) -> std::sync::Arc<crate::ring::RingEntry> {
        self.ring.group(RingGroupId { fsid, role })
    }

    /// Heartbeat receipt: resets `hb_lost` and forces state `NORMAL`.
    pub fn heartbeat(&self, site_id: SiteId) {
        if let Some(entry) = self.sites.write().get_mut(&site_id) {
            entry.hb_lost = 0;
            entry.state = SiteState::Normal;
            entry.last_hb = Instant::now();
        }
    }

    /// Background sweep: increments `hb_lost` for sites that haven't sent a
    /// heartbeat within `period`, marking `ERROR` past the threshold.
    pub fn sweep_heartbeats(&self, period: Duration) {
        let mut sites = self.sites.write();
        for entry in sites.values_mut() {
            if entry.state == SiteState::Shutdown {
                continue;
            }
            if entry.last_hb.elapsed() > period {
                entry.hb_lost = entry.hb_lost.saturating_add(1);
                entry.last_hb = Instant::now();
                if entry.hb_lost >= HB_LOST_THRESHOLD {
                    entry.state = SiteState::Error;
                }
            }
        }
    }

    /// `bitmap`: flips the gdt-bitmap bit for `(gdt_uuid, itbid)` and
    /// replies with the slice touched (the wire layer turns this into
    /// `AUBITMAP_R`).
    pub fn bitmap_flip(&self, gdt_uuid: u64, itbid: u64) -> Result<Vec<u8>> {
        let slice_bytes = mdsl::bitmap::SLICE_BYTES as u64;
        let offset = (itbid / 8 / slice_bytes) * slice_bytes;
        let mut slice = match self.engine.bitmap_load(gdt_uuid, offset)? {
            Some((data, _)) => data,
            None => mdsl::bitmap::synth_default_slice(),
        };
        mdsl::bitmap::set_bit(&mut slice, offset, itbid);
        self.engine.bitmap_store(gdt_uuid, offset, &slice)?;
        Ok(slice)
    }

    /// Online: adds `site_id` to `(fsid, role)`'s ring and broadcasts
    /// (broadcast is the transport layer's job; here we just mutate and
    /// return the new snapshot length for the caller to diff against).
    pub fn online(&self, fsid: Fsid, role: Role, site_id: SiteId) {
        self.ring_group(fsid, role).dynamic_add_site(site_id);
    }

    pub fn offline(&self, fsid: Fsid, role: Role, site_id: SiteId) {
        self.ring_group(fsid, role).dynamic_del_site(site_id);
        self.addr.remove(site_id);
    }

    pub fn site_state(&self, site_id: SiteId) -> Option<SiteState> {
        self.sites.read().get(&site_id).map(|e| e.state)
    }

    pub fn storage(&self) -> &StorageEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> RootService {
        let dir = std::env::temp_dir().join(format!("r2-test-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        RootService::new(StorageEngine::new(dir))
    }

    #[test]
    fn first_registration_assigns_a_site_id_and_mkfs_runs() {
        let r2 = service("reg");
        let (site_id, reply) = r2
            .reg(None, 0, Role::Mds, "127.0.0.1:9000".into())
            .unwrap();
        assert_eq!(site_id.role(), Role::Mds);
        assert_ne!(reply.root.root_salt, 0);
        assert_eq!(r2.site_state(site_id), Some(SiteState::Normal));
    }

    #[test]
    fn mkfs_twice_reports_exists_and_leaves_root_tx_unchanged() {
        let r2 = service("mkfs");
        let a = r2.mkfs(0).unwrap();
        let err = r2.mkfs(0).unwrap_err();
        assert!(matches!(err, Error::Exists));
        let (_, reply) = r2.reg(None, 0, Role::Mds, "127.0.0.1:9001".into()).unwrap();
        assert_eq!(reply.root.root_uuid, a.root_uuid);
        assert_eq!(reply.root.gdt_uuid, a.gdt_uuid);
    }

    #[test]
    fn heartbeat_sweep_marks_error_past_threshold() {
        let r2 = service("hb");
        let (site_id, _) = r2.reg(None, 0, Role::Mds, "a".into()).unwrap();
        for _ in 0..HB_LOST_THRESHOLD {
            r2.sweep_heartbeats(Duration::from_secs(0));
        }
        assert_eq!(r2.site_state(site_id), Some(SiteState::Error));
        r2.heartbeat(site_id);
        assert_eq!(r2.site_state(site_id), Some(SiteState::Normal));
    }

    #[test]
    fn bitmap_flip_sets_the_requested_bit() {
        let r2 = service("bitmap");
        let root = r2.mkfs(0).unwrap();
        let slice = r2.bitmap_flip(root.gdt_uuid, 5).unwrap();
        assert!(mdsl::bitmap::bit_is_set(&slice, 0, 5));
    }

    #[test]
    fn online_offline_round_trips_ring_membership() {
        let r2 = service("ring");
        let site = SiteId::new(Role::Mds, 77);
        r2.online(0, Role::Mds, site);
        assert!(r2.ring_group(0, Role::Mds).snapshot().sites().contains(&site));
        r2.offline(0, Role::Mds, site);
        assert!(!r2.ring_group(0, Role::Mds).snapshot().sites().contains(&site));
    }
}
