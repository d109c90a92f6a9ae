//! Consistent-hash ring with virtual nodes (spec.md §4.1 / C1), grounded in
//! `r2/mgr.h`'s `ring_entry`/`ring_mgr`. Rings are grouped by `(fsid, role)`
//! so MDS and MDSL each get their own membership view; updates are
//! copy-on-write so a concurrent reader never observes a torn ring.

use crate::hash::combine;
use crate::types::{Role, SiteId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Virtual nodes per site; spec.md §4.1 suggests 64-256, we take the low end
/// as default and let callers override for tests.
pub const VID_MAX_DEFAULT: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingPoint {
    pub point: u64,
    pub vid: u32,
    pub site: SiteId,
}

/// Immutable snapshot of one ring group's point table. Readers hold an `Arc`
/// clone; writers build a new table and swap it in, so a lookup in progress
/// never sees a half-updated vector (spec.md §4.1 "a concurrent update never
/// frees a ring under a live reader").
#[derive(Debug, Clone, Default)]
pub struct RingTable {
    points: Vec<RingPoint>,
}

impl RingTable {
    /// Binary search for the first point `>= H(key, salt)`, wrapping to the
    /// first point if the key hashes past the end.
    pub fn get_point(&self, key: u64, salt: u64) -> Option<SiteId> {
        if self.points.is_empty() {
            return None;
        }
        let target = combine(key, salt);
        let idx = self.points.partition_point(|p| p.point < target);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].site)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn sites(&self) -> Vec<SiteId> {
        let mut v: Vec<SiteId> = self.points.iter().map(|p| p.site).collect();
        v.sort();
        v.dedup();
        v
    }
}

/// One ring group, keyed by `(fsid, role)` in `RingMgr`. Holds a
/// copy-on-update `Arc<RingTable>` plus the raw per-site vid counts needed to
/// regenerate it on membership change.
pub struct RingEntry {
    vid_max: u32,
    members: RwLock<HashMap<SiteId, ()>>,
    table: RwLock<Arc<RingTable>>,
}

impl RingEntry {
    pub fn new(vid_max: u32) -> Self {
        Self {
            vid_max,
            members: RwLock::new(HashMap::new()),
            table: RwLock::new(Arc::new(RingTable::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<RingTable> {
        self.table.read().clone()
    }

    /// Adds `VID_MAX` virtual points for `site` and re-sorts. Idempotent: a
    /// site already present is a no-op (spec.md invariant 4, ring
    /// idempotence).
    pub fn add_point(&self, site: SiteId) {
        let mut members = self.members.write();
        if members.insert(site, ()).is_some() {
            return;
        }
        drop(members);
        self.resort();
    }

    /// Removes all of `site`'s virtual points and re-sorts.
    pub fn remove_point(&self, site: SiteId) {
        let mut members = self.members.write();
        if members.remove(&site).is_none() {
            return;
        }
        drop(members);
        self.resort();
    }

    fn resort(&self) {
        let members: Vec<SiteId> = self.members.read().keys().copied().collect();
        let mut points = Vec::with_capacity(members.len() * self.vid_max as usize);
        for site in members {
            for vid in 0..self.vid_max {
                let point = combine(site.0, vid as u64);
                points.push(RingPoint { point, vid, site });
            }
        }
        points.sort_by_key(|p| (p.point, p.vid, p.site));
        let mut table = self.table.write();
        *table = Arc::new(RingTable { points });
    }

    pub fn dynamic_add_site(&self, site: SiteId) {
        self.add_point(site);
    }

    pub fn dynamic_del_site(&self, site: SiteId) {
        self.remove_point(site);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingGroupId {
    pub fsid: u64,
    pub role: Role,
}

/// Ring manager: one `RingEntry` per `(fsid, role)` group, grounded in
/// `ring_mgr`'s `regular_hash` keyed by ring group id.
pub struct RingMgr {
    groups: RwLock<HashMap<RingGroupId, Arc<RingEntry>>>,
    vid_max: u32,
}

impl RingMgr {
    pub fn new() -> Self {
        Self::with_vid_max(VID_MAX_DEFAULT)
    }

    pub fn with_vid_max(vid_max: u32) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            vid_max,
        }
    }

    pub fn group(&self, id: RingGroupId) -> Arc<RingEntry> {
        if let Some(g) = self.groups.read().get(&id) {
            return g.clone();
        }
        let mut groups = self.groups.write();
        groups
            .entry(id)
            .or_insert_with(|| Arc::new(RingEntry::new(self.vid_max)))
            .clone()
    }
}

impl Default for RingMgr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mds(n: u64) -> SiteId {
        SiteId::new(Role::Mds, n)
    }

    #[test]
    fn lookup_resolves_to_a_member_site() {
        let ring = RingEntry::new(32);
        ring.add_point(mds(1));
        ring.add_point(mds(2));
        let snap = ring.snapshot();
        let site = snap.get_point(0xdead_beef, 7).unwrap();
        assert!(site == mds(1) || site == mds(2));
    }

    #[test]
    fn empty_ring_has_no_point() {
        let ring = RingEntry::new(32);
        let snap = ring.snapshot();
        assert!(snap.get_point(1, 1).is_none());
    }

    #[test]
    fn add_then_remove_restores_idempotence() {
        let ring = RingEntry::new(16);
        ring.add_point(mds(1));
        let baseline: Vec<RingPoint> = ring.snapshot().points.clone();

        ring.add_point(mds(2));
        ring.remove_point(mds(2));
        let after: Vec<RingPoint> = ring.snapshot().points.clone();

        assert_eq!(baseline.len(), after.len());
        let mut b = baseline;
        let mut a = after;
        b.sort();
        a.sort();
        assert_eq!(b, a);
    }

    #[test]
    fn repeated_add_is_a_no_op() {
        let ring = RingEntry::new(16);
        ring.add_point(mds(1));
        let before = ring.snapshot().len();
        ring.add_point(mds(1));
        assert_eq!(ring.snapshot().len(), before);
    }

    #[test]
    fn ring_mgr_groups_are_independent() {
        let mgr = RingMgr::new();
        let mds_group = mgr.group(RingGroupId {
            fsid: 0,
            role: Role::Mds,
        });
        let mdsl_group = mgr.group(RingGroupId {
            fsid: 0,
            role: Role::Mdsl,
        });
        mds_group.add_point(mds(1));
        assert_eq!(mds_group.snapshot().len(), mdsl_group.snapshot().len() + VID_MAX_DEFAULT as usize);
    }
}
