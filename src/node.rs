//! Consolidates the original's global `hmo`/`hmi`/`hro` state into one
//! per-process context, matching the open question decided in
//! SPEC_FULL.md §D (Design Note §9): one `Node` carries everything a role's
//! request handlers need instead of module-level globals.

use crate::cbht::Cbht;
use crate::config::Config;
use crate::dh::{BitmapCache, DirectoryHash};
use crate::r2::RootService;
use crate::ring::RingMgr;
use crate::txg::TxgManager;
use crate::types::{Role, SiteId};
use mdsl::StorageEngine;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An MDS node's working state: its CBHT, directory hash + bitmap cache,
/// TXG manager, ring view, and the storage engine it flushes through.
pub struct MdsNode {
    pub site_id: SiteId,
    pub config: Config,
    pub cbht: Cbht,
    pub dh: DirectoryHash,
    pub bc: BitmapCache,
    pub txg: TxgManager,
    pub ring: RingMgr,
    pub storage: StorageEngine,
    uuid_counter: AtomicU64,
}

impl MdsNode {
    pub fn new(site_id: SiteId, config: Config) -> Self {
        let storage = StorageEngine::new(&config.data_dir);
        Self {
            site_id,
            config,
            cbht: Cbht::new(),
            dh: DirectoryHash::new(4096),
            bc: BitmapCache::new(),
            txg: TxgManager::new(),
            ring: RingMgr::new(),
            storage,
            uuid_counter: AtomicU64::new(1),
        }
    }

    /// Allocates a fresh directory-entry uuid for a name created locally by
    /// this MDS (spec.md §8 scenario 1: "the MDS allocates a fresh uuid").
    pub fn alloc_uuid(&self) -> u64 {
        self.uuid_counter.fetch_add(1, Ordering::SeqCst)
    }
}

/// An R2 node's working state: its registry plus the config it was started
/// with.
pub struct R2Node {
    pub config: Config,
    pub registry: RootService,
}

impl R2Node {
    pub fn new(config: Config) -> Self {
        let storage = StorageEngine::new(&config.data_dir);
        Self {
            registry: RootService::new(storage),
            config,
        }
    }

    pub fn site_id_for(&self, role: Role, ordinal: u64) -> SiteId {
        SiteId::new(role, ordinal)
    }
}

pub type Shared<T> = Arc<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mds_node_boots_with_empty_cbht() {
        let dir = std::env::temp_dir().join(format!("node-test-{}", std::process::id()));
        let mut cfg = Config::default();
        cfg.data_dir = dir.to_string_lossy().to_string();
        let node = MdsNode::new(SiteId::new(Role::Mds, 1), cfg);
        assert_eq!(node.dh.len(), 0);
        assert_eq!(node.cbht.dir_len(), 1);
    }
}
