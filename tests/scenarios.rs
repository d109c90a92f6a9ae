//! End-to-end scenarios (spec.md §8 seed tests), exercised across the
//! public crate surface rather than single-module units.

use pomegranate::cbht::Cbht;
use pomegranate::config::Config;
use pomegranate::dh::BitmapCache;
use pomegranate::error::Error;
use pomegranate::mds_ops;
use pomegranate::node::MdsNode;
use pomegranate::r2::{RootService, SiteState, HB_LOST_THRESHOLD};
use pomegranate::ring::{RingGroupId, RingMgr};
use pomegranate::txg::{apply_ausplit, is_committed, AusplitMessage, TxgManager};
use pomegranate::{Role, SiteId};

fn engine(name: &str) -> mdsl::StorageEngine {
    let dir = std::env::temp_dir().join(format!("scenario-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    mdsl::StorageEngine::new(dir)
}

/// 1. Register -> mkfs -> create -> lookup.
#[test]
fn register_mkfs_create_lookup() {
    let r2 = RootService::new(engine("reg-mkfs"));
    let (site_id, reply) = r2
        .reg(None, 0, Role::Mds, "127.0.0.1:9000".into())
        .unwrap();
    assert_eq!(site_id.role(), Role::Mds);
    assert_ne!(reply.root.root_salt, 0);

    // A client creates "/a" under the root directory: the MDS allocates a
    // fresh uuid and files a new ITE into the owning MDS's CBHT.
    let mds_dir = std::env::temp_dir().join(format!("scenario-mds-{}", std::process::id()));
    std::fs::create_dir_all(&mds_dir).unwrap();
    let mut cfg = Config::default();
    cfg.data_dir = mds_dir.to_string_lossy().to_string();
    let mds = MdsNode::new(site_id, cfg);

    let new_uuid = mds_ops::create(&mds, reply.root.root_uuid, "a", false).unwrap();

    // hvfs_stat(puuid=root, name="a") resolves back to the same uuid.
    let found = mds_ops::stat(&mds, reply.root.root_uuid, "a").unwrap();
    assert_eq!(found, new_uuid);
}

/// 2. Forced split: enough inserts under one directory eventually overflow a
/// bucket, growing the directory while keeping every ITB searchable.
#[test]
fn forced_split_keeps_every_itb_reachable() {
    let cbht = Cbht::new();
    let puuid = 77;
    let mut itbids = vec![];
    for i in 0..64u64 {
        cbht.insert(puuid, i);
        itbids.push(i);
    }
    assert!(cbht.dir_len() > 1, "directory should have grown past depth 0");
    for id in itbids {
        assert!(cbht.search(puuid, id).is_some());
    }
}

/// 3. Ausplit migration: a split moves ITBs to whichever site the ring
/// currently names as owner; the destination accepts them idempotently and
/// the origin's own ring check for a migrated key reports `RingChange`.
#[test]
fn ausplit_migration_and_ring_change_on_origin() {
    let origin = SiteId::new(Role::Mds, 1);
    let peer = SiteId::new(Role::Mds, 2);

    let ring_mgr = RingMgr::new();
    let ring = ring_mgr.group(RingGroupId { fsid: 0, role: Role::Mds });
    ring.add_point(origin);
    ring.add_point(peer);

    let peer_cbht = Cbht::new();
    let peer_txg = TxgManager::new();

    let puuid = 5;
    let migrated_itbid = 1234;
    let owner = ring.snapshot().get_point(migrated_itbid, puuid).unwrap();

    // Migrate to whichever site the ring actually names (vnode placement is
    // content-addressed, not a fixed modulo, so we resolve it rather than
    // assume which of origin/peer wins).
    let msg = AusplitMessage {
        source: origin,
        puuid,
        itbid: migrated_itbid,
    };
    apply_ausplit(&peer_cbht, &peer_txg, msg);

    if owner == peer {
        assert!(peer_cbht.search(puuid, migrated_itbid).is_some());
    }

    // The origin, consulting the current ring for this key, must not claim
    // ownership of a key the ring now routes elsewhere.
    let route_check = |local: SiteId| -> Result<(), Error> {
        let current_owner = ring.snapshot().get_point(migrated_itbid, puuid).unwrap();
        if current_owner != local {
            Err(Error::RingChange)
        } else {
            Ok(())
        }
    };
    if owner != origin {
        assert!(matches!(route_check(origin), Err(Error::RingChange)));
    }
}

/// 4. Storage recovery: writes under an epoch are not trusted until that
/// epoch's `TXG_END` fence is durable.
#[test]
fn storage_recovery_gates_on_txg_end() {
    let store = engine("recovery");
    let uuid = 42;

    for i in 0..100u64 {
        store.flush(uuid, i, &i.to_le_bytes()).unwrap();
    }
    // Crash before TXG_END(5): nothing commits this epoch yet.
    assert!(!is_committed(&store, uuid, 5).unwrap());

    store.write_txg_end(uuid, 5).unwrap();
    assert!(is_committed(&store, uuid, 5).unwrap());

    // TXG 6 proceeds normally afterwards.
    store.flush(uuid, 200, b"txg6-itb").unwrap();
    store.write_txg_end(uuid, 6).unwrap();
    assert!(is_committed(&store, uuid, 6).unwrap());
    assert!(!is_committed(&store, uuid, 7).unwrap());
}

/// 5. Bitmap flip + aubitmap: R2's authoritative gdt-bitmap reflects a flip
/// triggered by a split, and a bitmap-cache reader observes the same bit.
#[test]
fn bitmap_flip_is_observable_through_bitmap_cache() {
    let r2 = RootService::new(engine("bitmap"));
    let root = r2.mkfs(0).unwrap();

    let slice = r2.bitmap_flip(root.gdt_uuid, 900).unwrap();
    assert!(mdsl::bitmap::bit_is_set(&slice, 0, 900));

    // A reader using the bitmap cache against the same backing store sees
    // the same bit set (models MDS2's R2.BITMAP reply observation).
    let bc = BitmapCache::new();
    let from_cache = bc.bc_get(r2.storage(), root.gdt_uuid, 0).unwrap();
    assert!(from_cache.bit_is_set(900, 0));
}

/// 6. Heartbeat state machine: missed heartbeats degrade a site to ERROR;
/// a fresh heartbeat restores NORMAL.
#[test]
fn heartbeat_state_machine_recovers_after_resuming() {
    let r2 = RootService::new(engine("hb"));
    let (site_id, _) = r2.reg(None, 0, Role::Mds, "a".into()).unwrap();

    for _ in 0..HB_LOST_THRESHOLD {
        r2.sweep_heartbeats(std::time::Duration::from_secs(0));
    }
    assert_eq!(r2.site_state(site_id), Some(SiteState::Error));

    r2.heartbeat(site_id);
    assert_eq!(r2.site_state(site_id), Some(SiteState::Normal));
}
