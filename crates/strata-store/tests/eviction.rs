//! Eviction only ever removes memos that are held elsewhere.

use std::collections::BTreeSet;

use strata_store::mesh::RegistrationOrder;
use strata_store::{payload, Memo, MemoId, Mesh, MeshConfig, PeerState, Slab, SlabConfig, SlabId};

fn mesh() -> Mesh {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    mesh.set_selection_strategy(RegistrationOrder);
    mesh
}

fn slab(mesh: &Mesh, name: &str, quota: usize, limit: usize) -> Slab {
    let config = SlabConfig::new(SlabId::new(name).unwrap())
        .with_quota(quota)
        .with_limit(limit);
    Slab::new(mesh, config).unwrap()
}

fn memo(id: &str) -> Memo {
    Memo::new(
        id.parse().unwrap(),
        "R.Z-0".parse().unwrap(),
        BTreeSet::new(),
        payload([("id", id)]),
        3,
    )
}

fn settle(mesh: &Mesh) {
    for _ in 0..16 {
        if mesh.deliver_all_queued_messages() == 0 {
            return;
        }
    }
    panic!("mesh did not go quiet");
}

#[test]
fn eviction_is_blocked_without_replicas() {
    let mesh = mesh();
    let a = slab(&mesh, "A", 2, 3);
    for id in ["Z-1", "Z-2", "Z-3"] {
        a.put(memo(id)).unwrap();
    }
    assert_eq!(a.size(), 3);

    a.evict_memos();
    settle(&mesh);

    assert_eq!(a.size(), 3);
    for id in ["Z-1", "Z-2", "Z-3"] {
        assert!(a.contains(&id.parse().unwrap()), "{id} was evicted");
    }
}

#[test]
fn eviction_waits_for_an_extra_replica() {
    let mesh = mesh();
    let a = slab(&mesh, "A", 1, 10);
    let others: Vec<Slab> = ["B", "C", "D"].iter().map(|n| slab(&mesh, n, 5, 10)).collect();
    let id: MemoId = "Z-1".parse().unwrap();

    a.put(memo("Z-1")).unwrap();
    settle(&mesh);
    assert_eq!(a.known_replicas(&id), 3);
    assert!(others[0].contains(&id) && others[1].contains(&id));
    assert!(!others[2].contains(&id));

    // Three copies meet the target, but one of them is about to go.
    a.put(memo("Z-2")).unwrap();
    a.evict_memos();
    assert!(a.is_evicting(&id));
    assert!(a.contains(&id));

    settle(&mesh);
    assert!(!a.contains(&id));
    assert!(others.iter().all(|s| s.contains(&id)));
    for slab in &others {
        assert_eq!(slab.peer_state(&id, a.id()), PeerState::None);
        assert_eq!(slab.known_replicas(&id), 3);
    }
}

#[test]
fn explicit_eviction_of_a_lone_copy_is_refused() {
    let mesh = mesh();
    let a = slab(&mesh, "A", 5, 10);
    let id: MemoId = "Z-1".parse().unwrap();
    a.put(memo("Z-1")).unwrap();

    a.evict_memo(&id).unwrap();
    settle(&mesh);
    assert!(a.contains(&id));
    assert!(!a.is_evicting(&id));
}

#[test]
fn full_slabs_are_not_chosen_as_targets() {
    let mesh = mesh();
    let a = slab(&mesh, "A", 5, 10);
    let b = slab(&mesh, "B", 1, 1);
    b.put(memo("Y-1")).unwrap();
    assert_eq!(b.limit_remaining(), 0);

    let id: MemoId = "Z-1".parse().unwrap();
    a.put(memo("Z-1")).unwrap();
    settle(&mesh);
    assert!(!b.contains(&id));
    assert_eq!(a.known_replicas(&id), 1);
}
