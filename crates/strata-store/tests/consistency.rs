//! Cross-slab propagation over a disconnected mesh, flushed by hand.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;
use strata_store::{
    payload, Memo, MemoId, Mesh, MeshConfig, Record, RecordId, Slab, SlabConfig, SlabId, Value,
};

fn cluster(names: &[&str]) -> (Mesh, Vec<Slab>) {
    cluster_with(names, |config| config)
}

fn cluster_with(names: &[&str], tune: impl Fn(SlabConfig) -> SlabConfig) -> (Mesh, Vec<Slab>) {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let slabs = names
        .iter()
        .map(|name| tune(SlabConfig::new(SlabId::new(*name).unwrap())))
        .map(|config| Slab::new(&mesh, config).unwrap())
        .collect();
    (mesh, slabs)
}

fn settle(mesh: &Mesh) {
    for _ in 0..64 {
        if mesh.deliver_all_queued_messages() == 0 {
            return;
        }
    }
    panic!("mesh did not go quiet");
}

fn sound(slab: &Slab, record: &Record) -> Option<Value> {
    slab.get_record(record.id())?.get("animal_sound")
}

#[test]
fn writes_reach_every_slab_eventually() {
    let (mesh, slabs) = cluster(&["A", "B", "C"]);
    let (a, b, c) = (&slabs[0], &slabs[1], &slabs[2]);

    let ctx = a.create_context();
    let cow = Record::create(&ctx, payload([("animal_sound", "moo")])).unwrap();
    assert!(b.get_record(cow.id()).is_none());
    assert_eq!(cow.get("animal_sound"), Some(Value::from("moo")));

    mesh.deliver_all_queued_messages();
    assert_eq!(sound(b, &cow), Some(Value::from("moo")));

    mesh.deliver_all_queued_messages();
    assert_eq!(sound(c, &cow), Some(Value::from("moo")));

    let on_c = c.get_record(cow.id()).unwrap();
    on_c.set(payload([("animal_sound", "woof")])).unwrap();
    assert_eq!(on_c.get("animal_sound"), Some(Value::from("woof")));
    assert_eq!(cow.get("animal_sound"), Some(Value::from("moo")));

    mesh.deliver_all_queued_messages();
    assert_eq!(cow.get("animal_sound"), Some(Value::from("woof")));
    assert_eq!(sound(b, &cow), Some(Value::from("woof")));
}

#[test]
fn concurrent_sets_resolve_to_lowest_memo_id() {
    let (mesh, slabs) = cluster(&["A", "B", "C"]);
    let (a, b) = (&slabs[0], &slabs[1]);

    let ctx = a.create_context();
    let cow = Record::create(&ctx, payload([("animal_sound", "moo"), ("legs", "4")])).unwrap();
    mesh.deliver_all_queued_messages();
    let on_b = b.get_record(cow.id()).unwrap();

    // Neither side has seen the other's write.
    let from_a = cow.set(payload([("animal_sound", "neigh")])).unwrap();
    let from_b = on_b.set(payload([("animal_sound", "baa")])).unwrap();
    assert!(from_a < from_b);

    for _ in 0..3 {
        mesh.deliver_all_queued_messages();
    }

    for record in [&cow, &on_b] {
        let heads = record.head_memo_ids();
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(&from_a) && heads.contains(&from_b));
        assert_eq!(record.get("animal_sound"), Some(Value::from("neigh")));
        assert_eq!(record.get("legs"), Some(Value::from("4")));
    }

    // A later set on either side merges the heads.
    let merged = on_b.set(payload([("animal_sound", "moo")])).unwrap();
    assert_eq!(on_b.head_memo_ids().into_iter().collect::<Vec<_>>(), vec![merged]);
}

#[test]
fn memo_ids_are_unique_across_slabs() {
    let (mesh, slabs) = cluster(&["A", "B", "C"]);
    let mut seen = std::collections::BTreeSet::new();

    for (n, slab) in slabs.iter().enumerate() {
        let record = Record::create(&slab.create_context(), payload([("n", n as i64)])).unwrap();
        for i in 0..3 {
            seen.insert(record.set(payload([("i", i as i64)])).unwrap());
        }
        seen.extend(record.memo_ids());
    }
    mesh.deliver_all_queued_messages();

    // Three records of four memos each.
    assert_eq!(seen.len(), 12);
}

#[test]
fn references_travel_with_the_memo() {
    let (mesh, slabs) = cluster(&["A", "B", "C"]);
    let (a, b) = (&slabs[0], &slabs[1]);

    let ctx = a.create_context();
    let farm = Record::create(&ctx, payload([("name", "Old MacDonald's")])).unwrap();
    let cow = Record::create(
        &ctx,
        payload([
            ("animal_sound", Value::from("moo")),
            ("$farm", Value::from(farm.id().clone())),
        ]),
    )
    .unwrap();
    mesh.deliver_all_queued_messages();

    let on_b = b.get_record(cow.id()).unwrap();
    let farm_ref = on_b.get("$farm").unwrap();
    assert!(farm_ref.is_ref());
    assert_eq!(farm_ref.as_entity().map(ToString::to_string), Some(farm.id().to_string()));
}

/// Memos not named as a parent by any other memo in `memos`.
fn heads_of(memos: &BTreeMap<MemoId, Arc<Memo>>) -> BTreeSet<MemoId> {
    let parents: BTreeSet<&MemoId> = memos.values().flat_map(|m| m.parents()).collect();
    memos.keys().filter(|id| !parents.contains(id)).cloned().collect()
}

/// The defining memo closest to the heads wins, lowest id among equals.
/// Parents missing from `memos` are skipped.
fn resolve_by_distance(memos: &BTreeMap<MemoId, Arc<Memo>>, field: &str) -> Option<Value> {
    let mut distance: BTreeMap<MemoId, usize> = BTreeMap::new();
    let mut queue: VecDeque<(MemoId, usize)> =
        heads_of(memos).into_iter().map(|id| (id, 0)).collect();
    while let Some((id, d)) = queue.pop_front() {
        if distance.contains_key(&id) {
            continue;
        }
        let Some(memo) = memos.get(&id) else {
            continue;
        };
        queue.extend(memo.parents().iter().map(|p| (p.clone(), d + 1)));
        distance.insert(id, d);
    }
    distance
        .iter()
        .filter_map(|(id, &d)| memos[id].get(field).map(|v| (d, id, v)))
        .min_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)))
        .map(|(_, _, v)| v.clone())
}

#[derive(Debug, Clone)]
enum Op {
    Write {
        slab: usize,
        record: usize,
        field: usize,
        value: i64,
    },
    Flush,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3, 0usize..2, 0usize..2, 0i64..100).prop_map(|(slab, record, field, value)| {
            Op::Write { slab, record, field, value }
        }),
        1 => Just(Op::Flush),
    ]
}

const FIELDS: [&str; 2] = ["x", "y"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Reads and head sets agree with a resolution over the slab's own memos.
    #[test]
    fn reads_follow_the_head_set(ops in prop::collection::vec(op(), 1..30)) {
        let (mesh, slabs) = cluster_with(&["A", "B", "C"], |c| c.with_quota(20).with_limit(40));
        let mut views: Vec<Vec<Option<Record>>> = vec![vec![None, None]; slabs.len()];
        let mut ids: Vec<Option<RecordId>> = vec![None, None];

        for op in ops {
            let Op::Write { slab, record, field, value } = op else {
                mesh.deliver_all_queued_messages();
                continue;
            };
            let fields = payload([(FIELDS[field], value)]);
            if views[slab][record].is_none() {
                match ids[record].clone() {
                    Some(id) => views[slab][record] = slabs[slab].get_record(&id),
                    None => {
                        let created = Record::create(&slabs[slab].create_context(), fields);
                        let created = created.unwrap();
                        ids[record] = Some(created.id().clone());
                        views[slab][record] = Some(created);
                        continue;
                    }
                }
            }
            if let Some(view) = &views[slab][record] {
                view.set(fields).unwrap();
            }
        }
        settle(&mesh);

        for slab in &slabs {
            for id in ids.iter().flatten() {
                let Some(view) = slab.get_record(id) else {
                    continue;
                };
                let memos: BTreeMap<MemoId, Arc<Memo>> = view
                    .memo_ids()
                    .into_iter()
                    .filter_map(|m| slab.get(&m).map(|memo| (m, memo)))
                    .collect();
                prop_assert_eq!(view.head_memo_ids(), heads_of(&memos));
                for field in FIELDS {
                    prop_assert_eq!(view.get(field), resolve_by_distance(&memos, field));
                }
            }
        }
    }

    /// However writes interleave across slabs, no two ids collide.
    #[test]
    fn minted_ids_never_collide(
        ops in prop::collection::vec((0usize..3, any::<bool>(), any::<bool>()), 1..40)
    ) {
        let (mesh, slabs) = cluster(&["A", "B", "C"]);
        let mut records: Vec<Vec<Record>> = vec![Vec::new(); slabs.len()];
        let mut memo_ids = BTreeSet::new();
        let mut record_ids = BTreeSet::new();

        for (at, create, flush) in ops {
            let fields = payload([("at", at as i64)]);
            let extend = if create { None } else { records[at].last().cloned() };
            match extend {
                Some(record) => {
                    prop_assert!(memo_ids.insert(record.set(fields).unwrap()));
                }
                _ => {
                    let record = Record::create(&slabs[at].create_context(), fields).unwrap();
                    prop_assert!(record_ids.insert(record.id().clone()));
                    for id in record.memo_ids() {
                        prop_assert!(memo_ids.insert(id));
                    }
                    records[at].push(record);
                }
            }
            if flush {
                mesh.deliver_all_queued_messages();
            }
        }
        settle(&mesh);

        // Every slab sees the same ids, never a duplicate.
        for slab in &slabs {
            let held: Vec<MemoId> = slab.dump_memo_ids();
            let distinct: BTreeSet<&MemoId> = held.iter().collect();
            prop_assert_eq!(held.len(), distinct.len());
            prop_assert!(distinct.iter().all(|id| memo_ids.contains(*id)));
        }
    }
}
