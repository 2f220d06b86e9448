//! Evicted ancestors are fetched back from the slabs that hold them.

use std::collections::BTreeSet;
use std::time::Duration;

use strata_store::mesh::{LatencyModel, RegistrationOrder};
use strata_store::{
    payload, Context, Error, Memo, MemoId, Mesh, MeshConfig, MeshEvent, ReadPolicy, Record,
    RecordId, Slab, SlabConfig, SlabId, Value,
};
use tokio_test::{assert_ready, task};

fn slab(mesh: &Mesh, name: &str, quota: usize, limit: usize) -> Slab {
    let config = SlabConfig::new(SlabId::new(name).unwrap())
        .with_quota(quota)
        .with_limit(limit);
    Slab::new(mesh, config).unwrap()
}

/// A tight slab A beside three roomy ones, filled in that order.
fn cluster(mesh: &Mesh) -> Vec<Slab> {
    mesh.set_selection_strategy(RegistrationOrder);
    let mut slabs = vec![slab(mesh, "A", 1, 2)];
    slabs.extend(["B", "C", "D"].iter().map(|n| slab(mesh, n, 5, 10)));
    slabs
}

fn settle(mesh: &Mesh) {
    for _ in 0..64 {
        if mesh.deliver_all_queued_messages() == 0 {
            return;
        }
    }
    panic!("mesh did not go quiet");
}

fn blocking(ctx: Context, timeout: Duration) -> Context {
    ctx.with_read_policy(ReadPolicy::Blocking { timeout })
}

/// Write two memos on A, the second only touching `sound`, and return the
/// first memo's id.
fn cow(ctx: &Context) -> (Record, MemoId) {
    let cow = Record::create(ctx, payload([("sound", "moo"), ("legs", "4")])).unwrap();
    let first = cow.head_memo_ids().into_iter().next().unwrap();
    cow.set(payload([("sound", "woof")])).unwrap();
    (cow, first)
}

#[test]
fn evicted_ancestors_are_fetched_back() {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let slabs = cluster(&mesh);
    let a = &slabs[0];
    let (cow, first) = cow(&a.create_context());
    settle(&mesh);

    a.evict_memos();
    settle(&mesh);
    assert!(!a.contains(&first));
    assert!(slabs[1..].iter().all(|s| s.contains(&first)));

    let mut events = mesh.subscribe_events();
    assert_eq!(cow.get("sound"), Some(Value::from("woof")));
    assert_eq!(cow.get("legs"), None);
    let mut read = task::spawn(cow.get_fresh_or_null("legs"));
    assert_eq!(assert_ready!(read.poll()).unwrap(), None);

    // Asked of the holders, never of A itself.
    let asked: BTreeSet<String> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|e| match e {
            MeshEvent::MemoRequested { to, memo_ids, .. } => {
                assert_eq!(memo_ids, vec![first.clone()]);
                Some(to.to_string())
            }
            _ => None,
        })
        .collect();
    assert_eq!(asked, BTreeSet::from(["B", "C", "D"].map(String::from)));

    settle(&mesh);
    assert!(a.contains(&first));
    assert_eq!(cow.get("legs"), Some(Value::from("4")));
    let mut read = task::spawn(cow.get_fresh_or_null("legs"));
    assert_eq!(assert_ready!(read.poll()).unwrap(), Some(Value::from("4")));
}

#[test]
fn a_new_view_sees_the_same_gap() {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let slabs = cluster(&mesh);
    let a = &slabs[0];
    let (cow, first) = cow(&a.create_context());
    let id = cow.id().clone();
    drop(cow);
    settle(&mesh);

    a.evict_memos();
    settle(&mesh);
    assert!(!a.contains(&first));

    let fresh = a.get_record(&id).unwrap();
    assert_eq!(fresh.get("legs"), None);
    settle(&mesh);
    assert_eq!(fresh.get("legs"), Some(Value::from("4")));
}

#[tokio::test(start_paused = true)]
async fn blocking_reads_wait_for_the_fetched_ancestor() {
    let config =
        MeshConfig::default().with_latency(LatencyModel::Fixed(Duration::from_millis(50)));
    let mesh = Mesh::new(config).unwrap();
    let slabs = cluster(&mesh);
    let a = &slabs[0];
    let ctx = blocking(a.create_context(), Duration::from_secs(1));
    let (cow, first) = cow(&ctx);
    assert!(mesh.wait_idle(Duration::from_secs(5)).await);

    a.evict_memos();
    assert!(mesh.wait_idle(Duration::from_secs(5)).await);
    assert!(!a.contains(&first));

    let started = tokio::time::Instant::now();
    let legs = cow.get_fresh_or_null("legs").await.unwrap();
    assert_eq!(legs, Some(Value::from("4")));
    // One hop for the request, one for the reply.
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(a.contains(&first));
}

#[tokio::test(start_paused = true)]
async fn unreachable_ancestors_make_fresh_reads_stale() {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let a = slab(&mesh, "A", 5, 10);
    let record: RecordId = "R.Z-0".parse().unwrap();
    let orphan = Memo::new(
        "Z-2".parse().unwrap(),
        record.clone(),
        BTreeSet::from(["Z-1".parse().unwrap()]),
        payload([("sound", "woof")]),
        3,
    );
    a.put(orphan).unwrap();

    let view = a.get_record(&record).unwrap();
    assert_eq!(view.get("sound"), Some(Value::from("woof")));
    assert_eq!(view.get_fresh_or_null("sound").await.unwrap(), Some(Value::from("woof")));
    assert_eq!(view.get_fresh_or_null("legs").await.unwrap(), None);

    let ctx = blocking(a.create_context(), Duration::from_millis(200));
    let view = ctx.get_record(&record).unwrap();
    let err = view.get_fresh_or_null("legs").await.unwrap_err();
    assert!(matches!(err, Error::Stale { .. }));
}
