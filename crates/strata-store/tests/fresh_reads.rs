//! Causal freshness of reads across contexts on different slabs.

use std::time::Duration;

use strata_store::mesh::{LatencyModel, RegistrationOrder};
use strata_store::{
    payload, CausalRef, Error, Mesh, MeshConfig, ReadPolicy, Record, Slab, SlabConfig, SlabId,
    Value,
};
use tokio_test::{assert_ready, task};

fn slabs(mesh: &Mesh, names: &[&str]) -> Vec<Slab> {
    names
        .iter()
        .map(|name| Slab::new(mesh, SlabConfig::new(SlabId::new(*name).unwrap())).unwrap())
        .collect()
}

#[test]
fn immediate_policy_reports_stale_reads_as_absent() {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let s = slabs(&mesh, &["A", "B", "C"]);

    let on_a = Record::create(&s[0].create_context(), payload([("animal_sound", "moo")])).unwrap();
    mesh.deliver_all_queued_messages();

    let c_ctx = s[2].create_context();
    let on_c = c_ctx.get_record(on_a.id()).unwrap();
    on_c.set(payload([("animal_sound", "woof")])).unwrap();

    // A reader on B that has already seen C's write.
    let b_ctx = s[1].create_context();
    b_ctx.add_raw_context(c_ctx.export());
    let on_b = b_ctx.get_record(on_a.id()).unwrap();
    assert!(!on_b.is_fresh());

    let mut read = task::spawn(on_b.get_fresh_or_null("animal_sound"));
    assert_eq!(assert_ready!(read.poll()).unwrap(), None);
    // A plain read does not care.
    assert_eq!(on_b.get("animal_sound"), Some(Value::from("moo")));

    mesh.deliver_all_queued_messages();
    assert!(on_b.is_fresh());
    let mut read = task::spawn(on_b.get_fresh_or_null("animal_sound"));
    assert_eq!(assert_ready!(read.poll()).unwrap(), Some(Value::from("woof")));
}

#[test]
fn reading_advances_the_frontier() {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let s = slabs(&mesh, &["A", "B", "C"]);

    let ctx = s[0].create_context();
    let record = Record::create(&ctx, payload([("n", 1i64)])).unwrap();
    let first = ctx.frontier();
    let second = record.set(payload([("n", 2i64)])).unwrap();

    assert_eq!(ctx.frontier().into_iter().collect::<Vec<_>>(), vec![second.clone()]);
    assert!(!ctx.frontier().is_superset(&first));

    let other = s[0].create_context();
    let seen = other.get_record(record.id()).unwrap();
    assert!(other.frontier().is_empty());
    assert_eq!(seen.get("n").and_then(|v| v.as_i64()), Some(2));
    assert!(other.frontier().contains(&second));
}

#[tokio::test(start_paused = true)]
async fn blocking_policy_waits_for_arrival() {
    let config = MeshConfig::default().with_latency(LatencyModel::Fixed(Duration::from_millis(50)));
    let mesh = Mesh::new(config).unwrap();
    mesh.set_selection_strategy(RegistrationOrder);
    let s = slabs(&mesh, &["A", "B", "C"]);

    let a_ctx = s[0].create_context();
    let on_a = Record::create(&a_ctx, payload([("animal_sound", "moo")])).unwrap();
    assert!(mesh.wait_idle(Duration::from_secs(5)).await);

    let b_ctx = s[1]
        .create_context()
        .with_read_policy(ReadPolicy::Blocking {
            timeout: Duration::from_secs(1),
        });
    let on_b = b_ctx.get_record(on_a.id()).unwrap();

    on_a.set(payload([("animal_sound", "woof")])).unwrap();
    b_ctx.add_raw_context(a_ctx.export());
    assert!(!on_b.is_fresh());

    let started = tokio::time::Instant::now();
    let value = on_b.get_fresh_or_null("animal_sound").await.unwrap();
    assert_eq!(value, Some(Value::from("woof")));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn blocking_policy_gives_up_after_timeout() {
    let mesh = Mesh::new(MeshConfig::disconnected()).unwrap();
    let s = slabs(&mesh, &["A"]);
    let ctx = s[0]
        .create_context()
        .with_read_policy(ReadPolicy::Blocking {
            timeout: Duration::from_millis(200),
        });
    let record = Record::create(&ctx, payload([("k", "v")])).unwrap();

    ctx.add_raw_context([CausalRef {
        record_id: record.id().clone(),
        memo_id: "Z-9".parse().unwrap(),
    }]);

    let err = record.get_fresh_or_null("k").await.unwrap_err();
    assert!(matches!(err, Error::Stale { .. }));
    assert!(err.is_soft());
}
