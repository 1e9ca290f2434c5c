use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nbassoc::{AssocIndex, Config, Item};

fn bench_ops(c: &mut Criterion) {
    let config = Config::builder().hashpower(10).num_threads(1).build();
    let index = AssocIndex::new(
        config,
        Box::new(|item| unsafe { drop(Box::from_raw(item.as_ptr())) }),
    );
    let mut local = index.local(0);
    local.announce();

    let keys: Vec<Vec<u8>> = (0..1024).map(|k| format!("bench-key-{}", k).into_bytes()).collect();
    let hashes: Vec<u32> = keys.iter().map(|key| index.hash(key)).collect();
    for (key, &hv) in keys.iter().zip(&hashes) {
        local.insert(Item::new(key, b"value"), hv).unwrap();
    }

    let mut cursor = 0usize;
    c.bench_function("find_hit", |b| {
        b.iter(|| {
            cursor = (cursor + 1) & 1023;
            black_box(local.find(&keys[cursor], hashes[cursor]))
        })
    });

    c.bench_function("find_miss", |b| {
        let hv = index.hash(b"absent");
        b.iter(|| black_box(local.find(b"absent", hv)))
    });

    c.bench_function("insert_delete", |b| {
        let hv = index.hash(b"churn");
        b.iter(|| {
            local.insert(Item::new(b"churn", b"value"), hv).unwrap();
            assert!(local.delete(b"churn", hv));
        })
    });

    local.enter_quiescent();
}

criterion_group!(benches, bench_ops);
criterion_main!(benches);
