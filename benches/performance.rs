//! Performance benchmarks for the tree engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use treesync::notification::build;
use treesync::{Path, SetRequest, Target, Timestamp, TreeStore, TypedValue, Update};

fn populated_store(interfaces: usize) -> TreeStore {
    let store = TreeStore::default();
    for i in 0..interfaces {
        store
            .write(
                &Path::parse(&format!("/interfaces/eth{}", i)),
                TypedValue::json(json!({
                    "config": {"mtu": 1500, "enabled": true},
                    "state": {"counters": {"in": i, "out": i * 2}},
                })),
                Timestamp(1),
            )
            .unwrap();
    }
    store
}

/// Benchmark leaf writes into stores of varying size
fn bench_leaf_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("leaf_write");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("interfaces", size), &size, |b, &size| {
            let store = populated_store(size);
            let path = Path::parse("/interfaces/eth0/config/mtu");
            let mut ts = 2;
            b.iter(|| {
                ts += 1;
                store
                    .write(&path, TypedValue::json(9000), Timestamp(ts))
                    .unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark subtree reads (JSON encoding of a directory)
fn bench_subtree_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("subtree_read");

    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("interfaces", size), &size, |b, &size| {
            let store = populated_store(size);
            let paths = [Path::parse("/interfaces")];
            b.iter(|| black_box(store.read(&Path::root(), &paths).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark transaction apply with a growing number of updates
fn bench_transaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction");

    for updates in [1, 10, 100] {
        group.bench_with_input(BenchmarkId::new("updates", updates), &updates, |b, &updates| {
            let target = Target::default();
            b.iter(|| {
                let mut request = SetRequest::new()
                    .with_prefix("/config")
                    .delete("/old");
                for i in 0..updates {
                    request = request.update(Update::new(
                        format!("/leaf{}", i).as_str(),
                        TypedValue::json(i),
                    ));
                }
                black_box(target.set(request))
            });
        });
    }

    group.finish();
}

/// Benchmark notification building (prefix computation and dedup)
fn bench_notification_build(c: &mut Criterion) {
    let updates: Vec<Update> = (0..200)
        .map(|i| {
            Update::new(
                format!("/interfaces/eth{}/state/counters/in", i % 50).as_str(),
                TypedValue::json(i),
            )
        })
        .collect();

    c.bench_function("notification_build_200", |b| {
        b.iter(|| black_box(build(Timestamp(1), None, updates.clone(), Vec::new())))
    });
}

criterion_group!(
    benches,
    bench_leaf_write,
    bench_subtree_read,
    bench_transaction,
    bench_notification_build
);
criterion_main!(benches);
