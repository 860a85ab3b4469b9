//! Lock path benchmarks
//!
//! Measures uncontended enter/exit on each lock path.
//!
//! Run with: `cargo bench -p otter-vm-sync lock_paths`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use otter_vm_sync::{InflateCause, SyncConfig, SyncRuntime};
use std::hint::black_box;

/// Biased re-entry: no atomic read-modify-write after the first claim
fn biased_hit_benchmark(c: &mut Criterion) {
    let rt = SyncRuntime::new(SyncConfig::default());
    let t = rt.attach_thread("bench");
    let obj = rt.new_object("Point");
    let sync = rt.synchronizer();

    c.bench_function("biased_enter_exit", |b| {
        b.iter(|| {
            sync.enter(&t, black_box(&obj));
            sync.exit(&t, &obj).unwrap();
        })
    });
}

/// Lightweight lock records, optionally nested
fn lightweight_benchmark(c: &mut Criterion) {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let t = rt.attach_thread("bench");
    let obj = rt.new_object("Point");
    let sync = rt.synchronizer();

    let mut group = c.benchmark_group("lightweight_enter_exit");
    for depth in [1usize, 4, 16].iter() {
        group.bench_with_input(BenchmarkId::new("depth", depth), depth, |b, &depth| {
            b.iter(|| {
                for _ in 0..depth {
                    sync.enter(&t, black_box(&obj));
                }
                for _ in 0..depth {
                    sync.exit(&t, &obj).unwrap();
                }
            })
        });
    }
    group.finish();
}

/// Already inflated monitor, uncontended
fn inflated_benchmark(c: &mut Criterion) {
    let rt = SyncRuntime::new(SyncConfig::without_biased_locking());
    let t = rt.attach_thread("bench");
    let obj = rt.new_object("Point");
    let sync = rt.synchronizer();
    sync.inflate(&t, &obj, InflateCause::VmInternal);

    c.bench_function("inflated_enter_exit", |b| {
        b.iter(|| {
            sync.enter(&t, black_box(&obj));
            sync.exit(&t, &obj).unwrap();
        })
    });
}

/// Identity hash on an unlocked object after the first installation
fn identity_hash_benchmark(c: &mut Criterion) {
    let rt = SyncRuntime::new(SyncConfig::default());
    let t = rt.attach_thread("bench");
    let obj = rt.new_object("Point");
    let sync = rt.synchronizer();
    sync.identity_hash_value_for(&t, &obj);

    c.bench_function("identity_hash", |b| {
        b.iter(|| black_box(sync.identity_hash_value_for(&t, &obj)))
    });
}

criterion_group!(
    benches,
    biased_hit_benchmark,
    lightweight_benchmark,
    inflated_benchmark,
    identity_hash_benchmark,
);

criterion_main!(benches);
