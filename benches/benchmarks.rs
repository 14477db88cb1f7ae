use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use millwheel_core::dedup::{
    BloomLayer, DedupLayer, DurableLayer, PassthroughLayer, TwoTierDedup,
};
use millwheel_core::store::InMemStore;
use millwheel_core::{Key, RecordId};

fn ids(n: usize) -> Vec<RecordId> {
    (0..n).map(|_| RecordId::random()).collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let key = Key::from("bench");

    let mut group = c.benchmark_group("bloom");
    let bloom = BloomLayer::new(1 << 23, 7);
    let seen = ids(100_000);
    for id in &seen {
        bloom.remember(&key, id);
    }
    let fresh = ids(10_000);
    group.bench_function(BenchmarkId::new("probe", "seen"), |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % seen.len();
            bloom.probe(&key, &seen[i])
        });
    });
    group.bench_function(BenchmarkId::new("probe", "fresh"), |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % fresh.len();
            bloom.probe(&key, &fresh[i])
        });
    });
    group.finish();

    // Fresh records only: with the bloom layer they never reach the
    // store, without it every one of them does.
    let mut group = c.benchmark_group("two_tier_fresh");
    let store = Arc::new(InMemStore::new());
    let fast_layers: [(&str, Arc<dyn DedupLayer>); 2] = [
        ("bloom", Arc::new(BloomLayer::new(1 << 23, 7))),
        ("passthrough", Arc::new(PassthroughLayer)),
    ];
    for (name, fast) in fast_layers {
        let dedup = TwoTierDedup::new(fast, Arc::new(DurableLayer::new(store.clone())));
        group.bench_function(BenchmarkId::new("check_and_mark", name), |b| {
            b.iter(|| dedup.check_and_mark(&key, &RecordId::random()));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
