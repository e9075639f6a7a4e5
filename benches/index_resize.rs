//! Microbenchmarks for online index resize.
//!
//! Measures a full split of a populated table, alone and with rayon workers
//! hammering the index while the split runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, SamplingMode,
    Throughput,
};
use rayon::prelude::*;

use tagindex::index::{KeyHash, MemHashIndex, MemHashIndexConfig};
use tagindex::Address;

const ADDRESS_BASE: u64 = 1 << 20;

fn key_hash(id: u64) -> KeyHash {
    let tag = id % ((1 << KeyHash::TAG_BITS) - 1) + 1;
    let low = id.wrapping_mul(0x9E37_79B9_7F4A_7C15) & ((1 << KeyHash::TAG_SHIFT) - 1);
    KeyHash::new((tag << KeyHash::TAG_SHIFT) | low)
}

fn rehash(address: Address) -> Option<KeyHash> {
    address.control().checked_sub(ADDRESS_BASE).map(key_hash)
}

fn populated_index(size: u64, keys: u64) -> MemHashIndex {
    let config = MemHashIndexConfig::new(size).with_resize_chunk_size(64);
    let index = MemHashIndex::with_config(&config).unwrap();
    for id in 0..keys {
        let r = index.find_or_create_entry(key_hash(id), Address::NULL).unwrap();
        let location = r.location.unwrap();
        index
            .update_slot(location, r.entry, r.entry.with_address(Address::from(ADDRESS_BASE + id)))
            .unwrap();
    }
    index
}

fn bench_resize(c: &mut Criterion) {
    let mut group = c.benchmark_group("index/resize");
    group.sampling_mode(SamplingMode::Flat);
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(20);

    for size in [1u64 << 10, 1 << 14] {
        let keys = size * 4;
        group.throughput(Throughput::Elements(keys));
        group.bench_function(BenchmarkId::new("double", size), |b| {
            b.iter_batched(
                || populated_index(size, keys),
                |index| {
                    let result = index.trigger_resize(size * 2, rehash).unwrap();
                    black_box(result);
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_resize_under_load(c: &mut Criterion) {
    const SIZE: u64 = 1 << 12;
    const KEYS: u64 = SIZE * 4;
    const WORKERS: usize = 4;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(WORKERS + 1)
        .build()
        .unwrap();

    let mut group = c.benchmark_group("index/resize_under_load");
    group.sampling_mode(SamplingMode::Flat);
    group.measurement_time(Duration::from_secs(8));
    group.sample_size(10);
    group.throughput(Throughput::Elements(KEYS));

    group.bench_function(BenchmarkId::new("workers", WORKERS), |b| {
        b.iter_batched(
            || Arc::new(populated_index(SIZE, KEYS)),
            |index| {
                let done = AtomicBool::new(false);
                pool.install(|| {
                    rayon::join(
                        || {
                            index.trigger_resize(SIZE * 2, rehash).unwrap();
                            done.store(true, Ordering::Release);
                        },
                        || {
                            (0..WORKERS).into_par_iter().for_each(|w| {
                                let mut id = w as u64;
                                while !done.load(Ordering::Acquire) {
                                    black_box(index.find_entry(key_hash(id % KEYS)));
                                    id += WORKERS as u64;
                                }
                            });
                        },
                    );
                });
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_resize, bench_resize_under_load);
criterion_main!(benches);
