use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn cache_contention_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("page cache read contention");
    group.sample_size(10);
    group.bench_function("8 readers", |b| {
        b.iter(|| cache_read_benchmark_call(black_box(8)));
    });
    group.bench_function("16 readers", |b| {
        b.iter(|| cache_read_benchmark_call(black_box(16)));
    });
    group.finish();

    let mut group = c.benchmark_group("page cache write contention");
    group.sample_size(10);
    group.bench_function("4 writers", |b| {
        b.iter(|| cache_write_benchmark_call(black_box(4)));
    });
    group.bench_function("8 writers", |b| {
        b.iter(|| cache_write_benchmark_call(black_box(8)));
    });
    group.finish();
}

extern crate cachette;
use cachette::cache::{AccessKind, PageCache};
use cachette::config::CacheConfig;
use cachette::serializer::{BlockId, MemSerializer};

use std::sync::Arc;
use std::thread;

const NUM_BLOCKS: usize = 64;
const BLOCK_BYTES: usize = 512;

fn seeded_cache() -> (PageCache, Vec<BlockId>) {
    let serializer = Arc::new(MemSerializer::new(4096));
    let cache = PageCache::new(serializer, CacheConfig::default());
    let conn = cache.connect();

    let blocks: Vec<BlockId> = (0..NUM_BLOCKS)
        .map(|_| cache.page_for_new_block_id())
        .collect();
    let txn = conn.begin_txn();
    for block in &blocks {
        let mut acq = txn.acquire(*block, AccessKind::Write);
        acq.write().unwrap().overwrite(&[0xAB; BLOCK_BYTES]);
    }
    txn.commit().unwrap();

    (cache, blocks)
}

fn cache_read_benchmark_call(num_read_threads: usize) {
    let (cache, blocks) = seeded_cache();

    thread::scope(|s| {
        for _ in 0..num_read_threads {
            s.spawn(|| {
                let conn = cache.connect();
                let txn = conn.begin_txn();
                for block in &blocks {
                    let acq = txn.acquire(*block, AccessKind::Read);
                    let buf = acq.read().unwrap();
                    black_box(buf[0]);
                }
            });
        }
    });
}

fn cache_write_benchmark_call(num_write_threads: usize) {
    let (cache, blocks) = seeded_cache();

    thread::scope(|s| {
        for i in 0..num_write_threads {
            let blocks = &blocks;
            let cache = &cache;
            s.spawn(move || {
                let conn = cache.connect();
                let txn = conn.begin_txn();
                // disjoint slices so writers only contend on the cache,
                // not on individual blocks
                let per_thread = NUM_BLOCKS / num_write_threads;
                for block in &blocks[i * per_thread..(i + 1) * per_thread] {
                    let mut acq = txn.acquire(*block, AccessKind::Write);
                    acq.write().unwrap().overwrite(&[i as u8; BLOCK_BYTES]);
                }
                txn.commit().unwrap();
            });
        }
    });
}

criterion_group!(benches, cache_contention_benchmark);
criterion_main!(benches);
