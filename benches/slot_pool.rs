//! Slot pool benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rawrec::memory::{ArenaRegion, SlotLayout, SlotPool};

const FRAME_SIZE: usize = 1920 * 1080 * 14 / 8;

fn arenas(count: usize, size: usize) -> Vec<ArenaRegion> {
    (0..count)
        .map(|i| ArenaRegion::new(0x1000_0000 + i * 0x1000_0000, size))
        .collect()
}

fn bench_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_pool_fast_path");

    for arena_mb in [32usize, 128, 512] {
        let pool =
            SlotPool::initialize(&arenas(1, arena_mb << 20), SlotLayout::default(), FRAME_SIZE)
                .unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(arena_mb), &pool, |b, pool| {
            let mut pool = pool.clone();
            let mut previous = None;
            b.iter(|| {
                let index = pool.choose_next_slot(previous).expect("free slot");
                pool.claim(index, 1).unwrap();
                if let Some(prev) = previous {
                    pool.free(prev).unwrap();
                }
                previous = Some(index);
            });
        });
    }

    group.finish();
}

fn bench_new_buffer_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_pool_new_buffer");

    for count in [4usize, 16, 32] {
        let mut pool =
            SlotPool::initialize(&arenas(count, 32 << 20), SlotLayout::default(), FRAME_SIZE)
                .unwrap();
        // fragment: every third slot stays full
        for i in (0..pool.len()).step_by(3) {
            pool.claim(i, i as u32 + 1).unwrap();
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(count), &pool, |b, pool| {
            let mut pool = pool.clone();
            b.iter(|| {
                pool.request_new_buffer();
                std::hint::black_box(pool.choose_next_slot(Some(0)));
            });
        });
    }

    group.finish();
}

fn bench_shrink_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_pool_shrink_free");

    let pool =
        SlotPool::initialize(&arenas(1, 64 << 20), SlotLayout::default(), FRAME_SIZE).unwrap();
    group.throughput(Throughput::Elements(8));
    group.bench_function("8_compressed_frames", |b| {
        b.iter(|| {
            let mut pool = pool.clone();
            let mut previous = None;
            let mut used = Vec::with_capacity(8);
            for frame in 1..=8u32 {
                let index = pool.choose_next_slot(previous).expect("free slot");
                pool.claim(index, frame).unwrap();
                pool.shrink(index, FRAME_SIZE / 2).unwrap();
                used.push(index);
                previous = Some(index);
            }
            for index in used {
                pool.free(index).unwrap();
            }
            std::hint::black_box(pool.free_count());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fast_path, bench_new_buffer_search, bench_shrink_free);
criterion_main!(benches);
