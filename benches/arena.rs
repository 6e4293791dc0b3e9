#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use talus::{Arena, RECORD_OVERHEAD};

const WRITE_BATCH: usize = 512;
const SIZES: [usize; 2] = [50, 5000];

fn payloads(rng: &mut ChaCha8Rng, size: usize, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|_| (0..size).map(|_| rng.gen()).collect())
        .collect()
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena/write");
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for size in SIZES {
        let record = size + RECORD_OVERHEAD as usize;
        let data = payloads(&mut rng, size, WRITE_BATCH);
        group.throughput(Throughput::Bytes((size * WRITE_BATCH) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter_batched(
                || Arena::new(vec![0u8; record * WRITE_BATCH]).expect("arena"),
                |arena| {
                    for payload in &data {
                        black_box(arena.write(payload).expect("write"));
                    }
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_write_with_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena/churn");
    let mut rng = ChaCha8Rng::seed_from_u64(8);
    let size = 64usize;
    let data = payloads(&mut rng, size, WRITE_BATCH);
    group.throughput(Throughput::Elements(WRITE_BATCH as u64));
    group.bench_function("write_free_interleaved", |b| {
        b.iter_batched(
            || Arena::new(vec![0u8; (size + RECORD_OVERHEAD as usize) * WRITE_BATCH]).expect("arena"),
            |arena| {
                let mut recent = Vec::new();
                for payload in &data {
                    let key = arena.write(payload).expect("write");
                    recent.push(key);
                    if recent.len() == 10 {
                        arena.free(recent.remove(3)).expect("free");
                        arena.free(recent.remove(5)).expect("free");
                    }
                }
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_compaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena/compact");
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let size = 84usize;
    let record = size + RECORD_OVERHEAD as usize;
    let slots = 1600usize;
    let small = payloads(&mut rng, size, slots);
    let large = payloads(&mut rng, 2 * record - RECORD_OVERHEAD as usize, slots / 20);
    group.sample_size(20);
    group.bench_function("refill_drilled_holes", |b| {
        b.iter_batched(
            || {
                // fill the arena, then drill a hole every tenth record
                let arena = Arena::new(vec![0u8; record * slots]).expect("arena");
                let mut holes = Vec::new();
                for (i, payload) in small.iter().enumerate() {
                    let key = arena.write(payload).expect("fill");
                    if i % 10 == 0 {
                        holes.push(key);
                    }
                }
                for key in holes {
                    arena.free(key).expect("free");
                }
                arena
            },
            |arena| {
                // every double-width write must fuse a pair of holes
                for payload in &large {
                    black_box(arena.write(payload).expect("compacting write"));
                }
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_write_with_free, bench_compaction);
criterion_main!(benches);
