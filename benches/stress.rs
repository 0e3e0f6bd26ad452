use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::hint::black_box;

use fraglab::{Allocator, BuddyHeap, TlsfHeap};

const ARENA_SIZE: usize = 1 << 20;
const CHURN_OPS: usize = 1000;

/// One allocate/free pair at a fixed size.
fn alloc_free_pair(heap: &mut impl Allocator, size: usize) {
    let offset = heap.alloc(size).unwrap();
    black_box(offset);
    heap.dealloc(offset).unwrap();
}

fn bench_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("buddy", size), &size, |b, &size| {
            let mut heap = BuddyHeap::new(ARENA_SIZE);
            b.iter(|| alloc_free_pair(&mut heap, size));
        });

        group.bench_with_input(BenchmarkId::new("tlsf", size), &size, |b, &size| {
            let mut heap = TlsfHeap::new(ARENA_SIZE);
            b.iter(|| alloc_free_pair(&mut heap, size));
        });
    }

    group.finish();
}

/// Steady-state churn: free one random live block, allocate a random size.
fn churn(heap: &mut impl Allocator, rng: &mut StdRng, live: &mut Vec<usize>) {
    for _ in 0..CHURN_OPS {
        if !live.is_empty() {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            heap.dealloc(victim).unwrap();
        }
        let req = rng.gen_range(1..=1024);
        if let Ok(offset) = heap.alloc(req) {
            live.push(offset);
        }
    }
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");
    group.throughput(Throughput::Elements(CHURN_OPS as u64));

    group.bench_function("buddy", |b| {
        let mut heap = BuddyHeap::new(ARENA_SIZE);
        let mut rng = StdRng::seed_from_u64(1);
        let mut live = Vec::new();
        b.iter(|| churn(&mut heap, &mut rng, &mut live));
    });

    group.bench_function("tlsf", |b| {
        let mut heap = TlsfHeap::new(ARENA_SIZE);
        let mut rng = StdRng::seed_from_u64(1);
        let mut live = Vec::new();
        b.iter(|| churn(&mut heap, &mut rng, &mut live));
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_churn);
criterion_main!(benches);
