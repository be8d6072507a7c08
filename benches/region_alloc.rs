use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use regiongc::allocator::MemoryAllocator;
use regiongc::config::GcConfig;
use regiongc::phase::{MarkColor, MarkState};

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("region allocate");
    group.sample_size(30);

    for object_size in [16usize, 64, 512, 4096] {
        group.bench_function(BenchmarkId::new("bump", object_size), |b| {
            b.iter_batched(
                || MemoryAllocator::new(GcConfig::default()),
                |alloc| {
                    for _ in 0..4096 {
                        alloc.allocate(object_size, false, MarkColor::M0).unwrap();
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("region sweep");
    group.sample_size(20);

    group.bench_function("sweep half-live", |b| {
        b.iter_batched(
            || {
                let alloc = MemoryAllocator::new(GcConfig::default());
                for i in 0..4096 {
                    let color = if i % 2 == 0 { MarkColor::M0 } else { MarkColor::M1 };
                    alloc.allocate(64, true, color).unwrap();
                }
                alloc
            },
            |alloc| {
                alloc.sweep(|state| state != MarkState::M0);
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_allocate, bench_sweep);
criterion_main!(benches);
