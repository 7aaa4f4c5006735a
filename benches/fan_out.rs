//! Fan-out benchmark using criterion.
//!
//! A root task launches N children and waits on their fence, compared against one
//! OS thread per child.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fibersched::{Fence, FiberSystem, task};
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn bench_fan_out(c: &mut Criterion) {
    let system = FiberSystem::new(num_cpus::get()).unwrap();

    let mut group = c.benchmark_group("fan_out");
    group.sample_size(10);

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_function(BenchmarkId::new("fibers", count), |b| {
            b.iter(|| {
                let total = Arc::new(AtomicUsize::new(0));
                let done = Fence::new(1);
                let total_clone = total.clone();
                system
                    .spawn(
                        move || {
                            let children = Fence::new(count);
                            for i in 0..count {
                                let total = total_clone.clone();
                                task::spawn(
                                    move || {
                                        total.fetch_add(black_box(i), Ordering::Relaxed);
                                    },
                                    Some(children.clone()),
                                )
                                .unwrap();
                            }
                            children.wait_for_signal();
                        },
                        Some(done.clone()),
                    )
                    .unwrap();
                done.wait_for_signal();
                black_box(total.load(Ordering::Relaxed));
            })
        });

        if count <= 1_000 {
            group.bench_function(BenchmarkId::new("threads", count), |b| {
                b.iter(|| {
                    let total = Arc::new(AtomicUsize::new(0));
                    let handles: Vec<_> = (0..count)
                        .map(|i| {
                            let total = total.clone();
                            std::thread::spawn(move || {
                                total.fetch_add(black_box(i), Ordering::Relaxed);
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    black_box(total.load(Ordering::Relaxed));
                })
            });
        }
    }

    group.finish();
    system.shutdown().unwrap();
}

fn bench_yield(c: &mut Criterion) {
    let system = FiberSystem::new(1).unwrap();

    c.bench_function("yield_round_trip_x1000", |b| {
        b.iter(|| {
            let done = Fence::new(2);
            for _ in 0..2 {
                system
                    .spawn(
                        || {
                            for _ in 0..500 {
                                task::yield_now();
                            }
                        },
                        Some(done.clone()),
                    )
                    .unwrap();
            }
            done.wait_for_signal();
        })
    });

    system.shutdown().unwrap();
}

criterion_group!(benches, bench_fan_out, bench_yield);
criterion_main!(benches);
