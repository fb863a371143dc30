//! Benchmarks for the acquire/release hot path.

use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use esox_connpool::{BoxError, PoolConfiguration, ResourceFactory, ResourcePool};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

struct Noop;

impl ResourceFactory for Noop {
    type Resource = u64;

    fn create(&self) -> Result<u64, BoxError> {
        Ok(7)
    }

    fn validate(&self, _resource: &mut u64, _timeout: Duration) -> bool {
        true
    }
}

fn warm_pool(size: usize) -> ResourcePool<Noop> {
    let pool = ResourcePool::new(
        Noop,
        PoolConfiguration::new()
            .with_pool_name("bench")
            .with_max_pool_size(size)
            .with_min_idle(size),
    )
    .unwrap();
    while pool.idle() < size {
        thread::sleep(Duration::from_millis(1));
    }
    pool
}

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_release");

    {
        let pool = warm_pool(4);
        // Served from the thread-local list after the first iteration
        group.bench_function("uncontended", |b| {
            b.iter(|| {
                let resource = pool.acquire().unwrap();
                black_box(*resource);
            });
        });
        pool.shutdown();
    }

    {
        let pool = warm_pool(4);
        let stop = Arc::new(AtomicBool::new(false));
        let churners: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        if let Ok(resource) = pool.acquire() {
                            black_box(*resource);
                        }
                    }
                })
            })
            .collect();

        group.bench_function("contended_4_threads", |b| {
            b.iter(|| {
                let resource = pool.acquire().unwrap();
                black_box(*resource);
            });
        });

        stop.store(true, Ordering::Relaxed);
        for churner in churners {
            churner.join().unwrap();
        }
        pool.shutdown();
    }

    group.finish();
}
