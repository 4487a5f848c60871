//! Buffer pool benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rstomp_buffer::{BufferPool, BufferSegment, PoolConfig};
use std::sync::Arc;

fn bench_checkout_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_checkout_release");
    group.throughput(Throughput::Elements(1));

    for size in [4 * 1024, 64 * 1024] {
        let pool = BufferPool::new(PoolConfig::new(size).with_preallocated(64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &pool, |b, pool| {
            b.iter(|| {
                let segment = pool.checkout().unwrap();
                pool.release(black_box(segment)).unwrap();
            });
        });
    }

    group.finish();
}

/// Many live connections each holding a read and a write segment.
fn bench_checkout_many(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_checkout_many");

    for count in [100, 1000] {
        let pool = BufferPool::new(PoolConfig::new(4 * 1024).with_preallocated(count * 2));

        group.throughput(Throughput::Elements(count as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let segments: Vec<_> = (0..count * 2).map(|_| pool.checkout().unwrap()).collect();
                for segment in segments {
                    pool.release(segment).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_concurrent_checkout(c: &mut Criterion) {
    let pool = Arc::new(BufferPool::new(
        PoolConfig::new(4 * 1024).with_preallocated(256),
    ));

    c.bench_function("pool_checkout_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = pool.clone();
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            let segment = pool.checkout().unwrap();
                            pool.release(segment).unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

fn bench_segment_write_compact(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_write_compact");

    for chunk in [64, 1024] {
        let data = vec![0x42u8; chunk];

        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &data, |b, data| {
            let mut segment = BufferSegment::standalone(16 * 1024);
            b.iter(|| {
                segment.write(data);
                segment.advance(data.len() / 2).unwrap();
                if segment.writable_bytes() < data.len() {
                    segment.compact();
                }
                if segment.writable_bytes() < data.len() {
                    segment.reset();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_checkout_release,
    bench_checkout_many,
    bench_concurrent_checkout,
    bench_segment_write_compact,
);

criterion_main!(benches);
