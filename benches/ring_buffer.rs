//! Criterion benchmarks for the sample ring buffer.
//!
//! The buffer sits on the hot path of every value callback, so push cost
//! with and without overwrites and the drain done by each write cycle are
//! what matter.
//!
//! Run with: cargo bench --bench ring_buffer

use archive_engine::data::ring_buffer::RingBuffer;
use archive_engine::time::from_secs_f64;
use archive_engine::{Sample, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn samples(n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(from_secs_f64(i as f64), Value::double(i as f64)))
        .collect()
}

/// Push into a buffer that never fills up.
fn ring_buffer_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_push");
    for capacity in [16usize, 256, 4096] {
        let input = samples(capacity);
        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::new("fill", capacity), &input, |b, input| {
            b.iter(|| {
                let mut rb = RingBuffer::with_capacity(capacity);
                for sample in input {
                    rb.push(sample.clone());
                }
                black_box(rb.count())
            });
        });
    }
    group.finish();
}

/// Push four times the capacity so most pushes overwrite.
fn ring_buffer_overwrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_overwrite");
    for capacity in [16usize, 256] {
        let input = samples(capacity * 4);
        group.throughput(Throughput::Elements(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("wrap", capacity), &input, |b, input| {
            b.iter(|| {
                let mut rb = RingBuffer::with_capacity(capacity);
                for sample in input {
                    rb.push(sample.clone());
                }
                black_box(rb.overwrites())
            });
        });
    }
    group.finish();
}

/// Fill then pop everything, as one channel's write cycle does.
fn ring_buffer_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_drain");
    for capacity in [256usize, 4096] {
        let input = samples(capacity);
        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::new("pop_all", capacity), &input, |b, input| {
            b.iter(|| {
                let mut rb = RingBuffer::with_capacity(capacity);
                for sample in input {
                    rb.push(sample.clone());
                }
                let mut n = 0;
                while let Some(sample) = rb.pop() {
                    black_box(&sample);
                    n += 1;
                }
                n
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    ring_buffer_push,
    ring_buffer_overwrite,
    ring_buffer_drain
);
criterion_main!(benches);
