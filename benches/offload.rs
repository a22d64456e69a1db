//! Offload overhead on host reference devices.
//!
//! Compares the same element-wise function run sequentially, on host
//! threads and through the device path (copy in, launch, copy out), plus
//! a two-stage pipeline over the same input.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use hetarray::device::{HostInvocation, HostKernels};
use hetarray::{ArrayFunction, Captures, Map, MapAccelerator, MapThreads, Pipeline, RuntimeContext, RuntimeOptions, TypedArray};

const SIZES: [usize; 3] = [1 << 10, 1 << 14, 1 << 18];

fn poly(x: f32) -> f32 {
    ((x * 0.5 + 1.0) * x - 3.0) * x
}

fn poly_kernels() -> HostKernels {
    let kernels = HostKernels::new();
    kernels.register("poly", |inv: &mut HostInvocation<'_>| {
        let x: Vec<f32> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        for i in 0..n as usize {
            inv.store(2, i, poly(x[i]))?;
        }
        Ok(())
    });
    kernels
}

fn bench_map(c: &mut Criterion) {
    let ctx = Arc::new(RuntimeContext::host(2, poly_kernels(), RuntimeOptions::default()));
    let mut group = c.benchmark_group("map");
    for size in SIZES {
        let input = TypedArray::from_fn(size, |i| i as f32);

        let mut sequential = Map::new(poly);
        group.bench_with_input(BenchmarkId::new("sequential", size), &input, |b, input| {
            b.iter(|| sequential.apply(black_box(input)))
        });

        let mut threads = MapThreads::with_available_parallelism(poly);
        group.bench_with_input(BenchmarkId::new("threads", size), &input, |b, input| {
            b.iter(|| threads.apply(black_box(input)))
        });

        let mut device = MapAccelerator::new(Arc::clone(&ctx), "poly", Captures::new(), poly);
        group.bench_with_input(BenchmarkId::new("host_devices", size), &input, |b, input| {
            b.iter(|| device.apply(black_box(input)))
        });
    }
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let input = TypedArray::from_fn(1 << 16, |i| i as f32);
    let mut group = c.benchmark_group("pipeline");
    for chunk in [256usize, 4096] {
        let mut pipeline = Pipeline::new(Map::new(poly))
            .then(MapThreads::new(|x: f32| f64::from(x).sqrt(), 2))
            .with_chunk_size(chunk);
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &input, |b, input| {
            b.iter(|| pipeline.apply(black_box(input)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_map, bench_pipeline);
criterion_main!(benches);
