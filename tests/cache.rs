use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use hetarray::deopt::Strategy;
use hetarray::device::{DeviceApi, HostDevice, HostInvocation, HostKernels};
use hetarray::kernel::{GeneratedKernel, KernelShape, KernelSourceGenerator};
use hetarray::{ArrayFunction, Captures, MapAccelerator, RuntimeContext, RuntimeOptions, TypedArray};

/// Host kernel table that counts how often it is asked for source.
struct CountingGenerator {
    inner: HostKernels,
    calls: AtomicUsize,
}

impl KernelSourceGenerator for CountingGenerator {
    fn generate(&self, shape: &KernelShape<'_>) -> Result<GeneratedKernel, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.generate(shape)
    }
}

fn negate_kernels() -> HostKernels {
    let kernels = HostKernels::new();
    kernels.register("negate", |inv: &mut HostInvocation<'_>| {
        let x: Vec<i64> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        for i in 0..n as usize {
            inv.store(2, i, -x[i])?;
        }
        Ok(())
    });
    kernels
}

fn counting_context(devices: usize) -> (Arc<RuntimeContext>, Arc<CountingGenerator>) {
    let kernels = negate_kernels();
    let generator = Arc::new(CountingGenerator {
        inner: kernels.clone(),
        calls: AtomicUsize::new(0),
    });
    let devs: Vec<Arc<dyn DeviceApi>> = (0..devices)
        .map(|i| Arc::new(HostDevice::new(format!("host:{i}"), kernels.clone())) as Arc<dyn DeviceApi>)
        .collect();
    let ctx = Arc::new(RuntimeContext::new(
        devs,
        Arc::clone(&generator) as Arc<dyn KernelSourceGenerator>,
        RuntimeOptions::default(),
    ));
    (ctx, generator)
}

// ── compile once ──

#[test]
fn test_repeated_applies_compile_once_per_device() {
    let (ctx, generator) = counting_context(2);
    let mut negate = MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x);
    for size in [10usize, 100, 10, 64] {
        let out = negate.apply(&TypedArray::from_fn(size, |i| i as i64)).unwrap();
        assert_eq!(out.get(size - 1), -(size as i64 - 1));
    }
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.kernels().compile_count(), 2);
    assert_eq!(ctx.kernels().len(), 2);
}

#[test]
fn test_handles_with_same_name_share_kernels() {
    let (ctx, _generator) = counting_context(3);
    let input = TypedArray::from_fn(300, |i| i as i64);
    let mut first = MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x);
    let mut second = MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x);
    assert_eq!(first.id(), second.id());
    first.apply(&input).unwrap();
    second.apply(&input).unwrap();
    assert_eq!(ctx.kernels().compile_count(), 3);
}

#[test]
fn test_concurrent_accelerators_compile_once() {
    let (ctx, _generator) = counting_context(2);
    let input = TypedArray::from_fn(512, |i| i as i64);
    let mut handles: Vec<_> = (0..6)
        .map(|_| MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x))
        .collect();
    thread::scope(|s| {
        for handle in handles.iter_mut() {
            let input = &input;
            s.spawn(move || {
                let out = handle.apply(input).unwrap();
                assert_eq!(out.get(511), -511);
            });
        }
    });
    assert_eq!(ctx.kernels().compile_count(), 2);
    drop(handles);
    assert!(ctx.buffers().is_empty());
}

// ── eviction ──

#[test]
fn test_release_function_forces_rebuild() {
    let (ctx, _generator) = counting_context(1);
    let mut negate = MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x);
    let input = TypedArray::from_fn(8, |i| i as i64);
    negate.apply(&input).unwrap();
    ctx.release_function(negate.id());
    assert!(!ctx.kernels().contains(negate.id(), 0));
    negate.apply(&input).unwrap();
    assert_eq!(ctx.kernels().compile_count(), 2);
}

// ── shared buffers ──

#[test]
fn test_same_name_handles_with_different_lengths() {
    let (ctx, _generator) = counting_context(1);
    let mut short = MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x);
    let mut long = MapAccelerator::new(Arc::clone(&ctx), "negate", Captures::new(), |x: i64| -x);
    short.apply(&TypedArray::from_fn(8, |i| i as i64)).unwrap();
    let out = long.apply(&TypedArray::from_fn(16, |i| i as i64)).unwrap();
    assert_eq!(long.strategy(), Strategy::Device, "{:?}", ctx.deopt().reason(long.id()));
    assert_eq!(out.to_vec(), (0..16).map(|i| -i).collect::<Vec<i64>>());
    let out = short.apply(&TypedArray::from_fn(8, |i| i as i64)).unwrap();
    assert_eq!(out.get(7), -7);
    assert_eq!(short.strategy(), Strategy::Device);
}

const SMALL_TABLE: [i32; 2] = [5, 6];
const LARGE_TABLE: [i32; 5] = [1, 2, 3, 4, 5];

fn lut_kernels() -> HostKernels {
    let kernels = HostKernels::new();
    kernels.register("lut", |inv: &mut HostInvocation<'_>| {
        let x: Vec<i32> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        let table: Vec<i32> = inv.read(2)?;
        let utility: Vec<i32> = inv.read(3)?;
        let len = utility[0] as usize / 4;
        for i in 0..n as usize {
            inv.store(4, i, table[x[i] as usize % len])?;
        }
        Ok(())
    });
    kernels
}

#[test]
fn test_same_name_handles_with_different_scope_sizes() {
    let ctx = Arc::new(RuntimeContext::host(1, lut_kernels(), RuntimeOptions::default()));
    let mut small = MapAccelerator::new(
        Arc::clone(&ctx),
        "lut",
        Captures::new().array(0, &SMALL_TABLE[..]),
        |x: i32| SMALL_TABLE[x as usize % 2],
    );
    let mut large = MapAccelerator::new(
        Arc::clone(&ctx),
        "lut",
        Captures::new().array(0, &LARGE_TABLE[..]),
        |x: i32| LARGE_TABLE[x as usize % 5],
    );
    let input = TypedArray::from_fn(10, |i| i as i32);
    assert_eq!(small.apply(&input).unwrap().to_vec(), vec![5, 6, 5, 6, 5, 6, 5, 6, 5, 6]);
    let out = large.apply(&input).unwrap();
    assert_eq!(large.strategy(), Strategy::Device, "{:?}", ctx.deopt().reason(large.id()));
    assert_eq!(out.to_vec(), vec![1, 2, 3, 4, 5, 1, 2, 3, 4, 5]);
}
