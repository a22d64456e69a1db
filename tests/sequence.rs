use std::sync::Arc;

use hetarray::deopt::Strategy;
use hetarray::device::{HostInvocation, HostKernels};
use hetarray::{ArrayFunction, Captures, MapAccelerator, RuntimeContext, RuntimeOptions, TypedArray};

/// `cube` over a plain array and `cube_seq` over a `{start, step}` pair.
fn cube_kernels() -> HostKernels {
    let kernels = HostKernels::new();
    kernels.register("cube", |inv: &mut HostInvocation<'_>| {
        let x: Vec<i32> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        for i in 0..n as usize {
            inv.store(2, i, i64::from(x[i]).pow(3))?;
        }
        Ok(())
    });
    kernels.register("cube_seq", |inv: &mut HostInvocation<'_>| {
        let seq: Vec<i32> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        let (start, step) = (seq[0], seq[1]);
        for i in 0..n {
            inv.store(2, i as usize, i64::from(start + i * step).pow(3))?;
        }
        Ok(())
    });
    kernels
}

fn cube(x: i32) -> i64 {
    i64::from(x).pow(3)
}

#[test]
fn test_sequence_runs_on_every_device() {
    let ctx = Arc::new(RuntimeContext::host(2, cube_kernels(), RuntimeOptions::default()));
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "cube", Captures::new(), cube);
    let seq = TypedArray::sequence(-50, 3, 100);
    let out = map.apply(&seq).unwrap();
    assert_eq!(map.strategy(), Strategy::Device, "{:?}", ctx.deopt().reason(map.id()));
    let expected: Vec<i64> = (0..100).map(|i| cube(-50 + i * 3)).collect();
    assert_eq!(out.to_vec(), expected);
}

#[test]
fn test_sequence_and_array_use_separate_kernels() {
    let ctx = Arc::new(RuntimeContext::host(2, cube_kernels(), RuntimeOptions::default()));
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "cube", Captures::new(), cube);

    let plain = map.apply(&TypedArray::from_fn(10, |i| i as i32)).unwrap();
    let seq = map.apply(&TypedArray::sequence(0, 1, 10)).unwrap();
    assert_eq!(plain.to_vec(), seq.to_vec());
    assert_eq!(ctx.kernels().compile_count(), 4);
}

#[test]
fn test_sequence_without_variant_falls_back() {
    let kernels = HostKernels::new();
    kernels.register("cube", |_: &mut HostInvocation<'_>| Ok(()));
    let ctx = Arc::new(RuntimeContext::host(1, kernels, RuntimeOptions::default()));
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "cube", Captures::new(), cube);
    let out = map.apply(&TypedArray::sequence(1, 1, 5)).unwrap();
    assert_eq!(out.to_vec(), vec![1, 8, 27, 64, 125]);
    assert_eq!(map.strategy(), Strategy::Host);
    assert!(ctx.deopt().reason(map.id()).unwrap().contains("cube_seq"));
}

#[test]
fn test_sequence_expands_on_host() {
    let seq = TypedArray::sequence(5, -2, 4);
    assert!(seq.is_sequence());
    assert_eq!(seq.stored_len(), 2);
    assert_eq!(seq.len(), 4);
    let expanded = seq.expanded();
    assert!(!expanded.is_sequence());
    assert_eq!(expanded.to_vec(), vec![5, 3, 1, -1]);
}
