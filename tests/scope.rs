use std::sync::Arc;

use hetarray::deopt::Strategy;
use hetarray::device::{HostInvocation, HostKernels};
use hetarray::{ArrayFunction, Captures, Error, MapAccelerator, RuntimeContext, RuntimeOptions, TypedArray};

const TABLE: [i32; 5] = [10, 20, 30, 40, 50];

fn lookup(x: i32, scale: f32) -> f32 {
    TABLE[x as usize % TABLE.len()] as f32 * scale
}

/// Register `name` as `out[i] = table[x[i] % len] * scale`, reading the
/// scalar, table and table utility from the given argument positions.
fn register_lookup(kernels: &HostKernels, name: &str, scale_at: usize, table_at: usize, out_at: usize) {
    kernels.register(name, move |inv: &mut HostInvocation<'_>| {
        let x: Vec<i32> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        let scale: f32 = inv.scalar(scale_at)?;
        let table: Vec<i32> = inv.read(table_at)?;
        let utility: Vec<i32> = inv.read(table_at + 1)?;
        if utility != [(TABLE.len() * 4) as i32, 0] {
            return Err(format!("bad utility buffer {utility:?}"));
        }
        for i in 0..n as usize {
            let v = table[x[i] as usize % table.len()] as f32 * scale;
            inv.store(out_at, i, v)?;
        }
        Ok(())
    });
}

fn context(kernels: HostKernels) -> Arc<RuntimeContext> {
    Arc::new(RuntimeContext::host(2, kernels, RuntimeOptions::default()))
}

fn check(out: &TypedArray<f32>, scale: f32) {
    for (i, v) in out.iter().enumerate() {
        assert_eq!(v, lookup(i as i32, scale), "element {i}");
    }
}

// ── slot ordering ──

#[test]
fn test_scalar_before_array() {
    let kernels = HostKernels::new();
    register_lookup(&kernels, "lookup_sa", 2, 3, 5);
    let ctx = context(kernels);
    let captures = Captures::new().scalar(0, 0.5f32).array(1, &TABLE);
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "lookup_sa", captures, |x: i32| lookup(x, 0.5));
    let out = map.apply(&TypedArray::from_fn(64, |i| i as i32)).unwrap();
    assert_eq!(map.strategy(), Strategy::Device, "{:?}", ctx.deopt().reason(map.id()));
    check(&out, 0.5);
}

#[test]
fn test_array_before_scalar() {
    let kernels = HostKernels::new();
    register_lookup(&kernels, "lookup_as", 4, 2, 5);
    let ctx = context(kernels);
    let captures = Captures::new().array(0, &TABLE).scalar(1, 2.0f32);
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "lookup_as", captures, |x: i32| lookup(x, 2.0));
    let out = map.apply(&TypedArray::from_fn(33, |i| i as i32 * 7)).unwrap();
    assert_eq!(map.strategy(), Strategy::Device, "{:?}", ctx.deopt().reason(map.id()));
    for i in 0..33 {
        assert_eq!(out.get(i), lookup(i as i32 * 7, 2.0));
    }
}

#[test]
fn test_capture_order_does_not_matter() {
    let kernels = HostKernels::new();
    register_lookup(&kernels, "lookup_rev", 2, 3, 5);
    let ctx = context(kernels);
    // Declared in reverse; slots decide positions.
    let captures = Captures::new().array(1, &TABLE).scalar(0, 1.5f32);
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "lookup_rev", captures, |x: i32| lookup(x, 1.5));
    let out = map.apply(&TypedArray::from_fn(20, |i| i as i32)).unwrap();
    assert_eq!(map.strategy(), Strategy::Device);
    check(&out, 1.5);
}

// ── scope buffers ──

#[test]
fn test_scope_buffers_are_reused_across_calls() {
    let kernels = HostKernels::new();
    register_lookup(&kernels, "lookup_reuse", 2, 3, 5);
    let ctx = context(kernels);
    let captures = Captures::new().scalar(0, 1.0f32).array(1, &TABLE);
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "lookup_reuse", captures, |x: i32| lookup(x, 1.0));
    let input = TypedArray::from_fn(40, |i| i as i32);
    map.apply(&input).unwrap();
    let after_first = ctx.buffers().len();
    map.apply(&input).unwrap();
    assert_eq!(ctx.buffers().len(), after_first);
    drop(map);
    assert!(ctx.buffers().is_empty());
}

#[test]
fn test_gap_in_slots_is_rejected() {
    let kernels = HostKernels::new();
    register_lookup(&kernels, "lookup_gap", 2, 3, 5);
    let ctx = context(kernels);
    let captures = Captures::new().scalar(0, 1.0f32).array(2, &TABLE);
    let mut map = MapAccelerator::new(Arc::clone(&ctx), "lookup_gap", captures, |x: i32| lookup(x, 1.0));
    let err = map.apply(&TypedArray::from_fn(4, |i| i as i32)).unwrap_err();
    assert!(matches!(err, Error::InvalidScope(_)));
}
