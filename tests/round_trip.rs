use std::sync::Arc;

use hetarray::device::{HostInvocation, HostKernels};
use hetarray::{ArrayFunction, Captures, Element, MapAccelerator, RuntimeContext, RuntimeOptions, TypedArray};

/// Copies every input column to the matching output column. Input columns
/// start at argument 0, outputs follow the length argument.
fn identity(columns: usize) -> impl Fn(&mut HostInvocation<'_>) -> Result<(), String> + Send + Sync {
    move |inv: &mut HostInvocation<'_>| {
        for c in 0..columns {
            let src = inv.bytes(c)?.to_vec();
            let dst = inv.bytes_mut(columns + 1 + c)?;
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        Ok(())
    }
}

fn context(devices: usize, kernels: HostKernels) -> Arc<RuntimeContext> {
    Arc::new(RuntimeContext::host(devices, kernels, RuntimeOptions::default()))
}

fn assert_round_trip<T>(name: &str, devices: usize, make: impl Fn(usize) -> T)
where
    T: Element + PartialEq + std::fmt::Debug,
{
    let kernels = HostKernels::new();
    kernels.register(name, identity(T::layout().len()));
    let ctx = context(devices, kernels);
    for size in [1usize, 31, 1024] {
        let input = TypedArray::from_fn(size, &make);
        let mut map = MapAccelerator::new(Arc::clone(&ctx), name, Captures::new(), |x: T| x);
        let out = map.apply(&input).unwrap();
        assert!(!ctx.deopt().is_deoptimized(map.id()), "{name} fell back at size {size}");
        assert_eq!(out.to_vec(), input.to_vec(), "{name} at size {size}");
    }
}

// ── scalars ──

#[test]
fn test_round_trip_every_scalar_kind() {
    for devices in [1, 2] {
        assert_round_trip("id_int", devices, |i| i as i32 - 500);
        assert_round_trip("id_long", devices, |i| (i as i64) << 33);
        assert_round_trip("id_float", devices, |i| i as f32 * 0.25);
        assert_round_trip("id_double", devices, |i| -(i as f64) / 3.0);
        assert_round_trip("id_short", devices, |i| i as i16);
        assert_round_trip("id_byte", devices, |i| i as i8);
        assert_round_trip("id_char", devices, |i| b'a' + (i % 26) as u8);
        assert_round_trip("id_boolean", devices, |i| i % 3 == 0);
    }
}

// ── aggregates ──

#[test]
fn test_round_trip_tuples() {
    assert_round_trip("id_pair", 2, |i| (i as f32, i as i64 * -7));
    assert_round_trip("id_triple", 2, |i| (i as i32, i as f64 * 0.5, i % 2 == 0));
}

#[test]
fn test_round_trip_fixed_arrays() {
    assert_round_trip("id_vec3", 2, |i| [i as f32, i as f32 + 1.0, i as f32 + 2.0]);
}
