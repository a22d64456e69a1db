//! WGSL kernels bundled for the wgpu backend.
//!
//! Bindings follow kernel argument order: input columns, input length,
//! scope arguments, output columns, deoptimization guard. Every binding must
//! be referenced by the shader or the derived layout drops it.

/// Entry point of [`SCALE_F32`].
pub const SCALE_F32_ENTRY: &str = "scale_f32";

/// `y[i] = a * x[i]` over `f32`, with `a` captured at scope slot 0.
pub const SCALE_F32: &str = r#"
@group(0) @binding(0) var<storage, read> x: array<f32>;
@group(0) @binding(1) var<storage, read> x_len: array<i32>;
@group(0) @binding(2) var<storage, read> a: array<f32>;
@group(0) @binding(3) var<storage, read_write> y: array<f32>;
@group(0) @binding(4) var<storage, read_write> guard: array<i32>;

@compute @workgroup_size(64)
fn scale_f32(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i == 0u) {
        guard[0] = 0;
    }
    if (i >= u32(x_len[0])) {
        return;
    }
    y[i] = a[0] * x[i];
}
"#;
