//! Shared fixtures: stub-backed sessions and host kernel implementations.
#![allow(dead_code)]

use std::sync::Arc;

use gravel_core::source::StaticSource;
use gravel_core::stub::{LaunchContext, StubDevice};
use gravel_core::{Session, SessionOptions};

/// A session over a fresh stub presenting as a discrete non-NVIDIA GPU
/// (staged uploads), with all fixture kernels registered.
pub fn stub_session(options: SessionOptions) -> (Arc<StubDevice>, Session) {
    let stub = StubDevice::new();
    register_fixture_kernels(&stub);
    let session = Session::new(stub.clone(), options).expect("session over stub");
    (stub, session)
}

pub fn register_fixture_kernels(stub: &StubDevice) {
    stub.register_kernel_for("identity map", "map", identity_map);
    stub.register_kernel_for("square map", "map", square_map);
    stub.register_kernel_for("widen map", "map", widen_map);
    stub.register_kernel_for("u32 sum", "reduce", sum_u32);
    stub.register_kernel_for("f64 sum", "reduce", sum_f64);
}

pub fn identity_source() -> StaticSource {
    StaticSource::new([
        "// identity map over uint\n",
        "__kernel void map(__global const uint* in, __global uint* out) {\n",
        "    size_t i = get_global_id(0);\n",
        "    out[i] = in[i];\n",
        "}\n",
    ])
}

pub fn square_source() -> StaticSource {
    StaticSource::new([
        "// square map over uint\n",
        "__kernel void map(__global uint* in, __global uint* out) {\n",
        "    size_t i = get_global_id(0);\n",
        "    out[i] = in[i] * in[i];\n",
        "}\n",
    ])
}

pub fn widen_source() -> StaticSource {
    StaticSource::new([
        "// widen map: uint -> ulong\n",
        "__kernel void map(__global const uint* in, __global ulong* out) {\n",
        "    size_t i = get_global_id(0);\n",
        "    out[i] = (ulong)in[i];\n",
        "}\n",
    ])
}

pub fn sum_u32_source() -> StaticSource {
    StaticSource::new([
        "// u32 sum, stage 1\n",
        "__kernel void reduce(__global const uint* in, __global uint* out,\n",
        "                     __local uint* scratch, uint n) { /* tree fold */ }\n",
    ])
    .with_stage2([
        "// u32 sum, stage 2\n",
        "__kernel void reduce(__global const uint* in, __global uint* out,\n",
        "                     __local uint* scratch, uint n) { /* tree fold */ }\n",
    ])
}

pub fn sum_f64_source() -> StaticSource {
    StaticSource::new([
        "// f64 sum, stage 1\n",
        "__kernel void reduce(__global const double* in, __global double* out,\n",
        "                     __local double* scratch, uint n) { /* tree fold */ }\n",
    ])
    .with_stage2([
        "// f64 sum, stage 2\n",
        "__kernel void reduce(__global const double* in, __global double* out,\n",
        "                     __local double* scratch, uint n) { /* tree fold */ }\n",
    ])
}

fn read_u32(bytes: &[u8], index: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[index * 4..index * 4 + 4]);
    u32::from_le_bytes(raw)
}

fn write_u32(bytes: &mut [u8], index: usize, value: u32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

/// One-to-one copy; with a single bound buffer it is an in-place no-op.
pub fn identity_map(ctx: &LaunchContext) {
    if ctx.arg_count() == 1 {
        return;
    }
    let n = ctx.global();
    let input = ctx.bytes(0);
    let output = ctx.bytes_mut(1);
    output[..n * 4].copy_from_slice(&input[..n * 4]);
}

/// `x -> x * x` over u32, in place or into a second buffer.
pub fn square_map(ctx: &LaunchContext) {
    let n = ctx.global();
    if ctx.arg_count() == 1 {
        let data = ctx.bytes_mut(0);
        for i in 0..n {
            let v = read_u32(data, i);
            write_u32(data, i, v.wrapping_mul(v));
        }
    } else {
        let input = ctx.bytes(0);
        let output = ctx.bytes_mut(1);
        for i in 0..n {
            let v = read_u32(input, i);
            write_u32(output, i, v.wrapping_mul(v));
        }
    }
}

/// Zero-extends u32 inputs into u64 outputs.
pub fn widen_map(ctx: &LaunchContext) {
    let n = ctx.global();
    let input = ctx.bytes(0);
    let output = ctx.bytes_mut(1);
    for i in 0..n {
        let v = read_u32(input, i) as u64;
        output[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
    }
}

/// Grid-strided partial sums over u32: work-group `g` folds every element
/// with `index % num_groups == g` into `out[g]`. A single-group launch
/// therefore folds everything into `out[0]`, which is exactly what the
/// second reduction stage runs as.
pub fn sum_u32(ctx: &LaunchContext) {
    let n = ctx.scalar_u32(3) as usize;
    let groups = ctx.num_groups();
    let input = ctx.bytes(0);
    let output = ctx.bytes_mut(1);
    for g in 0..groups {
        let mut acc: u32 = 0;
        let mut i = g;
        while i < n {
            acc = acc.wrapping_add(read_u32(input, i));
            i += groups;
        }
        write_u32(output, g, acc);
    }
}

/// Same shape as [`sum_u32`] over f64.
pub fn sum_f64(ctx: &LaunchContext) {
    let n = ctx.scalar_u32(3) as usize;
    let groups = ctx.num_groups();
    let input = ctx.bytes(0);
    let output = ctx.bytes_mut(1);
    for g in 0..groups {
        let mut acc: f64 = 0.0;
        let mut i = g;
        while i < n {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&input[i * 8..i * 8 + 8]);
            acc += f64::from_le_bytes(raw);
            i += groups;
        }
        output[g * 8..g * 8 + 8].copy_from_slice(&acc.to_le_bytes());
    }
}
