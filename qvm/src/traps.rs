//! Host implementations of the traps every module import table shares:
//! memory helpers, libm wrappers and a few vector routines. All guest
//! pointers go through the sandbox translation API.

use qvm_abi::{
    SHARED_TRAPS, TRAP_ANGLEVECTORS, TRAP_ATAN2, TRAP_CEIL, TRAP_COS, TRAP_FLOOR, TRAP_MATRIXMULTIPLY,
    TRAP_MEMCPY, TRAP_MEMSET, TRAP_PERPENDICULARVECTOR, TRAP_SIN, TRAP_SQRT, TRAP_STRNCPY,
    TRAP_TESTPRINTFLOAT, TRAP_TESTPRINTINT,
};
use tracing::info;

use crate::vm::{
    SandboxMemory, SyscallArgs, SyscallContext, SyscallTable, VmResult, float_to_word,
};

type TrapFn = fn(&mut SyscallContext<'_>, &SyscallArgs) -> VmResult<i32>;

pub type Vec3 = [f32; 3];

pub fn install_shared_traps(table: &mut SyscallTable) {
    for trap in SHARED_TRAPS {
        let handler: TrapFn = match trap.id {
            TRAP_MEMSET => memset,
            TRAP_MEMCPY => memcpy,
            TRAP_STRNCPY => strncpy,
            TRAP_SIN => |_, args| Ok(float_to_word(args.float(0).sin())),
            TRAP_COS => |_, args| Ok(float_to_word(args.float(0).cos())),
            TRAP_ATAN2 => |_, args| Ok(float_to_word(args.float(0).atan2(args.float(1)))),
            TRAP_SQRT => |_, args| Ok(float_to_word(args.float(0).sqrt())),
            TRAP_FLOOR => |_, args| Ok(float_to_word(args.float(0).floor())),
            TRAP_CEIL => |_, args| Ok(float_to_word(args.float(0).ceil())),
            TRAP_MATRIXMULTIPLY => matrix_multiply_trap,
            TRAP_ANGLEVECTORS => angle_vectors_trap,
            TRAP_PERPENDICULARVECTOR => perpendicular_vector_trap,
            TRAP_TESTPRINTINT => test_print_int,
            TRAP_TESTPRINTFLOAT => test_print_float,
            _ => continue,
        };
        table.register(trap.id, trap.name, handler);
    }
}

fn memset(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let dest = args.addr(0);
    let count = args.addr(2) as usize;
    ctx.memory_mut()
        .slice_mut(dest, count)?
        .fill(args.arg(1) as u8);
    Ok(dest as i32)
}

/// Overlapping ranges are copied as if through a temporary buffer.
fn memcpy(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let dest = args.addr(0);
    let src = args.addr(1);
    let count = args.addr(2) as usize;
    let bytes = ctx.memory().slice(src, count)?.to_vec();
    ctx.memory_mut().write_bytes(dest, &bytes)?;
    Ok(dest as i32)
}

/// Copies at most `n` bytes and zero-fills the rest of the destination.
fn strncpy(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let dest = args.addr(0);
    let src = args.addr(1);
    let n = args.addr(2) as usize;
    let copied = match ctx.memory().read_cstr(src) {
        Ok(text) => text[..text.len().min(n)].to_vec(),
        Err(_) => ctx.memory().slice(src, n)?.to_vec(),
    };
    let out = ctx.memory_mut().slice_mut(dest, n)?;
    out.fill(0);
    out[..copied.len()].copy_from_slice(&copied);
    Ok(dest as i32)
}

fn read_floats<const N: usize>(memory: &SandboxMemory, addr: u32) -> VmResult<[f32; N]> {
    let bytes = memory.slice(addr, 4 * N)?;
    let mut out = [0.0; N];
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(out)
}

fn write_floats(memory: &mut SandboxMemory, addr: u32, values: &[f32]) -> VmResult<()> {
    let out = memory.slice_mut(addr, 4 * values.len())?;
    for (chunk, value) in out.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

pub fn matrix_multiply(a: &[Vec3; 3], b: &[Vec3; 3]) -> [Vec3; 3] {
    let mut out = [[0.0; 3]; 3];
    for (row, out_row) in out.iter_mut().enumerate() {
        for (col, cell) in out_row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[row][k] * b[k][col]).sum();
        }
    }
    out
}

fn matrix_multiply_trap(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let a: [f32; 9] = read_floats(ctx.memory(), args.addr(0))?;
    let b: [f32; 9] = read_floats(ctx.memory(), args.addr(1))?;
    let rows = |m: [f32; 9]| [[m[0], m[1], m[2]], [m[3], m[4], m[5]], [m[6], m[7], m[8]]];
    let product = matrix_multiply(&rows(a), &rows(b));
    write_floats(ctx.memory_mut(), args.addr(2), product.as_flattened())?;
    Ok(0)
}

/// Forward, right and up vectors for pitch/yaw/roll angles in degrees.
pub fn angle_vectors(angles: Vec3) -> (Vec3, Vec3, Vec3) {
    let radians = |degrees: f32| degrees * (std::f32::consts::PI * 2.0 / 360.0);
    let (sp, cp) = radians(angles[0]).sin_cos();
    let (sy, cy) = radians(angles[1]).sin_cos();
    let (sr, cr) = radians(angles[2]).sin_cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + cr * sy,
        -sr * sp * sy - cr * cy,
        -sr * cp,
    ];
    let up = [cr * sp * cy + sr * sy, cr * sp * sy - sr * cy, cr * cp];
    (forward, right, up)
}

fn angle_vectors_trap(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let angles: Vec3 = read_floats(ctx.memory(), args.addr(0))?;
    let (forward, right, up) = angle_vectors(angles);
    for (slot, vector) in [(1, forward), (2, right), (3, up)] {
        // null outputs are skipped
        let addr = args.addr(slot);
        if addr != 0 {
            write_floats(ctx.memory_mut(), addr, &vector)?;
        }
    }
    Ok(0)
}

fn dot(a: Vec3, b: Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// A unit vector perpendicular to `src`, built from the axis `src` leans
/// on least.
pub fn perpendicular_vector(src: Vec3) -> Vec3 {
    let mut axis = 0;
    let mut smallest = 1.0f32;
    for (index, value) in src.iter().enumerate() {
        if value.abs() < smallest {
            axis = index;
            smallest = value.abs();
        }
    }
    let mut point = [0.0; 3];
    point[axis] = 1.0;

    // project the axis onto the plane normal to src
    let inv_denom = 1.0 / dot(src, src);
    let d = dot(src, point) * inv_denom;
    let mut out = [0.0; 3];
    for i in 0..3 {
        out[i] = point[i] - d * src[i] * inv_denom;
    }
    let length = dot(out, out).sqrt();
    if length != 0.0 {
        for value in &mut out {
            *value /= length;
        }
    }
    out
}

fn perpendicular_vector_trap(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let src: Vec3 = read_floats(ctx.memory(), args.addr(1))?;
    write_floats(ctx.memory_mut(), args.addr(0), &perpendicular_vector(src))?;
    Ok(0)
}

fn test_print_int(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let label = ctx.read_string(args.addr(0))?;
    info!("{}: {label}{}", ctx.instance().name(), args.arg(1));
    Ok(0)
}

fn test_print_float(ctx: &mut SyscallContext<'_>, args: &SyscallArgs) -> VmResult<i32> {
    let label = ctx.read_string(args.addr(0))?;
    info!("{}: {label}{}", ctx.instance().name(), args.float(1));
    Ok(0)
}
