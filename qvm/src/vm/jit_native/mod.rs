use std::any::Any;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use tracing::debug;

use super::bridge::dispatch_syscall;
use super::{ExitState, FaultKind, Instance, OP_STACK_SLOTS, RuntimeFault, VmResult};
use crate::jit::{
    self, CallConv, CompileError, CompileLayout, CompiledCode, NativeContext, fault_code,
};
use crate::registry::{VmHandle, VmRegistry};
use crate::wire::BytecodeImage;

mod exec_memory;

use exec_memory::ExecutableMemory;

type NativeEntry = unsafe extern "C" fn(*mut NativeContext) -> u32;

/// Machine code for one image, mapped executable, plus the absolute
/// address of every instruction for computed jumps.
pub(crate) struct NativeRoutine {
    code: CompiledCode,
    memory: ExecutableMemory,
    addresses: Vec<u64>,
}

/// Host state reachable from helper calls made by generated code.
struct BridgeState {
    instance: *mut Instance,
    registry: *mut VmRegistry,
    handle: VmHandle,
    pending: Option<RuntimeFault>,
    panic: Option<Box<dyn Any + Send>>,
}

impl NativeRoutine {
    pub(crate) fn compile(
        image: &BytecodeImage,
        data_mask: u32,
        stack_bottom: u32,
        stack_limit: u32,
        max_code_bytes: usize,
    ) -> Result<Self, CompileError> {
        let arch = jit::host_arch().ok_or(CompileError::UnsupportedArch)?;
        let layout = CompileLayout {
            data_mask,
            stack_bottom,
            stack_limit,
            instruction_count: image.instruction_count(),
            syscall_helper: qvm_syscall_bridge as *const () as usize as u64,
            block_copy_helper: qvm_block_copy_bridge as *const () as usize as u64,
            call_conv: CallConv::host(),
            max_code_bytes,
        };
        let code = jit::compile_image(arch, image, &layout)?;
        let memory = ExecutableMemory::from_code(code.code())?;
        let base = memory.as_ptr() as u64;
        let addresses = code
            .instruction_offsets()
            .iter()
            .map(|offset| base + *offset as u64)
            .collect();
        debug!(
            "compiled {} instructions into {} bytes of {} code",
            image.instruction_count(),
            memory.len(),
            arch.name()
        );
        Ok(Self {
            code,
            memory,
            addresses,
        })
    }

    pub(crate) fn code(&self) -> &CompiledCode {
        &self.code
    }

    pub(crate) fn run(
        &self,
        instance: &mut Instance,
        registry: &mut VmRegistry,
        handle: VmHandle,
        start_pc: u32,
        frame: u32,
    ) -> VmResult<ExitState> {
        let mut op_stack = [0i32; OP_STACK_SLOTS];
        let data_base = instance.memory.as_mut_ptr();
        let budget = instance.budget.unwrap_or(u64::MAX);
        let mut bridge = BridgeState {
            instance: instance as *mut Instance,
            registry: registry as *mut VmRegistry,
            handle,
            pending: None,
            panic: None,
        };
        let mut ctx = NativeContext {
            data_base,
            op_stack: op_stack.as_mut_ptr(),
            instruction_table: self.addresses.as_ptr(),
            bridge: &mut bridge as *mut BridgeState as *mut c_void,
            budget,
            break_count: 0,
            op_depth: 0,
            program_stack: frame,
            entry: start_pc,
            fault_kind: fault_code::NONE,
            fault_pc: 0,
            fault_detail: 0,
        };

        let status = unsafe {
            let entry: NativeEntry = std::mem::transmute(self.memory.as_ptr());
            entry(&mut ctx)
        };

        if let Some(payload) = bridge.panic.take() {
            resume_unwind(payload);
        }
        instance.break_count += ctx.break_count;

        match status {
            fault_code::NONE => {
                let depth = ctx.op_depth as usize;
                let value = depth
                    .checked_sub(1)
                    .and_then(|top| op_stack.get(top).copied())
                    .unwrap_or(0);
                Ok(ExitState {
                    value,
                    depth,
                    program_stack: ctx.program_stack,
                    pc: ctx.fault_pc,
                })
            }
            fault_code::PENDING => Err(bridge
                .pending
                .take()
                .unwrap_or_else(|| RuntimeFault::host("native helper failed without a fault"))
                .at(ctx.fault_pc)),
            code => {
                let kind = jit::fault_from_code(code, ctx.fault_detail).unwrap_or_else(|| {
                    FaultKind::Host(format!("unknown native status {code}"))
                });
                Err(RuntimeFault::new(kind, Some(ctx.fault_pc)))
            }
        }
    }
}

/// Services CALL to a negative target. Pushes the handler's result on
/// success; otherwise parks the fault (or panic) and reports `PENDING`.
unsafe extern "C" fn qvm_syscall_bridge(ctx: *mut NativeContext, target: i32) -> u32 {
    let ctx = unsafe { &mut *ctx };
    let bridge = unsafe { &mut *(ctx.bridge as *mut BridgeState) };
    let instance = unsafe { &mut *bridge.instance };
    let registry = unsafe { &mut *bridge.registry };
    let handle = bridge.handle;
    let program_stack = ctx.program_stack;

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        dispatch_syscall(instance, registry, handle, program_stack, target)
    }));
    match outcome {
        Ok(Ok(value)) => {
            unsafe { *ctx.op_stack.add(ctx.op_depth as usize) = value };
            ctx.op_depth += 1;
            fault_code::NONE
        }
        Ok(Err(fault)) => {
            bridge.pending = Some(fault);
            fault_code::PENDING
        }
        Err(payload) => {
            bridge.panic = Some(payload);
            fault_code::PENDING
        }
    }
}

/// Pops source and destination, then copies `len` bytes inside the sandbox.
unsafe extern "C" fn qvm_block_copy_bridge(ctx: *mut NativeContext, len: u32) -> u32 {
    let ctx = unsafe { &mut *ctx };
    let bridge = unsafe { &mut *(ctx.bridge as *mut BridgeState) };
    let instance = unsafe { &mut *bridge.instance };

    // generated code has already checked for two operands
    let depth = ctx.op_depth as usize;
    let src = unsafe { *ctx.op_stack.add(depth - 1) } as u32;
    let dest = unsafe { *ctx.op_stack.add(depth - 2) } as u32;
    ctx.op_depth -= 2;
    match instance.memory.block_copy(dest, src, len) {
        Ok(()) => fault_code::NONE,
        Err(kind) => {
            bridge.pending = Some(kind.into());
            fault_code::PENDING
        }
    }
}
