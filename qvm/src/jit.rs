use std::mem::offset_of;

use crate::bytecode::Instruction;
use crate::vm::FaultKind;
use crate::wire::BytecodeImage;

pub mod aarch64;
pub mod x86_64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

/// Architecture native routines are generated for, when this host can run them.
pub fn host_arch() -> Option<Arch> {
    if cfg!(all(
        target_arch = "x86_64",
        any(target_os = "linux", target_os = "windows")
    )) {
        Some(Arch::X86_64)
    } else if cfg!(all(
        target_arch = "aarch64",
        any(target_os = "linux", target_os = "macos")
    )) {
        Some(Arch::Aarch64)
    } else {
        None
    }
}

pub fn native_jit_supported() -> bool {
    host_arch().is_some()
}

/// Calling convention for helper calls out of x86-64 code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    SysV,
    Win64,
}

impl CallConv {
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            CallConv::Win64
        } else {
            CallConv::SysV
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    UnsupportedArch,
    UnencodableImmediate { pc: u32, what: &'static str },
    CodeTooLarge { size: usize, limit: usize },
    BranchOutOfRange { pc: u32 },
    UnresolvedTarget { pc: u32, target: u32 },
    ExecutableMemory(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::UnsupportedArch => {
                write!(f, "no native backend for this host architecture")
            }
            CompileError::UnencodableImmediate { pc, what } => {
                write!(f, "cannot encode {what} for instruction {pc}")
            }
            CompileError::CodeTooLarge { size, limit } => {
                write!(f, "native code size {size} exceeds the limit of {limit} bytes")
            }
            CompileError::BranchOutOfRange { pc } => {
                write!(f, "branch from instruction {pc} is out of native range")
            }
            CompileError::UnresolvedTarget { pc, target } => {
                write!(f, "instruction {pc} targets missing instruction {target}")
            }
            CompileError::ExecutableMemory(message) => {
                write!(f, "executable memory error: {message}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// State shared between the host and a running native routine. Generated
/// code addresses the fields through the `ctx_offset` constants.
#[repr(C)]
#[derive(Debug)]
pub struct NativeContext {
    pub data_base: *mut u8,
    pub op_stack: *mut i32,
    pub instruction_table: *const u64,
    pub bridge: *mut std::ffi::c_void,
    pub budget: u64,
    pub break_count: u64,
    pub op_depth: u32,
    pub program_stack: u32,
    pub entry: u32,
    pub fault_kind: u32,
    pub fault_pc: u32,
    pub fault_detail: u32,
}

pub mod ctx_offset {
    use super::{NativeContext, offset_of};

    pub const DATA_BASE: i32 = offset_of!(NativeContext, data_base) as i32;
    pub const OP_STACK: i32 = offset_of!(NativeContext, op_stack) as i32;
    pub const INSTRUCTION_TABLE: i32 = offset_of!(NativeContext, instruction_table) as i32;
    pub const BUDGET: i32 = offset_of!(NativeContext, budget) as i32;
    pub const BREAK_COUNT: i32 = offset_of!(NativeContext, break_count) as i32;
    pub const OP_DEPTH: i32 = offset_of!(NativeContext, op_depth) as i32;
    pub const PROGRAM_STACK: i32 = offset_of!(NativeContext, program_stack) as i32;
    pub const ENTRY: i32 = offset_of!(NativeContext, entry) as i32;
    pub const FAULT_KIND: i32 = offset_of!(NativeContext, fault_kind) as i32;
    pub const FAULT_PC: i32 = offset_of!(NativeContext, fault_pc) as i32;
    pub const FAULT_DETAIL: i32 = offset_of!(NativeContext, fault_detail) as i32;
}

/// Status words returned by native routines. Zero is a normal return;
/// `PENDING` means a helper stored the fault on the host side.
pub mod fault_code {
    pub const NONE: u32 = 0;
    pub const DIVIDE_BY_ZERO: u32 = 1;
    pub const BAD_FLOAT_OP: u32 = 2;
    pub const OP_STACK_OVERFLOW: u32 = 3;
    pub const OP_STACK_UNDERFLOW: u32 = 4;
    pub const PROGRAM_STACK_OUT_OF_RANGE: u32 = 5;
    pub const JUMP_OUT_OF_RANGE: u32 = 6;
    pub const CALL_OUT_OF_RANGE: u32 = 7;
    pub const RETURN_OUT_OF_RANGE: u32 = 8;
    pub const PC_OUT_OF_RANGE: u32 = 9;
    pub const INVALID_OPCODE: u32 = 10;
    pub const BUDGET_EXHAUSTED: u32 = 11;
    pub const PENDING: u32 = 12;
}

/// Maps a native status and its detail word back to a fault. `None` for a
/// normal return, for `PENDING`, and for unknown codes.
pub fn fault_from_code(code: u32, detail: u32) -> Option<FaultKind> {
    let kind = match code {
        fault_code::DIVIDE_BY_ZERO => FaultKind::DivideByZero,
        fault_code::BAD_FLOAT_OP => FaultKind::BadFloatOp,
        fault_code::OP_STACK_OVERFLOW => FaultKind::OpStackOverflow,
        fault_code::OP_STACK_UNDERFLOW => FaultKind::OpStackUnderflow,
        fault_code::PROGRAM_STACK_OUT_OF_RANGE => FaultKind::ProgramStackOutOfRange {
            program_stack: detail,
        },
        fault_code::JUMP_OUT_OF_RANGE => FaultKind::JumpOutOfRange(detail as i32),
        fault_code::CALL_OUT_OF_RANGE => FaultKind::CallOutOfRange(detail as i32),
        fault_code::RETURN_OUT_OF_RANGE => FaultKind::ReturnOutOfRange(detail as i32),
        fault_code::PC_OUT_OF_RANGE => FaultKind::PcOutOfRange,
        fault_code::INVALID_OPCODE => FaultKind::InvalidOpcode(detail as u8),
        fault_code::BUDGET_EXHAUSTED => FaultKind::BudgetExhausted,
        _ => return None,
    };
    Some(kind)
}

/// Everything an emitter needs to know about the instance it compiles for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileLayout {
    pub data_mask: u32,
    pub stack_bottom: u32,
    pub stack_limit: u32,
    pub instruction_count: u32,
    pub syscall_helper: u64,
    pub block_copy_helper: u64,
    pub call_conv: CallConv,
    pub max_code_bytes: usize,
}

impl CompileLayout {
    /// Layout with null helper addresses, for inspecting generated code.
    pub fn for_image(
        image: &BytecodeImage,
        data_mask: u32,
        stack_bottom: u32,
        stack_limit: u32,
    ) -> Self {
        Self {
            data_mask,
            stack_bottom,
            stack_limit,
            instruction_count: image.instruction_count(),
            syscall_helper: 0,
            block_copy_helper: 0,
            call_conv: CallConv::host(),
            max_code_bytes: crate::config::DEFAULT_JIT_MAX_CODE_BYTES,
        }
    }
}

/// A branch whose target instruction had no native offset yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fixup {
    /// Offset of the patch site inside the emitted code.
    pub at: usize,
    pub source: u32,
    pub target: u32,
}

pub trait CodeEmitter {
    fn arch(&self) -> Arch;

    /// Bytes emitted so far.
    fn offset(&self) -> usize;

    fn emit_prologue(&mut self) -> Result<(), CompileError>;

    fn emit_opcode(
        &mut self,
        pc: u32,
        instruction: Instruction,
        fixups: &mut Vec<Fixup>,
    ) -> Result<(), CompileError>;

    fn emit_fixup(&mut self, fixup: &Fixup, target_offset: usize) -> Result<(), CompileError>;

    /// Appends the shared exits and fault stubs and returns the code.
    fn finalize(self) -> Result<Vec<u8>, CompileError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledCode {
    arch: Arch,
    code: Vec<u8>,
    instruction_offsets: Vec<usize>,
}

impl CompiledCode {
    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn instruction_offsets(&self) -> &[usize] {
        &self.instruction_offsets
    }

    pub fn native_offset(&self, pc: u32) -> Option<usize> {
        self.instruction_offsets.get(pc as usize).copied()
    }

    /// Instruction whose native code contains `offset`.
    pub fn instruction_at(&self, offset: usize) -> Option<u32> {
        let end = self.instruction_offsets.partition_point(|start| *start <= offset);
        end.checked_sub(1).map(|pc| pc as u32)
    }
}

/// Single pass over the image: record each instruction's native offset,
/// then resolve the static branch fixups against those offsets.
pub fn compile_with<E: CodeEmitter>(
    mut emitter: E,
    image: &BytecodeImage,
    max_code_bytes: usize,
) -> Result<CompiledCode, CompileError> {
    let arch = emitter.arch();
    let too_large = |size| CompileError::CodeTooLarge {
        size,
        limit: max_code_bytes,
    };

    emitter.emit_prologue()?;
    let mut instruction_offsets = Vec::with_capacity(image.instructions().len());
    let mut fixups = Vec::new();
    for (pc, instruction) in image.instructions().iter().enumerate() {
        instruction_offsets.push(emitter.offset());
        emitter.emit_opcode(pc as u32, *instruction, &mut fixups)?;
        if emitter.offset() > max_code_bytes {
            return Err(too_large(emitter.offset()));
        }
    }
    for fixup in &fixups {
        let target_offset = instruction_offsets
            .get(fixup.target as usize)
            .copied()
            .ok_or(CompileError::UnresolvedTarget {
                pc: fixup.source,
                target: fixup.target,
            })?;
        emitter.emit_fixup(fixup, target_offset)?;
    }
    let code = emitter.finalize()?;
    if code.len() > max_code_bytes {
        return Err(too_large(code.len()));
    }
    Ok(CompiledCode {
        arch,
        code,
        instruction_offsets,
    })
}

pub fn compile_image(
    arch: Arch,
    image: &BytecodeImage,
    layout: &CompileLayout,
) -> Result<CompiledCode, CompileError> {
    match arch {
        Arch::X86_64 => compile_with(
            x86_64::X86_64Emitter::new(layout.clone()),
            image,
            layout.max_code_bytes,
        ),
        Arch::Aarch64 => compile_with(
            aarch64::Aarch64Emitter::new(layout.clone())?,
            image,
            layout.max_code_bytes,
        ),
    }
}
