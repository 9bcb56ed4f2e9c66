use std::rc::Rc;

use crate::config::{MIN_STACK_SIZE, VmConfig};
use crate::jit::{CompileError, CompiledCode};
use crate::registry::{VmHandle, VmRegistry};
use crate::wire::{BytecodeImage, LoadError};

mod bridge;
mod interpreter;
pub(crate) mod jit_native;
pub mod memory;

pub use bridge::{
    SyscallArgs, SyscallContext, SyscallHandler, SyscallTable, float_to_word, word_to_float,
};
pub use memory::SandboxMemory;

/// Arguments a host call can pass: the command plus twelve parameters.
pub const MAX_VMMAIN_ARGS: usize = 13;
/// Words handed to a syscall handler, including the syscall id.
pub const MAX_VMSYSCALL_ARGS: usize = 16;
pub const OP_STACK_SLOTS: usize = 256;
/// Host entry frame: return sentinel, a spare word, then the arguments.
pub const ENTRY_FRAME_BYTES: u32 = 8 + 4 * MAX_VMMAIN_ARGS as u32;
pub const RETURN_SENTINEL: i32 = -1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    DivideByZero,
    BadFloatOp,
    OpStackOverflow,
    OpStackUnderflow,
    ProgramStackOutOfRange { program_stack: u32 },
    JumpOutOfRange(i32),
    CallOutOfRange(i32),
    ReturnOutOfRange(i32),
    PcOutOfRange,
    InvalidOpcode(u8),
    BlockCopyOutOfRange { dest: u32, src: u32, len: u32 },
    BudgetExhausted,
    UnknownSyscall(u32),
    NestingTooDeep { limit: usize },
    HostPointerOutOfRange { addr: u32, len: usize },
    Host(String),
    InvalidHandle,
    InstanceBusy,
    TooManyArguments(usize),
    OpStackImbalance { depth: usize },
    ProgramStackCorrupted,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::DivideByZero => write!(f, "integer division by zero"),
            FaultKind::BadFloatOp => write!(f, "float to int conversion out of range"),
            FaultKind::OpStackOverflow => write!(f, "operand stack overflow"),
            FaultKind::OpStackUnderflow => write!(f, "operand stack underflow"),
            FaultKind::ProgramStackOutOfRange { program_stack } => {
                write!(f, "program stack {program_stack:#x} out of range")
            }
            FaultKind::JumpOutOfRange(target) => write!(f, "jump target {target} out of range"),
            FaultKind::CallOutOfRange(target) => write!(f, "call target {target} out of range"),
            FaultKind::ReturnOutOfRange(target) => {
                write!(f, "return address {target} out of range")
            }
            FaultKind::PcOutOfRange => write!(f, "program counter ran past the last instruction"),
            FaultKind::InvalidOpcode(opcode) => write!(f, "invalid opcode {opcode}"),
            FaultKind::BlockCopyOutOfRange { dest, src, len } => write!(
                f,
                "block copy of {len} bytes from {src:#x} to {dest:#x} out of range"
            ),
            FaultKind::BudgetExhausted => write!(f, "instruction budget exhausted"),
            FaultKind::UnknownSyscall(id) => write!(f, "unknown syscall {id}"),
            FaultKind::NestingTooDeep { limit } => {
                write!(f, "call nesting exceeds the limit of {limit}")
            }
            FaultKind::HostPointerOutOfRange { addr, len } => {
                write!(f, "guest pointer {addr:#x} with length {len} out of range")
            }
            FaultKind::Host(message) => write!(f, "host error: {message}"),
            FaultKind::InvalidHandle => write!(f, "invalid vm handle"),
            FaultKind::InstanceBusy => write!(f, "vm instance is already running"),
            FaultKind::TooManyArguments(count) => write!(
                f,
                "{count} call arguments exceed the limit of {MAX_VMMAIN_ARGS}"
            ),
            FaultKind::OpStackImbalance { depth } => {
                write!(f, "operand stack holds {depth} values on return, expected 1")
            }
            FaultKind::ProgramStackCorrupted => {
                write!(f, "program stack not restored on return")
            }
        }
    }
}

/// A fault that ended a call, with the instruction it was raised at when
/// one applies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeFault {
    pub kind: FaultKind,
    pub pc: Option<u32>,
}

impl RuntimeFault {
    pub fn new(kind: FaultKind, pc: Option<u32>) -> Self {
        Self { kind, pc }
    }

    pub fn host(message: impl Into<String>) -> Self {
        FaultKind::Host(message.into()).into()
    }

    /// Attributes the fault to `pc` unless an inner frame already did.
    pub fn at(mut self, pc: u32) -> Self {
        if self.pc.is_none() {
            self.pc = Some(pc);
        }
        self
    }
}

impl From<FaultKind> for RuntimeFault {
    fn from(kind: FaultKind) -> Self {
        Self { kind, pc: None }
    }
}

impl std::fmt::Display for RuntimeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.pc {
            Some(pc) => write!(f, "{} at instruction {pc}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for RuntimeFault {}

pub type VmResult<T> = Result<T, RuntimeFault>;

/// Machine state observed when a call reaches its return sentinel.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExitState {
    pub(crate) value: i32,
    pub(crate) depth: usize,
    pub(crate) program_stack: u32,
    pub(crate) pc: u32,
}

/// A loaded program: its image, its sandbox, and an optional native routine.
pub struct Instance {
    name: String,
    image: Rc<BytecodeImage>,
    memory: SandboxMemory,
    program_stack: u32,
    stack_bottom: u32,
    stack_limit: u32,
    syscalls: Rc<SyscallTable>,
    native: Option<Rc<jit_native::NativeRoutine>>,
    budget: Option<u64>,
    break_count: u64,
    call_count: u64,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("instructions", &self.image.instruction_count())
            .field("memory", &self.memory)
            .field("program_stack", &self.program_stack)
            .field("compiled", &self.native.is_some())
            .finish()
    }
}

impl Instance {
    pub fn new(
        name: impl Into<String>,
        image: BytecodeImage,
        config: &VmConfig,
        syscalls: Rc<SyscallTable>,
    ) -> Result<Self, LoadError> {
        let stack_size = config.stack_size.max(MIN_STACK_SIZE) & !3;
        let memory = SandboxMemory::for_image(&image, stack_size, config.max_memory)?;
        // the stack starts one past the top of the region and grows down
        let top = memory.mask().wrapping_add(1);
        Ok(Self {
            name: name.into(),
            image: Rc::new(image),
            memory,
            program_stack: top,
            stack_bottom: top - stack_size,
            stack_limit: top - 4,
            syscalls,
            native: None,
            budget: config.instruction_budget,
            break_count: 0,
            call_count: 0,
        })
    }

    /// Translates the image to native code for the host architecture.
    pub fn compile(&mut self, config: &VmConfig) -> Result<(), CompileError> {
        let routine = jit_native::NativeRoutine::compile(
            &self.image,
            self.memory.mask(),
            self.stack_bottom,
            self.stack_limit,
            config.jit_max_code_bytes,
        )?;
        self.native = Some(Rc::new(routine));
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &BytecodeImage {
        &self.image
    }

    pub fn memory(&self) -> &SandboxMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SandboxMemory {
        &mut self.memory
    }

    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    pub fn program_stack(&self) -> u32 {
        self.program_stack
    }

    pub fn stack_bottom(&self) -> u32 {
        self.stack_bottom
    }

    pub fn stack_limit(&self) -> u32 {
        self.stack_limit
    }

    pub fn is_compiled(&self) -> bool {
        self.native.is_some()
    }

    pub fn compiled_code(&self) -> Option<&CompiledCode> {
        self.native.as_deref().map(jit_native::NativeRoutine::code)
    }

    pub fn break_count(&self) -> u64 {
        self.break_count
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn set_instruction_budget(&mut self, budget: Option<u64>) {
        self.budget = budget;
    }

    pub(crate) fn restore_program_stack(&mut self, program_stack: u32) {
        self.program_stack = program_stack;
    }

    fn stack_contains(&self, program_stack: u32) -> bool {
        program_stack.wrapping_sub(self.stack_bottom) <= self.stack_limit - self.stack_bottom
    }

    /// Runs one host call starting at `start_pc`. The caller owns nesting
    /// accounting; this builds the entry frame and checks the exit state.
    pub(crate) fn execute(
        &mut self,
        registry: &mut VmRegistry,
        handle: VmHandle,
        start_pc: u32,
        args: &[i32],
    ) -> VmResult<i32> {
        if args.len() > MAX_VMMAIN_ARGS {
            return Err(FaultKind::TooManyArguments(args.len()).into());
        }
        if start_pc >= self.image.instruction_count() {
            return Err(FaultKind::CallOutOfRange(start_pc as i32).into());
        }
        let frame = self.program_stack.wrapping_sub(ENTRY_FRAME_BYTES);
        if !self.stack_contains(frame) {
            return Err(FaultKind::ProgramStackOutOfRange {
                program_stack: frame,
            }
            .into());
        }
        self.memory.write_i32(frame, RETURN_SENTINEL);
        self.memory.write_i32(frame + 4, 0);
        for slot in 0..MAX_VMMAIN_ARGS {
            let value = args.get(slot).copied().unwrap_or(0);
            self.memory.write_i32(frame + 8 + 4 * slot as u32, value);
        }

        let saved = self.program_stack;
        let outcome = match self.native.clone() {
            Some(routine) => routine.run(self, registry, handle, start_pc, frame),
            None => interpreter::run(self, registry, handle, start_pc, frame),
        };
        self.program_stack = saved;

        let exit = outcome?;
        if exit.depth != 1 {
            return Err(RuntimeFault::new(
                FaultKind::OpStackImbalance { depth: exit.depth },
                Some(exit.pc),
            ));
        }
        if exit.program_stack != frame {
            return Err(RuntimeFault::new(
                FaultKind::ProgramStackCorrupted,
                Some(exit.pc),
            ));
        }
        self.call_count += 1;
        Ok(exit.value)
    }
}
