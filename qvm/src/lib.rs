pub mod assembler;
pub mod bytecode;
pub mod config;
pub mod diagnostics;
pub mod jit;
pub mod registry;
pub mod traps;
pub mod vm;
pub mod wire;

pub use assembler::{
    AsmParseError, Assembler, AssemblerError, BytecodeBuilder, DataSection, assemble,
};
pub use bytecode::{Instruction, OpCode, OperandKind};
pub use config::{ConfigError, ExecutionMode, VmConfig};
pub use diagnostics::{render_fault, render_load_error};
pub use jit::{Arch, CompileError, CompiledCode, host_arch, native_jit_supported};
pub use registry::{RegistryError, VmHandle, VmRegistry};
pub use traps::install_shared_traps;
pub use vm::{
    FaultKind, Instance, RuntimeFault, SandboxMemory, SyscallArgs, SyscallContext,
    SyscallHandler, SyscallTable, VmResult, float_to_word, word_to_float,
};
pub use wire::{
    BytecodeImage, ImageParts, LoadError, decode_image, disassemble_bytes, disassemble_image,
    encode_image,
};
