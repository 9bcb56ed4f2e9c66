#![allow(dead_code, unused_imports)]

use std::cell::RefCell;
use std::rc::Rc;

pub use qvm::{
    Assembler, BytecodeBuilder, BytecodeImage, DataSection, ExecutionMode, FaultKind, LoadError,
    OpCode, RuntimeFault, SyscallArgs, SyscallContext, SyscallTable, VmConfig, VmHandle,
    VmRegistry, VmResult, assemble, decode_image, encode_image, float_to_word,
    install_shared_traps, native_jit_supported, word_to_float,
};

/// Every execution mode this host can run. Compiled mode is skipped where
/// no native emitter exists.
pub fn modes() -> Vec<ExecutionMode> {
    let mut modes = vec![ExecutionMode::Interpreted];
    if native_jit_supported() {
        modes.push(ExecutionMode::Compiled);
    }
    modes
}

pub fn config(mode: ExecutionMode) -> VmConfig {
    VmConfig {
        mode,
        ..VmConfig::default()
    }
}

pub fn load(registry: &mut VmRegistry, source: &str, syscalls: Rc<SyscallTable>) -> VmHandle {
    let image = assemble(source).expect("assemble should succeed");
    let handle = registry
        .load_image("test", image, syscalls)
        .expect("load should succeed");
    if registry.config().mode == ExecutionMode::Compiled {
        let instance = registry.instance(handle).expect("instance");
        assert!(instance.is_compiled(), "expected native code for {source}");
    }
    handle
}

/// Assembles `source`, loads it with no syscalls and makes one call.
pub fn run(mode: ExecutionMode, source: &str, args: &[i32]) -> VmResult<i32> {
    run_with(config(mode), source, SyscallTable::new(), args)
}

pub fn run_with(
    config: VmConfig,
    source: &str,
    syscalls: SyscallTable,
    args: &[i32],
) -> VmResult<i32> {
    let mut registry = VmRegistry::new(config);
    let handle = load(&mut registry, source, syscalls.into_shared());
    registry.call(handle, args)
}

pub type CallLog = Rc<RefCell<Vec<(u32, Vec<i32>)>>>;

/// Registers `ids` as handlers that record their first two arguments and
/// return their sum.
pub fn recording_table(ids: &[u32]) -> (SyscallTable, CallLog) {
    let log: CallLog = Rc::new(RefCell::new(Vec::new()));
    let mut table = SyscallTable::new();
    for id in ids {
        let log = Rc::clone(&log);
        table.register(*id, format!("record{id}"), move |_, args| {
            let words = vec![args.arg(0), args.arg(1)];
            let sum = words[0].wrapping_add(words[1]);
            log.borrow_mut().push((args.id(), words));
            Ok(sum)
        });
    }
    (table, log)
}

/// A routine that returns its first argument plus `add`.
pub fn echo_source(add: i32) -> String {
    format!(
        "\
.code
.label main
    enter 8
    local 16
    load4
    const {add}
    add
    leave 8
"
    )
}
