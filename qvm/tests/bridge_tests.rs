mod common;

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use common::*;

const TWO_ARG_TRAP: &str = "\
.code
    enter 16
    local 24
    load4
    arg 8
    const 5
    arg 12
    trap 3
    leave 16
";

/// Re-enters its own instance through trap 1 until the argument reaches
/// zero, returning the recursion depth.
const SELF_CALL: &str = "\
.code
    enter 16
    local 24
    load4
    const 0
    eq done
    local 24
    load4
    arg 8
    trap 1
    const 1
    add
    leave 16
.label done
    const 0
    leave 16
";

fn self_call_table() -> SyscallTable {
    let mut table = SyscallTable::new();
    table.register(1, "reenter", |ctx, args| {
        let handle = ctx.handle();
        ctx.call(handle, &[args.arg(0) - 1])
    });
    table
}

#[test]
fn syscalls_receive_arguments_and_push_results() {
    for mode in modes() {
        let (table, log) = recording_table(&[3]);
        let value = run_with(config(mode), TWO_ARG_TRAP, table, &[37]).expect("call should succeed");
        assert_eq!(value, 42, "{mode:?}");
        assert_eq!(log.borrow().as_slice(), &[(3, vec![37, 5])]);
    }
}

#[test]
fn unknown_syscalls_fault_at_the_call() {
    for mode in modes() {
        let fault = run(mode, TWO_ARG_TRAP, &[0]).expect_err("no handler registered");
        assert_eq!(fault.kind, FaultKind::UnknownSyscall(3), "{mode:?}");
        assert_eq!(fault.pc, Some(7));
    }
}

#[test]
fn handler_errors_become_faults() {
    for mode in modes() {
        let mut table = SyscallTable::new();
        table.register(3, "fail", |_, args| {
            Err(RuntimeFault::host(format!("refused {}", args.arg(0))))
        });
        let fault = run_with(config(mode), TWO_ARG_TRAP, table, &[9]).expect_err("handler fails");
        assert_eq!(fault.kind, FaultKind::Host("refused 9".to_string()), "{mode:?}");
        assert_eq!(fault.pc, Some(7));
    }
}

#[test]
fn handlers_translate_guest_pointers() {
    let source = "\
.lit
.label name
.string \"quake\"
.bss
.label out
.space 16
.code
    enter 16
    const name
    arg 8
    const out
    arg 12
    trap 7
    pop
    const out
    const 2
    add
    load1
    leave 16
";
    for mode in modes() {
        let mut table = SyscallTable::new();
        table.register(7, "upcase", |ctx, args| {
            let text = ctx.read_string(args.addr(0))?;
            let upper = text.to_ascii_uppercase();
            ctx.memory_mut().write_cstr(args.addr(1), upper.as_bytes())?;
            Ok(upper.len() as i32)
        });
        let value = run_with(config(mode), source, table, &[0]).expect("call should succeed");
        assert_eq!(value, b'A' as i32, "{mode:?}");
    }
}

#[test]
fn float_arguments_and_results_travel_as_bits() {
    let source = "\
.code
    enter 16
    const 1.25
    arg 8
    trap 4
    cvfi
    leave 16
";
    for mode in modes() {
        let mut table = SyscallTable::new();
        table.register(4, "scale", |_, args| Ok(float_to_word(args.float(0) * 4.0)));
        let value = run_with(config(mode), source, table, &[0]).expect("call should succeed");
        assert_eq!(value, 5, "{mode:?}");
    }
}

#[test]
fn out_of_range_host_pointers_fault() {
    for mode in modes() {
        let mut table = SyscallTable::new();
        table.register(3, "touch", |ctx, args| {
            ctx.memory_mut().slice_mut(args.addr(0), 64)?.fill(1);
            Ok(0)
        });
        let mask = {
            let mut registry = VmRegistry::new(config(mode));
            let handle = load(&mut registry, TWO_ARG_TRAP, SyscallTable::new().into_shared());
            registry.instance(handle).expect("instance").memory().mask()
        };
        let fault = run_with(config(mode), TWO_ARG_TRAP, table, &[(mask - 8) as i32])
            .expect_err("slice crosses the top");
        assert!(
            matches!(fault.kind, FaultKind::HostPointerOutOfRange { len: 64, .. }),
            "{mode:?}: {fault}"
        );
        assert_eq!(fault.pc, Some(7));
    }
}

#[test]
fn syscalls_can_call_other_instances() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let callee = load(&mut registry, &echo_source(100), SyscallTable::new().into_shared());

        let depth_seen = Rc::new(Cell::new(0));
        let mut table = SyscallTable::new();
        let depth = Rc::clone(&depth_seen);
        table.register(3, "forward", move |ctx, args| {
            depth.set(ctx.depth());
            let value = ctx.call(callee, &[args.arg(0)])?;
            Ok(value + args.arg(1))
        });
        let caller = load(&mut registry, TWO_ARG_TRAP, table.into_shared());

        let value = registry.call(caller, &[1]).expect("call should succeed");
        assert_eq!(value, 106, "{mode:?}");
        assert_eq!(depth_seen.get(), 1);
        assert_eq!(registry.depth(), 0);
        assert_eq!(
            registry.instance(callee).expect("callee").call_count(),
            1
        );
    }
}

#[test]
fn syscalls_can_reenter_their_own_instance() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let handle = load(&mut registry, SELF_CALL, self_call_table().into_shared());
        let initial = registry.instance(handle).expect("instance").program_stack();

        let value = registry.call(handle, &[6]).expect("call should succeed");
        assert_eq!(value, 6, "{mode:?}");
        assert_eq!(
            registry.instance(handle).expect("instance").program_stack(),
            initial
        );
        assert_eq!(registry.instance(handle).expect("instance").call_count(), 7);
    }
}

#[test]
fn host_panics_unwind_through_the_registry() {
    for mode in modes() {
        let mut table = SyscallTable::new();
        table.register(3, "volatile", |_, args| {
            if args.arg(0) == 1 {
                panic!("handler exploded");
            }
            Ok(args.arg(0))
        });
        let mut registry = VmRegistry::new(config(mode));
        let handle = load(&mut registry, TWO_ARG_TRAP, table.into_shared());
        let initial = registry.instance(handle).expect("instance").program_stack();

        let outcome = catch_unwind(AssertUnwindSafe(|| registry.call(handle, &[1])));
        assert!(outcome.is_err(), "{mode:?}: panic should propagate");

        assert_eq!(registry.depth(), 0);
        assert!(!registry.is_running(handle));
        assert_eq!(
            registry.instance(handle).expect("instance").program_stack(),
            initial
        );
        assert_eq!(registry.call(handle, &[2]).expect("registry still usable"), 2);
    }
}

#[test]
fn syscall_table_reports_registrations() {
    let (mut table, _) = recording_table(&[3, 1]);
    table.register(9, "late", |_, _| Ok(0));
    assert_eq!(table.len(), 3);
    assert_eq!(table.ids().collect::<Vec<_>>(), vec![1, 3, 9]);
    assert_eq!(table.name(9), Some("late"));
    assert!(table.contains(3));
    assert!(!table.contains(2));

    table.register(9, "replaced", |_, _| Ok(1));
    assert_eq!(table.len(), 3);
    assert_eq!(table.name(9), Some("replaced"));
}

#[test]
fn syscall_args_read_missing_words_as_zero() {
    let args = SyscallArgs::new(12, &[1, -2, float_to_word(0.5)]);
    assert_eq!(args.id(), 12);
    assert_eq!(args.arg(0), 1);
    assert_eq!(args.addr(1), (-2i32) as u32);
    assert_eq!(args.float(2), 0.5);
    assert_eq!(args.arg(3), 0);
    assert_eq!(args.arg(100), 0);
    assert_eq!(word_to_float(float_to_word(-3.5)), -3.5);
}
