mod common;

use std::panic::{AssertUnwindSafe, catch_unwind};

use qvm::RegistryError;

use common::*;

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

/// Bumps a data-section counter and returns the new value.
const COUNTER: &str = "\
.data
.label count
.word 0
.code
    enter 8
    const count
    const count
    load4
    const 1
    add
    store4
    const count
    load4
    leave 8
";

fn empty() -> std::rc::Rc<SyscallTable> {
    SyscallTable::new().into_shared()
}

#[test]
fn handles_of_unloaded_instances_are_reused() {
    let mut registry = VmRegistry::new(config(ExecutionMode::Interpreted));
    let a = load(&mut registry, &echo_source(1), empty());
    let b = load(&mut registry, &echo_source(2), empty());
    assert_ne!(a, b);
    assert_eq!(registry.handles(), vec![a, b]);

    registry.unload(a).expect("unload");
    assert_eq!(registry.handles(), vec![b]);
    let c = load(&mut registry, &echo_source(3), empty());
    assert_eq!(c, a);
    assert_eq!(registry.call(c, &[1]).expect("call"), 4);
    assert_eq!(registry.call(b, &[1]).expect("call"), 3);
}

#[test]
fn stale_handles_are_rejected() {
    let mut registry = VmRegistry::new(config(ExecutionMode::Interpreted));
    let handle = load(&mut registry, &echo_source(0), empty());
    registry.unload(handle).expect("first unload");
    assert_eq!(
        registry.unload(handle),
        Err(RegistryError::InvalidHandle(handle))
    );
    let missing = VmHandle::from_raw(17);
    assert_eq!(
        registry.unload(missing),
        Err(RegistryError::InvalidHandle(missing))
    );

    let fault = registry.call(handle, &[0]).expect_err("vacant slot");
    assert_eq!(fault.kind, FaultKind::InvalidHandle);
    let fault = registry.call(missing, &[0]).expect_err("unknown slot");
    assert_eq!(fault.kind, FaultKind::InvalidHandle);
    assert!(registry.instance(handle).is_none());
}

#[test]
fn nesting_limit_bounds_reentrant_calls() {
    for mode in modes() {
        let mut table = SyscallTable::new();
        table.register(1, "reenter", |ctx, args| {
            let handle = ctx.handle();
            ctx.call(handle, &[args.arg(0) - 1])
        });
        let mut registry = VmRegistry::new(VmConfig {
            max_nesting: 3,
            ..config(mode)
        });
        let handle = load(&mut registry, SELF_CALL, table.into_shared());

        assert_eq!(registry.call(handle, &[2]).expect("three levels fit"), 2);
        let fault = registry.call(handle, &[3]).expect_err("fourth level");
        assert_eq!(fault.kind, FaultKind::NestingTooDeep { limit: 3 }, "{mode:?}");
        assert_eq!(registry.depth(), 0);
        assert_eq!(registry.call(handle, &[1]).expect("recovers"), 1);
    }
}

/// Returns `n + f(n - 1)`, keeping `n` in a local across the trap.
const RUNNING_SUM: &str = "\
.code
    enter 20
    local 16
    local 28
    load4
    store4
    local 28
    load4
    const 0
    eq done
    local 28
    load4
    arg 8
    trap 1
    local 16
    load4
    add
    leave 20
.label done
    const 0
    leave 20
";

/// Handle 0 forwards to handle 1 and back. The handler panics once the
/// chain is `panic_depth` calls deep.
fn ping_pong_table(panic_depth: usize) -> std::rc::Rc<SyscallTable> {
    let mut table = SyscallTable::new();
    table.register(1, "peer", move |ctx, args| {
        let peer = VmHandle::from_raw(1 - ctx.handle().raw());
        if ctx.depth() == panic_depth {
            panic!("peer gave up");
        }
        ctx.call(peer, &[args.arg(0) - 1])
    });
    table.into_shared()
}

#[test]
fn instances_suspended_up_the_chain_can_be_reentered() {
    let table = ping_pong_table(usize::MAX);
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let a = load(&mut registry, SELF_CALL, table.clone());
        let b = load(&mut registry, SELF_CALL, table.clone());
        assert_eq!((a.raw(), b.raw()), (0, 1));

        // a -> b returns without touching a again
        assert_eq!(registry.call(a, &[1]).expect("a calls b"), 1);
        // a -> b -> a -> b
        assert_eq!(registry.call(a, &[3]).expect("b calls back into a"), 3, "{mode:?}");
        assert_eq!(registry.depth(), 0);
        assert!(!registry.is_running(a));
        assert!(!registry.is_running(b));
        assert_eq!(registry.instance(a).expect("a").call_count(), 3);
        assert_eq!(registry.instance(b).expect("b").call_count(), 3);
    }
}

#[test]
fn reentered_instances_keep_their_parked_frames() {
    let table = ping_pong_table(usize::MAX);
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let a = load(&mut registry, RUNNING_SUM, table.clone());
        let _b = load(&mut registry, RUNNING_SUM, table.clone());
        let initial = registry.instance(a).expect("a").program_stack();

        assert_eq!(registry.call(a, &[2]).expect("a -> b -> a"), 3, "{mode:?}");
        assert_eq!(registry.instance(a).expect("a").program_stack(), initial);
    }
}

#[test]
fn panics_inside_reentered_instances_leave_the_registry_usable() {
    let table = ping_pong_table(3);
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let a = load(&mut registry, SELF_CALL, table.clone());
        let b = load(&mut registry, SELF_CALL, table.clone());
        let initial = registry.instance(a).expect("a").program_stack();

        // a(3) -> b(2) -> a(1) panics in its trap
        let outcome = catch_unwind(AssertUnwindSafe(|| registry.call(a, &[3])));
        assert!(outcome.is_err(), "{mode:?}: panic should propagate");

        assert_eq!(registry.depth(), 0);
        assert!(!registry.is_running(a));
        assert!(!registry.is_running(b));
        assert_eq!(registry.instance(a).expect("a").program_stack(), initial);
        assert_eq!(registry.call(a, &[2]).expect("registry still usable"), 2);
    }
}

#[test]
fn running_instances_cannot_be_unloaded() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let idle = load(&mut registry, &echo_source(0), empty());
        let mut table = SyscallTable::new();
        table.register(1, "unload", move |ctx, _| {
            let own = ctx.handle();
            let mut outcome = 0;
            if ctx.unload(own) == Err(RegistryError::InstanceBusy(own)) {
                outcome += 1;
            }
            if ctx.unload(idle).is_ok() {
                outcome += 10;
            }
            Ok(outcome)
        });
        let source = ".code\n    enter 8\n    trap 1\n    leave 8\n";
        let handle = load(&mut registry, source, table.into_shared());

        assert_eq!(registry.call(handle, &[]).expect("call"), 11, "{mode:?}");
        assert_eq!(registry.handles(), vec![handle]);
    }
}

#[test]
fn failed_native_compilation_falls_back_to_the_interpreter() {
    let mut registry = VmRegistry::new(VmConfig {
        jit_max_code_bytes: 16,
        ..config(ExecutionMode::Compiled)
    });
    let image = assemble(&echo_source(5)).expect("assemble");
    let handle = registry
        .load_image("fallback", image, empty())
        .expect("load should still succeed");
    let instance = registry.instance(handle).expect("instance");
    assert!(!instance.is_compiled());
    assert!(instance.compiled_code().is_none());
    assert_eq!(registry.call(handle, &[1]).expect("call"), 6);
}

#[test]
fn interpreted_mode_never_compiles() {
    let mut registry = VmRegistry::new(config(ExecutionMode::Interpreted));
    let handle = load(&mut registry, &echo_source(0), empty());
    assert!(!registry.instance(handle).expect("instance").is_compiled());
}

#[test]
fn instances_do_not_share_memory() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let a = load(&mut registry, COUNTER, empty());
        let b = load(&mut registry, COUNTER, empty());
        assert_eq!(registry.call(a, &[0]).expect("a"), 1);
        assert_eq!(registry.call(a, &[0]).expect("a"), 2);
        assert_eq!(registry.call(b, &[0]).expect("b"), 1, "{mode:?}");
    }
}

#[test]
fn load_rejects_malformed_bytes_and_oversized_sandboxes() {
    let mut registry = VmRegistry::new(config(ExecutionMode::Interpreted));
    let err = registry
        .load("junk", b"not an image at all", empty())
        .expect_err("bad magic");
    assert!(matches!(err, LoadError::BadMagic(_)));
    assert!(registry.handles().is_empty());

    let mut small = VmRegistry::new(VmConfig {
        max_memory: 0x1000,
        ..config(ExecutionMode::Interpreted)
    });
    let image = assemble(&echo_source(0)).expect("assemble");
    let err = small
        .load_image("big", image, empty())
        .expect_err("stack alone exceeds the memory cap");
    assert!(matches!(err, LoadError::SizeOverflow { .. }));
}

#[test]
fn load_accepts_encoded_images() {
    let mut registry = VmRegistry::default();
    let bytes = encode_image(&assemble(&echo_source(7)).expect("assemble"));
    let handle = registry.load("bytes", &bytes, empty()).expect("load");
    assert_eq!(registry.call(handle, &[1]).expect("call"), 8);
    assert_eq!(registry.instance(handle).expect("instance").name(), "bytes");
}

#[test]
fn shutdown_unloads_everything() {
    let mut registry = VmRegistry::new(config(ExecutionMode::Interpreted));
    load(&mut registry, &echo_source(0), empty());
    load(&mut registry, &echo_source(1), empty());
    assert_eq!(registry.shutdown(), 2);
    assert!(registry.handles().is_empty());
    assert_eq!(registry.shutdown(), 0);
}

#[test]
fn registry_debug_lists_instance_names() {
    let mut registry = VmRegistry::new(config(ExecutionMode::Interpreted));
    registry
        .load_image("alpha", assemble(&echo_source(0)).expect("assemble"), empty())
        .expect("load");
    let rendered = format!("{registry:?}");
    assert!(rendered.contains("alpha"));
    assert_eq!(VmHandle::from_raw(3).to_string(), "vm#3");
}
