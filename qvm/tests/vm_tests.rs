mod common;

use common::*;

/// Wraps `body` in a frame with no locals. The first body instruction is
/// at pc 1.
fn wrap(body: &str) -> String {
    format!(".code\nenter 8\n{body}\nleave 8\n")
}

fn fault_of(result: VmResult<i32>) -> RuntimeFault {
    result.expect_err("call should fault")
}

#[test]
fn arithmetic_returns_top_of_stack() {
    for mode in modes() {
        let value = run(mode, &wrap("const 2\nconst 3\nadd\nconst 4\nmuli"), &[0])
            .expect("call should succeed");
        assert_eq!(value, 20, "{mode:?}");
    }
}

#[test]
fn integer_operations_match_two_complement_semantics() {
    let cases: &[(&str, i32)] = &[
        ("const 0xff\nsex8", -1),
        ("const 0x8000\nsex16", -32768),
        ("const -16\nconst 2\nrshi", -4),
        ("const -16\nconst 28\nrshu", 15),
        ("const 1\nconst 33\nlsh", 2),
        ("const 0xffffffff\nconst 2\ndivu", 0x7fff_ffff),
        ("const -7\nconst 3\nmodi", -1),
        ("const -7\nconst 3\nmodu", (-7i32 as u32 % 3) as i32),
        ("const 0x80000000\nconst -1\ndivi", i32::MIN),
        ("const 0x80000000\nconst -1\nmodi", 0),
        ("const 12\nconst 10\nband", 8),
        ("const 12\nconst 10\nbor", 14),
        ("const 12\nconst 10\nbxor", 6),
        ("const 0\nbcom", -1),
        ("const 5\nnegi", -5),
        ("const 7\nconst 9\nsub", -2),
        ("const 0x10000\nconst 0x10000\nmulu", 0),
    ];
    for mode in modes() {
        for (body, expected) in cases {
            let value = run(mode, &wrap(body), &[0]).expect("call should succeed");
            assert_eq!(value, *expected, "{mode:?}: {body}");
        }
    }
}

#[test]
fn float_operations_use_ieee_single_precision() {
    let cases: &[(&str, i32)] = &[
        ("const 1.5\nconst 2.0\nmulf\ncvfi", 3),
        ("const 7.0\nconst 2.0\ndivf\ncvfi", 3),
        ("const 0.25\nconst 0.5\naddf\nconst 4.0\nmulf\ncvfi", 3),
        ("const 1.0\nconst 3.5\nsubf\ncvfi", -2),
        ("const -7\ncvif\nnegf\ncvfi", 7),
        ("const -2147483648.0\ncvfi", i32::MIN),
    ];
    for mode in modes() {
        for (body, expected) in cases {
            let value = run(mode, &wrap(body), &[0]).expect("call should succeed");
            assert_eq!(value, *expected, "{mode:?}: {body}");
        }
    }
}

#[test]
fn cvfi_out_of_range_faults() {
    for mode in modes() {
        for body in ["const 3e9\ncvfi", "const 0x7fc00000\ncvfi", "const 2147483648.0\ncvfi"] {
            let fault = fault_of(run(mode, &wrap(body), &[0]));
            assert_eq!(fault.kind, FaultKind::BadFloatOp, "{mode:?}: {body}");
            assert_eq!(fault.pc, Some(2));
        }
    }
}

#[test]
fn divide_by_zero_faults_at_the_divide() {
    for mode in modes() {
        for op in ["divi", "divu", "modi", "modu"] {
            let fault = fault_of(run(mode, &wrap(&format!("const 1\nconst 0\n{op}")), &[0]));
            assert_eq!(fault.kind, FaultKind::DivideByZero, "{mode:?}: {op}");
            assert_eq!(fault.pc, Some(3));
        }
    }
}

#[test]
fn entry_frame_carries_every_argument() {
    // argument i lives at frame size + 8 + 4 * i
    let source = wrap("local 64\nload4\nlocal 16\nload4\nadd");
    let args: Vec<i32> = (100..113).collect();
    for mode in modes() {
        let value = run(mode, &source, &args).expect("call should succeed");
        assert_eq!(value, 100 + 112, "{mode:?}");
    }
}

#[test]
fn missing_arguments_read_as_zero() {
    for mode in modes() {
        let value = run(mode, &wrap("local 20\nload4"), &[5]).expect("call should succeed");
        assert_eq!(value, 0, "{mode:?}");
    }
}

#[test]
fn too_many_arguments_are_rejected() {
    for mode in modes() {
        let args = [0; 14];
        let fault = fault_of(run(mode, &wrap("const 0"), &args));
        assert_eq!(fault.kind, FaultKind::TooManyArguments(14));
        assert_eq!(fault.pc, None);
    }
}

#[test]
fn guest_calls_pass_arguments_and_return() {
    let source = "\
.code
.label main
    enter 16
    local 24
    load4
    arg 8
    call double
    const 1
    add
    leave 16
.label double
    enter 8
    local 16
    load4
    const 2
    muli
    leave 8
";
    for mode in modes() {
        let value = run(mode, source, &[21]).expect("call should succeed");
        assert_eq!(value, 43, "{mode:?}");
    }
}

#[test]
fn recursion_uses_the_program_stack() {
    // fact(n) = n <= 1 ? 1 : n * fact(n - 1)
    let source = "\
.code
.label fact
    enter 16
    local 24
    load4
    const 1
    gti recurse
    const 1
    leave 16
.label recurse
    local 24
    load4
    const 1
    sub
    arg 8
    call fact
    local 24
    load4
    muli
    leave 16
";
    for mode in modes() {
        let value = run(mode, source, &[10]).expect("call should succeed");
        assert_eq!(value, 3_628_800, "{mode:?}");
    }
}

#[test]
fn counted_loop_sums_with_frame_locals() {
    let source = "\
.code
.label main
    enter 16
    local 8
    const 1
    store4
    local 12
    const 0
    store4
.label loop
    local 12
    local 12
    load4
    local 8
    load4
    add
    store4
    local 8
    local 8
    load4
    const 1
    add
    store4
    local 8
    load4
    const 10
    lei loop
    local 12
    load4
    leave 16
";
    for mode in modes() {
        let value = run(mode, source, &[0]).expect("call should succeed");
        assert_eq!(value, 55, "{mode:?}");
    }
}

#[test]
fn branches_compare_second_against_top() {
    let cases: &[(&str, i32)] = &[
        ("const -1\nconst 1\ngtu", 1),
        ("const -1\nconst 1\ngti", 0),
        ("const 3\nconst 3\neq", 1),
        ("const 3\nconst 4\nne", 1),
        ("const 2\nconst 3\nlti", 1),
        ("const 3\nconst 3\nlei", 1),
        ("const 3\nconst 3\ngei", 1),
        ("const 0\nconst -1\nltu", 1),
        ("const 5\nconst 5\nleu", 1),
        ("const 4\nconst 5\ngeu", 0),
        ("const 0x7fc00000\nconst 0x7fc00000\neqf", 0),
        ("const 0x7fc00000\nconst 1.0\nnef", 1),
        ("const 0x7fc00000\nconst 1.0\nltf", 0),
        ("const 1.0\nconst 0x7fc00000\ngef", 0),
        ("const 1.0\nconst 1.0\nlef", 1),
        ("const -1.0\nconst 1.0\nltf", 1),
        ("const 2.0\nconst 1.0\ngtf", 1),
        ("const 0.0\nconst -0.0\neqf", 1),
    ];
    for mode in modes() {
        for (compare, expected) in cases {
            let source = format!(
                ".code\nenter 8\n{compare} taken\nconst 0\nleave 8\n.label taken\nconst 1\nleave 8\n"
            );
            let value = run(mode, &source, &[0]).expect("call should succeed");
            assert_eq!(value, *expected, "{mode:?}: {compare}");
        }
    }
}

#[test]
fn addresses_are_masked_into_the_sandbox() {
    let source = wrap("const 0x40000040\nconst 1234\nstore4\nconst 0x40\nload4");
    for mode in modes() {
        let value = run(mode, &source, &[0]).expect("call should succeed");
        assert_eq!(value, 1234, "{mode:?}");
    }
}

#[test]
fn narrow_loads_and_stores_touch_only_their_bytes() {
    let source = wrap(
        "const 0x80\nconst 0x11223344\nstore4\n\
         const 0x81\nconst 0xaabb\nstore2\n\
         const 0x83\nconst 0xcc\nstore1\n\
         const 0x80\nload4",
    );
    for mode in modes() {
        let value = run(mode, &source, &[0]).expect("call should succeed");
        assert_eq!(value as u32, 0xccaa_bb44, "{mode:?}");
    }
}

#[test]
fn word_access_at_the_top_of_the_sandbox_round_trips() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let probe = load(&mut registry, &wrap("const 0"), SyscallTable::new().into_shared());
        let mask = registry
            .instance(probe)
            .expect("instance")
            .memory()
            .mask();
        registry.unload(probe).expect("unload");

        let top = mask - 1;
        let source = wrap(&format!(
            "const {top}\nconst 0x11223344\nstore4\nconst {top}\nload4\nconst {top}\nload1\nadd"
        ));
        let handle = load(&mut registry, &source, SyscallTable::new().into_shared());
        let value = registry.call(handle, &[0]).expect("call should succeed");
        assert_eq!(value, 0x1122_3344 + 0x44, "{mode:?}");
    }
}

#[test]
fn block_copy_moves_section_bytes() {
    let source = "\
.lit
.label text
.string \"hello\"
.bss
.label buffer
.space 16
.code
    enter 8
    const buffer
    const text
    block_copy 6
    const buffer
    const 4
    add
    load1
    leave 8
";
    for mode in modes() {
        let value = run(mode, source, &[0]).expect("call should succeed");
        assert_eq!(value, b'o' as i32, "{mode:?}");
    }
}

#[test]
fn block_copy_outside_the_sandbox_faults() {
    for mode in modes() {
        let fault = fault_of(run(
            mode,
            &wrap("const 0x7ffffff0\nconst 0\nblock_copy 32"),
            &[0],
        ));
        assert_eq!(
            fault.kind,
            FaultKind::BlockCopyOutOfRange {
                dest: 0x7fff_fff0,
                src: 0,
                len: 32
            },
            "{mode:?}"
        );
        assert_eq!(fault.pc, Some(3));
    }
}

#[test]
fn computed_transfers_are_checked_at_runtime() {
    for mode in modes() {
        let fault = fault_of(run(mode, &wrap("local 16\nload4\njump"), &[9999]));
        assert_eq!(fault.kind, FaultKind::JumpOutOfRange(9999), "{mode:?}");
        assert_eq!(fault.pc, Some(3));

        let fault = fault_of(run(mode, &wrap("local 16\nload4\ncall"), &[9999]));
        assert_eq!(fault.kind, FaultKind::CallOutOfRange(9999), "{mode:?}");
        assert_eq!(fault.pc, Some(3));

        let fault = fault_of(run(mode, &wrap("local 16\nload4\njump"), &[-5]));
        assert_eq!(fault.kind, FaultKind::JumpOutOfRange(-5), "{mode:?}");
    }
}

#[test]
fn computed_jump_through_a_table() {
    let source = "\
.data
.label table
.word first second
.code
.target first second
.label main
    enter 8
    const table
    local 16
    load4
    const 2
    lsh
    add
    load4
    jump
.label first
    const 10
    leave 8
.label second
    const 20
    leave 8
";
    for mode in modes() {
        assert_eq!(run(mode, source, &[0]).expect("first"), 10, "{mode:?}");
        assert_eq!(run(mode, source, &[1]).expect("second"), 20, "{mode:?}");
    }
}

#[test]
fn static_jump_out_of_range_is_rejected_at_load() {
    let mut asm = Assembler::new();
    asm.emit(OpCode::Const, 9999);
    asm.op(OpCode::Jump);
    assert!(matches!(
        asm.finish(),
        Err(qvm::AssemblerError::Load(LoadError::InvalidJumpTarget {
            source: Some(0),
            target: 9999
        }))
    ));
}

#[test]
fn instruction_budget_counts_control_transfers() {
    let source = "\
.code
    enter 8
    jump a
.label a
    jump b
.label b
    const 7
    leave 8
";
    for mode in modes() {
        let budgeted = |budget| VmConfig {
            instruction_budget: Some(budget),
            ..config(mode)
        };
        let value = run_with(budgeted(3), source, SyscallTable::new(), &[0]).expect("enough");
        assert_eq!(value, 7, "{mode:?}");

        // the final leave is charged too
        let fault = fault_of(run_with(budgeted(2), source, SyscallTable::new(), &[0]));
        assert_eq!(fault.kind, FaultKind::BudgetExhausted, "{mode:?}");
        assert_eq!(fault.pc, Some(6));

        let fault = fault_of(run_with(budgeted(1), source, SyscallTable::new(), &[0]));
        assert_eq!(fault.kind, FaultKind::BudgetExhausted, "{mode:?}");
        assert_eq!(fault.pc, Some(4));

        let fault = fault_of(run_with(budgeted(0), source, SyscallTable::new(), &[0]));
        assert_eq!(fault.pc, Some(2), "{mode:?}");
    }
}

#[test]
fn budget_stops_an_infinite_loop() {
    let source = ".code\nenter 8\n.label spin\njump spin\n";
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let handle = load(&mut registry, source, SyscallTable::new().into_shared());
        registry
            .instance_mut(handle)
            .expect("instance")
            .set_instruction_budget(Some(10_000));
        let fault = fault_of(registry.call(handle, &[0]));
        assert_eq!(fault.kind, FaultKind::BudgetExhausted, "{mode:?}");
        assert_eq!(fault.pc, Some(2));
    }
}

#[test]
fn budget_stops_a_loop_built_from_leave() {
    // leave 0 returns through the address stored at the frame base, which
    // points back at the top of the loop
    let source = "\
.code
    enter 8
    local 0
    const 4
    store4
    leave 0
    const 0
    leave 8
";
    for mode in modes() {
        let budgeted = VmConfig {
            instruction_budget: Some(1000),
            ..config(mode)
        };
        let fault = fault_of(run_with(budgeted, source, SyscallTable::new(), &[0]));
        assert_eq!(fault.kind, FaultKind::BudgetExhausted, "{mode:?}");
        assert_eq!(fault.pc, Some(4));
    }
}

#[test]
fn break_instructions_are_counted() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let handle = load(
            &mut registry,
            &wrap("break\nbreak\nconst 0"),
            SyscallTable::new().into_shared(),
        );
        registry.call(handle, &[0]).expect("first call");
        registry.call(handle, &[0]).expect("second call");
        let instance = registry.instance(handle).expect("instance");
        assert_eq!(instance.break_count(), 4, "{mode:?}");
        assert_eq!(instance.call_count(), 2);
    }
}

#[test]
fn exit_requires_exactly_one_operand() {
    for mode in modes() {
        let fault = fault_of(run(mode, &wrap("const 1\nconst 2"), &[0]));
        assert_eq!(fault.kind, FaultKind::OpStackImbalance { depth: 2 }, "{mode:?}");
        assert_eq!(fault.pc, Some(3));

        let fault = fault_of(run(mode, &wrap(""), &[0]));
        assert_eq!(fault.kind, FaultKind::OpStackImbalance { depth: 0 }, "{mode:?}");
        assert_eq!(fault.pc, Some(1));
    }
}

#[test]
fn exit_with_a_moved_frame_is_detected() {
    // plant the sentinel one word lower and leave with a short frame
    let source = "\
.code
    enter 16
    local 8
    const -1
    store4
    const 0
    leave 8
";
    for mode in modes() {
        let fault = fault_of(run(mode, source, &[0]));
        assert_eq!(fault.kind, FaultKind::ProgramStackCorrupted, "{mode:?}");
        assert_eq!(fault.pc, Some(5));
    }
}

#[test]
fn corrupted_return_address_faults() {
    let source = wrap("local 8\nconst 5000\nstore4\nconst 0");
    for mode in modes() {
        let fault = fault_of(run(mode, &source, &[0]));
        assert_eq!(fault.kind, FaultKind::ReturnOutOfRange(5000), "{mode:?}");
        assert_eq!(fault.pc, Some(5));
    }
}

#[test]
fn operand_stack_limits_are_enforced() {
    for mode in modes() {
        let fault = fault_of(run(mode, &wrap("add"), &[0]));
        assert_eq!(fault.kind, FaultKind::OpStackUnderflow, "{mode:?}");
        assert_eq!(fault.pc, Some(1));

        let mut asm = Assembler::new();
        asm.emit(OpCode::Enter, 8);
        for _ in 0..257 {
            asm.op(OpCode::Push);
        }
        asm.emit(OpCode::Leave, 8);
        let mut registry = VmRegistry::new(config(mode));
        let handle = registry
            .load_image("overflow", asm.finish().expect("image"), SyscallTable::new().into_shared())
            .expect("load");
        let fault = fault_of(registry.call(handle, &[0]));
        assert_eq!(fault.kind, FaultKind::OpStackOverflow, "{mode:?}");
        assert_eq!(fault.pc, Some(257));
    }
}

#[test]
fn frames_must_stay_inside_the_stack() {
    for mode in modes() {
        let fault = fault_of(run(mode, ".code\nenter 0x100000\nconst 0\nleave 0x100000", &[0]));
        assert!(
            matches!(fault.kind, FaultKind::ProgramStackOutOfRange { .. }),
            "{mode:?}: {fault}"
        );
        assert_eq!(fault.pc, Some(0));
    }
}

#[test]
fn undef_and_running_off_the_end_fault() {
    for mode in modes() {
        let fault = fault_of(run(mode, &wrap("undef"), &[0]));
        assert_eq!(fault.kind, FaultKind::InvalidOpcode(0), "{mode:?}");
        assert_eq!(fault.pc, Some(1));

        let fault = fault_of(run(mode, ".code\nenter 8\nconst 1", &[0]));
        assert_eq!(fault.kind, FaultKind::PcOutOfRange, "{mode:?}");
        assert_eq!(fault.pc, Some(2));
    }
}

#[test]
fn program_stack_is_restored_after_calls_and_faults() {
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let ok = load(&mut registry, &echo_source(1), SyscallTable::new().into_shared());
        let initial = registry.instance(ok).expect("instance").program_stack();
        assert_eq!(registry.call(ok, &[41]).expect("call"), 42);
        assert_eq!(
            registry.instance(ok).expect("instance").program_stack(),
            initial,
            "{mode:?}"
        );

        let bad = load(&mut registry, &wrap("const 1\nconst 0\ndivi"), SyscallTable::new().into_shared());
        let initial = registry.instance(bad).expect("instance").program_stack();
        assert!(registry.call(bad, &[0]).is_err());
        assert_eq!(
            registry.instance(bad).expect("instance").program_stack(),
            initial
        );
        assert_eq!(registry.depth(), 0);
    }
}

#[test]
fn call_routine_starts_at_the_given_instruction() {
    let source = "\
.code
.entry main
.label other
    enter 8
    const 99
    leave 8
.label main
    enter 8
    const 1
    leave 8
";
    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let handle = load(&mut registry, source, SyscallTable::new().into_shared());
        assert_eq!(registry.call(handle, &[0]).expect("entry"), 1, "{mode:?}");
        assert_eq!(registry.call_routine(handle, 0, &[0]).expect("routine"), 99);
        let fault = fault_of(registry.call_routine(handle, 100, &[0]));
        assert_eq!(fault.kind, FaultKind::CallOutOfRange(100));
    }
}
