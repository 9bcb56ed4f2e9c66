mod common;

use qvm::{disassemble_bytes, render_load_error};

use common::*;

/// `enter 8; const 7; leave 8`: fifteen bytes of code.
fn seven() -> BytecodeBuilder {
    let mut builder = BytecodeBuilder::default();
    builder
        .instruction(OpCode::Enter, 8)
        .instruction(OpCode::Const, 7)
        .instruction(OpCode::Leave, 8);
    builder
}

#[test]
fn minimal_image_loads_and_runs() {
    let bytes = seven().finish();
    let image = decode_image(&bytes).expect("decode");
    assert_eq!(image.version(), 1);
    assert_eq!(image.instruction_count(), 3);
    assert_eq!(image.code_length(), 15);
    assert_eq!(image.instruction_offsets(), &[0, 5, 10]);

    for mode in modes() {
        let mut registry = VmRegistry::new(config(mode));
        let handle = registry
            .load("seven", &bytes, SyscallTable::new().into_shared())
            .expect("load");
        assert_eq!(registry.call(handle, &[]).expect("call"), 7);
    }
}

#[test]
fn header_fields_are_checked() {
    let err = decode_image(&seven().magic(0xdead_beef).finish()).expect_err("magic");
    assert_eq!(err, LoadError::BadMagic(0xdead_beef));

    let err = decode_image(&seven().version(3).finish()).expect_err("version");
    assert_eq!(err, LoadError::VersionMismatch { found: 3 });

    let bytes = seven().finish();
    let err = decode_image(&bytes[..10]).expect_err("short header");
    assert!(
        matches!(err, LoadError::TruncatedSection { section: "header", .. }),
        "{err}"
    );
}

#[test]
fn sections_must_fit_the_file() {
    let bytes = seven().data(&[1, 2, 3, 4]).finish();
    let err = decode_image(&bytes[..bytes.len() - 2]).expect_err("truncated data");
    assert_eq!(
        err,
        LoadError::TruncatedSection {
            section: "data",
            offset: 32 + 15,
            length: 4,
            available: 2,
        }
    );

    let mut bytes = seven().finish();
    bytes.push(0);
    assert_eq!(
        decode_image(&bytes).expect_err("trailing"),
        LoadError::TrailingBytes { count: 1 }
    );
}

#[test]
fn instruction_count_must_match_the_code() {
    let err = decode_image(&seven().declared_count(20).finish()).expect_err("too many");
    assert!(matches!(err, LoadError::CodeSizeMismatch { consumed: 0, .. }), "{err}");

    let err = decode_image(&seven().declared_count(4).finish()).expect_err("runs off");
    assert!(matches!(err, LoadError::CodeSizeMismatch { consumed: 15, .. }), "{err}");

    let err = decode_image(&seven().declared_count(2).finish()).expect_err("leftover");
    assert!(matches!(err, LoadError::CodeSizeMismatch { consumed: 10, .. }), "{err}");
}

#[test]
fn code_padding_is_limited_to_three_bytes() {
    let image = decode_image(&seven().padding(3).finish()).expect("padded");
    assert_eq!(image.code_length(), 18);
    assert_eq!(image.instruction_count(), 3);

    let err = decode_image(&seven().padding(4).finish()).expect_err("too much padding");
    assert!(matches!(err, LoadError::CodeSizeMismatch { .. }), "{err}");
}

#[test]
fn unknown_opcodes_are_rejected_with_their_position() {
    let mut builder = BytecodeBuilder::default();
    builder
        .instruction(OpCode::Enter, 8)
        .raw_instruction(&[60])
        .instruction(OpCode::Leave, 8);
    assert_eq!(
        decode_image(&builder.finish()).expect_err("opcode 60"),
        LoadError::InvalidOpcode {
            instruction: 1,
            offset: 5,
            opcode: 60,
        }
    );
}

#[test]
fn entry_must_name_an_instruction() {
    assert_eq!(
        decode_image(&seven().entry(3).finish()).expect_err("entry"),
        LoadError::InvalidEntry {
            entry: 3,
            instruction_count: 3,
        }
    );
    decode_image(&seven().entry(2).finish()).expect("last instruction is a valid entry");
}

#[test]
fn static_targets_are_validated() {
    let mut branch = BytecodeBuilder::default();
    branch
        .instruction(OpCode::Enter, 8)
        .instruction(OpCode::Const, 1)
        .instruction(OpCode::Const, 1)
        .instruction(OpCode::Eq, 50)
        .instruction(OpCode::Leave, 8);
    assert_eq!(
        decode_image(&branch.finish()).expect_err("branch"),
        LoadError::InvalidJumpTarget {
            source: Some(3),
            target: 50,
        }
    );

    let mut jump = BytecodeBuilder::default();
    jump.instruction(OpCode::Const, -5).op(OpCode::Jump);
    assert_eq!(
        decode_image(&jump.finish()).expect_err("negative jump"),
        LoadError::InvalidJumpTarget {
            source: Some(0),
            target: -5,
        }
    );

    let mut call = BytecodeBuilder::default();
    call.instruction(OpCode::Const, 99).op(OpCode::Call);
    assert!(decode_image(&call.finish()).is_err());

    // negative call targets are syscalls
    let mut trap = BytecodeBuilder::default();
    trap.instruction(OpCode::Enter, 8)
        .instruction(OpCode::Const, -4)
        .op(OpCode::Call)
        .instruction(OpCode::Leave, 8);
    decode_image(&trap.finish()).expect("trap");
}

#[test]
fn jump_tables_need_version_two() {
    let image = decode_image(&seven().version(2).jump_targets(&[0, 2]).finish())
        .expect("v2 table");
    assert_eq!(image.jump_targets(), &[0, 2]);

    let err = decode_image(&seven().version(2).jump_targets(&[1, 9]).finish())
        .expect_err("target past the end");
    assert_eq!(
        err,
        LoadError::InvalidJumpTarget {
            source: None,
            target: 9,
        }
    );

    // v1 files carry no table, so the builder drops it
    let image = decode_image(&seven().jump_targets(&[1]).finish()).expect("v1");
    assert!(image.jump_targets().is_empty());
}

#[test]
fn reencoding_preserves_bytes() {
    let v1 = seven().padding(2).data(&[1, 0, 0, 0]).lit(b"hi\0").bss(64).finish();
    let v2 = seven().version(2).jump_targets(&[1]).entry(1).finish();
    for bytes in [v1, v2] {
        let image = decode_image(&bytes).expect("decode");
        assert_eq!(encode_image(&image), bytes);
    }
}

#[test]
fn assembled_images_survive_the_wire() {
    let image = assemble(&echo_source(3)).expect("assemble");
    let decoded = decode_image(&encode_image(&image)).expect("decode");
    assert_eq!(decoded.instructions(), image.instructions());
    assert_eq!(decoded.entry(), image.entry());
}

#[test]
fn disassembly_annotates_traps_and_entry() {
    let mut builder = BytecodeBuilder::default();
    builder
        .instruction(OpCode::Enter, 8)
        .instruction(OpCode::Const, -4)
        .op(OpCode::Call)
        .instruction(OpCode::Leave, 8);
    let text = disassemble_bytes(&builder.finish()).expect("disassemble");
    assert!(text.starts_with("image v1 (4 instructions"), "{text}");
    assert!(text.contains("; trap 3"), "{text}");
    assert!(text.contains(">0000"), "{text}");

    let err = disassemble_bytes(b"QVM?").expect_err("short");
    assert!(render_load_error(&err).starts_with("load error:"));
}
