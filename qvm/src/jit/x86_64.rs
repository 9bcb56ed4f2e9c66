//! x86-64 code generation.
//!
//! Register assignment inside generated code:
//! `rbx` context, `rbp` instruction address table, `r12` sandbox base,
//! `r13` operand stack, `r14d` operand depth, `r15d` program stack.
//! `rax`, `rcx`, `rdx`, `rsi`, `rdi`, `xmm0` and `xmm1` are scratch.

use std::collections::BTreeMap;

use super::{Arch, CallConv, CodeEmitter, CompileError, CompileLayout, Fixup, ctx_offset, fault_code};
use crate::bytecode::{Instruction, OpCode};
use crate::vm::OP_STACK_SLOTS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn code(self) -> u8 {
        self as u8
    }
}

const XMM0: u8 = 0;
const XMM1: u8 = 1;

#[derive(Clone, Copy)]
struct Mem {
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
}

const fn slot(disp: i32) -> Mem {
    Mem {
        base: Reg::R13,
        index: Some((Reg::R14, 4)),
        disp,
    }
}

/// Top of the operand stack.
const TOP: Mem = slot(-4);
/// Second from the top.
const SEC: Mem = slot(-8);
/// First free slot.
const NEXT: Mem = slot(0);

const fn ctx(disp: i32) -> Mem {
    Mem {
        base: Reg::Rbx,
        index: None,
        disp,
    }
}

const fn data(index: Reg) -> Mem {
    Mem {
        base: Reg::R12,
        index: Some((index, 1)),
        disp: 0,
    }
}

const fn table(index: Reg) -> Mem {
    Mem {
        base: Reg::Rbp,
        index: Some((index, 8)),
        disp: 0,
    }
}

// group-1 ALU extensions for 0x81/0x83
const ALU_ADD: u8 = 0;
const ALU_AND: u8 = 4;
const ALU_SUB: u8 = 5;
const ALU_XOR: u8 = 6;
const ALU_CMP: u8 = 7;

// condition codes
const CC_P: u8 = 0xA;
const CC_B: u8 = 0x2;
const CC_AE: u8 = 0x3;
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;
const CC_BE: u8 = 0x6;
const CC_A: u8 = 0x7;
const CC_NS: u8 = 0x9;
const CC_L: u8 = 0xC;
const CC_GE: u8 = 0xD;
const CC_LE: u8 = 0xE;
const CC_G: u8 = 0xF;

enum HelperArg {
    Eax,
    Imm(i32),
}

pub struct X86_64Emitter {
    layout: CompileLayout,
    code: Vec<u8>,
    /// Jumps to fault stubs, keyed by (fault code, instruction).
    stubs: BTreeMap<(u32, u32), Vec<usize>>,
    exit_refs: Vec<usize>,
}

impl X86_64Emitter {
    pub fn new(layout: CompileLayout) -> Self {
        Self {
            layout,
            code: Vec::new(),
            stubs: BTreeMap::new(),
            exit_refs: Vec::new(),
        }
    }

    fn byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn imm32(&mut self, value: i32) {
        self.bytes(&value.to_le_bytes());
    }

    fn rex(&mut self, wide: bool, reg: u8, index: u8, base: u8) {
        let rex = 0x40
            | (wide as u8) << 3
            | (reg >> 3 & 1) << 2
            | (index >> 3 & 1) << 1
            | (base >> 3 & 1);
        if rex != 0x40 {
            self.byte(rex);
        }
    }

    fn modrm_mem(&mut self, reg: u8, mem: Mem) {
        let base = mem.base.code() & 7;
        // rbp/r13 as a base has no disp-less form
        let (mode, disp_len) = if mem.disp == 0 && base != 5 {
            (0b00, 0)
        } else if i8::try_from(mem.disp).is_ok() {
            (0b01, 1)
        } else {
            (0b10, 4)
        };
        let reg = (reg & 7) << 3;
        match mem.index {
            Some((index, scale)) => {
                let scale_bits = match scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    _ => 3,
                };
                self.byte(mode << 6 | reg | 0b100);
                self.byte(scale_bits << 6 | (index.code() & 7) << 3 | base);
            }
            None if base == 4 => {
                self.byte(mode << 6 | reg | 0b100);
                self.byte(0x24);
            }
            None => self.byte(mode << 6 | reg | base),
        }
        match disp_len {
            1 => self.byte(mem.disp as i8 as u8),
            4 => self.imm32(mem.disp),
            _ => {}
        }
    }

    fn op_mem(&mut self, prefix: &[u8], wide: bool, opcode: &[u8], reg: u8, mem: Mem) {
        self.bytes(prefix);
        let index = mem.index.map_or(0, |(index, _)| index.code());
        self.rex(wide, reg, index, mem.base.code());
        self.bytes(opcode);
        self.modrm_mem(reg, mem);
    }

    fn op_rr(&mut self, prefix: &[u8], wide: bool, opcode: &[u8], reg: u8, rm: u8) {
        self.bytes(prefix);
        self.rex(wide, reg, 0, rm);
        self.bytes(opcode);
        self.byte(0xC0 | (reg & 7) << 3 | (rm & 7));
    }

    fn load(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(&[], false, &[0x8B], dst.code(), mem);
    }

    fn load64(&mut self, dst: Reg, mem: Mem) {
        self.op_mem(&[], true, &[0x8B], dst.code(), mem);
    }

    fn store(&mut self, mem: Mem, src: Reg) {
        self.op_mem(&[], false, &[0x89], src.code(), mem);
    }

    fn store_imm(&mut self, mem: Mem, value: i32) {
        self.op_mem(&[], false, &[0xC7], 0, mem);
        self.imm32(value);
    }

    fn mov_imm(&mut self, dst: Reg, value: i32) {
        self.rex(false, 0, 0, dst.code());
        self.byte(0xB8 + (dst.code() & 7));
        self.imm32(value);
    }

    fn mov_imm64(&mut self, dst: Reg, value: u64) {
        self.rex(true, 0, 0, dst.code());
        self.byte(0xB8 + (dst.code() & 7));
        self.bytes(&value.to_le_bytes());
    }

    fn mov(&mut self, dst: Reg, src: Reg) {
        self.op_rr(&[], false, &[0x89], src.code(), dst.code());
    }

    fn mov64(&mut self, dst: Reg, src: Reg) {
        self.op_rr(&[], true, &[0x89], src.code(), dst.code());
    }

    fn alu_imm(&mut self, ext: u8, dst: Reg, value: i32) {
        if let Ok(short) = i8::try_from(value) {
            self.op_rr(&[], false, &[0x83], ext, dst.code());
            self.byte(short as u8);
        } else {
            self.op_rr(&[], false, &[0x81], ext, dst.code());
            self.imm32(value);
        }
    }

    /// `op reg, reg` with the destination in the reg field.
    fn alu_rr(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.op_rr(&[], false, &[opcode], dst.code(), src.code());
    }

    /// `op [mem], reg`.
    fn alu_mem(&mut self, opcode: u8, mem: Mem, src: Reg) {
        self.op_mem(&[], false, &[opcode], src.code(), mem);
    }

    fn inc(&mut self, reg: Reg) {
        self.op_rr(&[], false, &[0xFF], 0, reg.code());
    }

    fn dec(&mut self, reg: Reg) {
        self.op_rr(&[], false, &[0xFF], 1, reg.code());
    }

    fn test(&mut self, a: Reg, b: Reg) {
        self.op_rr(&[], false, &[0x85], b.code(), a.code());
    }

    fn sse_load(&mut self, opcode: u8, xmm: u8, mem: Mem) {
        self.op_mem(&[0xF3], false, &[0x0F, opcode], xmm, mem);
    }

    fn movss_store(&mut self, mem: Mem, xmm: u8) {
        self.op_mem(&[0xF3], false, &[0x0F, 0x11], xmm, mem);
    }

    fn ucomiss(&mut self, a: u8, b: u8) {
        self.op_rr(&[], false, &[0x0F, 0x2E], a, b);
    }

    /// `jcc rel32` with a zero displacement; returns the patch site.
    fn jcc(&mut self, cc: u8) -> usize {
        self.bytes(&[0x0F, 0x80 | cc]);
        let at = self.code.len();
        self.imm32(0);
        at
    }

    fn jmp(&mut self) -> usize {
        self.byte(0xE9);
        let at = self.code.len();
        self.imm32(0);
        at
    }

    fn jmp_mem(&mut self, mem: Mem) {
        self.op_mem(&[], false, &[0xFF], 4, mem);
    }

    fn patch(&mut self, at: usize, target: usize) -> Result<(), CompileError> {
        let rel = target as i64 - (at as i64 + 4);
        let rel = i32::try_from(rel).map_err(|_| CompileError::CodeTooLarge {
            size: self.code.len(),
            limit: i32::MAX as usize,
        })?;
        self.code[at..at + 4].copy_from_slice(&rel.to_le_bytes());
        Ok(())
    }

    fn bind(&mut self, at: usize) -> Result<(), CompileError> {
        let here = self.code.len();
        self.patch(at, here)
    }

    fn jcc_stub(&mut self, cc: u8, kind: u32, pc: u32) {
        let at = self.jcc(cc);
        self.stubs.entry((kind, pc)).or_default().push(at);
    }

    fn jmp_stub(&mut self, kind: u32, pc: u32) {
        let at = self.jmp();
        self.stubs.entry((kind, pc)).or_default().push(at);
    }

    fn emit_checks(&mut self, pc: u32, opcode: OpCode) {
        let (pops, pushes) = opcode.stack_effect();
        if pops > 0 {
            self.alu_imm(ALU_CMP, Reg::R14, pops as i32);
            self.jcc_stub(CC_B, fault_code::OP_STACK_UNDERFLOW, pc);
        }
        if pushes > pops {
            let room = OP_STACK_SLOTS - (pushes - pops) as usize;
            self.alu_imm(ALU_CMP, Reg::R14, room as i32);
            self.jcc_stub(CC_A, fault_code::OP_STACK_OVERFLOW, pc);
        }
        if opcode.is_control_transfer() {
            // cmp qword [rbx+budget], 0
            self.op_mem(&[], true, &[0x83], ALU_CMP, ctx(ctx_offset::BUDGET));
            self.byte(0);
            self.jcc_stub(CC_E, fault_code::BUDGET_EXHAUSTED, pc);
            // dec qword [rbx+budget]
            self.op_mem(&[], true, &[0xFF], 1, ctx(ctx_offset::BUDGET));
        }
    }

    /// Faults unless r15d lies in the stack region; eax carries it as detail.
    fn emit_stack_range_check(&mut self, pc: u32) {
        let span = self.layout.stack_limit - self.layout.stack_bottom;
        self.mov(Reg::Rdx, Reg::R15);
        self.alu_imm(ALU_SUB, Reg::Rdx, self.layout.stack_bottom as i32);
        self.alu_imm(ALU_CMP, Reg::Rdx, span as i32);
        self.mov(Reg::Rax, Reg::R15);
        self.jcc_stub(CC_A, fault_code::PROGRAM_STACK_OUT_OF_RANGE, pc);
    }

    /// Bounds-checks eax against the instruction count and jumps through
    /// the address table.
    fn emit_indirect_jump(&mut self, kind: u32, pc: u32) {
        self.alu_imm(ALU_CMP, Reg::Rax, self.layout.instruction_count as i32);
        self.jcc_stub(CC_AE, kind, pc);
        self.jmp_mem(table(Reg::Rax));
    }

    fn emit_helper_call(&mut self, helper: u64, arg: HelperArg, pc: u32) {
        self.store(ctx(ctx_offset::OP_DEPTH), Reg::R14);
        self.store(ctx(ctx_offset::PROGRAM_STACK), Reg::R15);
        let (ctx_reg, arg_reg) = match self.layout.call_conv {
            CallConv::SysV => (Reg::Rdi, Reg::Rsi),
            CallConv::Win64 => (Reg::Rcx, Reg::Rdx),
        };
        match arg {
            HelperArg::Eax => self.mov(arg_reg, Reg::Rax),
            HelperArg::Imm(value) => self.mov_imm(arg_reg, value),
        }
        self.mov64(ctx_reg, Reg::Rbx);
        self.mov_imm64(Reg::Rax, helper);
        self.bytes(&[0xFF, 0xD0]);
        self.load(Reg::R14, ctx(ctx_offset::OP_DEPTH));
        self.load(Reg::R15, ctx(ctx_offset::PROGRAM_STACK));
        self.test(Reg::Rax, Reg::Rax);
        self.jcc_stub(CC_NE, fault_code::PENDING, pc);
    }

    fn mask_eax(&mut self) {
        self.alu_imm(ALU_AND, Reg::Rax, self.layout.data_mask as i32);
    }

    fn emit_int_branch(&mut self, cc: u8, pc: u32, target: i32, fixups: &mut Vec<Fixup>) {
        self.load(Reg::Rax, SEC);
        self.load(Reg::Rcx, TOP);
        self.alu_imm(ALU_SUB, Reg::R14, 2);
        self.alu_rr(0x3B, Reg::Rax, Reg::Rcx);
        self.branch_fixup(cc, pc, target, fixups);
    }

    fn branch_fixup(&mut self, cc: u8, pc: u32, target: i32, fixups: &mut Vec<Fixup>) {
        let at = self.jcc(cc);
        fixups.push(Fixup {
            at,
            source: pc,
            target: target as u32,
        });
    }

    fn emit_float_branch(
        &mut self,
        opcode: OpCode,
        pc: u32,
        target: i32,
        fixups: &mut Vec<Fixup>,
    ) {
        self.sse_load(0x10, XMM0, SEC);
        self.sse_load(0x10, XMM1, TOP);
        self.alu_imm(ALU_SUB, Reg::R14, 2);
        match opcode {
            OpCode::Eqf => {
                self.ucomiss(XMM0, XMM1);
                // unordered sets ZF too; skip the 6-byte je
                self.bytes(&[0x7A, 0x06]);
                self.branch_fixup(CC_E, pc, target, fixups);
            }
            OpCode::Nef => {
                self.ucomiss(XMM0, XMM1);
                self.branch_fixup(CC_P, pc, target, fixups);
                self.branch_fixup(CC_NE, pc, target, fixups);
            }
            OpCode::Gtf => {
                self.ucomiss(XMM0, XMM1);
                self.branch_fixup(CC_A, pc, target, fixups);
            }
            OpCode::Gef => {
                self.ucomiss(XMM0, XMM1);
                self.branch_fixup(CC_AE, pc, target, fixups);
            }
            OpCode::Ltf => {
                self.ucomiss(XMM1, XMM0);
                self.branch_fixup(CC_A, pc, target, fixups);
            }
            _ => {
                self.ucomiss(XMM1, XMM0);
                self.branch_fixup(CC_AE, pc, target, fixups);
            }
        }
    }

    fn emit_load(&mut self, opcode: &[u8]) {
        self.load(Reg::Rax, TOP);
        self.mask_eax();
        self.op_mem(&[], false, opcode, Reg::Rax.code(), data(Reg::Rax));
        self.store(TOP, Reg::Rax);
    }

    fn emit_store(&mut self, prefix: &[u8], opcode: u8) {
        self.load(Reg::Rax, SEC);
        self.mask_eax();
        self.load(Reg::Rcx, TOP);
        self.op_mem(prefix, false, &[opcode], Reg::Rcx.code(), data(Reg::Rax));
        self.alu_imm(ALU_SUB, Reg::R14, 2);
    }

    /// `[SEC] op= [TOP]` for the two-operand integer ops with a memory form.
    fn emit_binary_mem(&mut self, opcode: u8) {
        self.load(Reg::Rax, TOP);
        self.dec(Reg::R14);
        self.alu_mem(opcode, TOP, Reg::Rax);
    }

    fn emit_shift(&mut self, ext: u8) {
        self.load(Reg::Rcx, TOP);
        self.dec(Reg::R14);
        self.op_mem(&[], false, &[0xD3], ext, TOP);
    }

    fn emit_float_binary(&mut self, opcode: u8) {
        self.sse_load(0x10, XMM0, SEC);
        self.sse_load(opcode, XMM0, TOP);
        self.dec(Reg::R14);
        self.movss_store(TOP, XMM0);
    }

    fn emit_divide(&mut self, opcode: OpCode, pc: u32) -> Result<(), CompileError> {
        self.load(Reg::Rcx, TOP);
        self.test(Reg::Rcx, Reg::Rcx);
        self.mov_imm(Reg::Rax, 0);
        self.jcc_stub(CC_E, fault_code::DIVIDE_BY_ZERO, pc);
        self.load(Reg::Rax, SEC);
        let result = match opcode {
            OpCode::Divi | OpCode::Modi => {
                // idiv traps on MIN / -1
                self.alu_imm(ALU_CMP, Reg::Rcx, -1);
                let general = self.jcc(CC_NE);
                if opcode == OpCode::Divi {
                    self.op_rr(&[], false, &[0xF7], 3, Reg::Rax.code());
                } else {
                    self.alu_rr(0x33, Reg::Rdx, Reg::Rdx);
                }
                let done = self.jmp();
                self.bind(general)?;
                self.byte(0x99);
                self.op_rr(&[], false, &[0xF7], 7, Reg::Rcx.code());
                self.bind(done)?;
                if opcode == OpCode::Divi { Reg::Rax } else { Reg::Rdx }
            }
            _ => {
                self.alu_rr(0x33, Reg::Rdx, Reg::Rdx);
                self.op_rr(&[], false, &[0xF7], 6, Reg::Rcx.code());
                if opcode == OpCode::Divu { Reg::Rax } else { Reg::Rdx }
            }
        };
        self.dec(Reg::R14);
        self.store(TOP, result);
        Ok(())
    }

    fn emit_cvfi(&mut self, pc: u32) -> Result<(), CompileError> {
        self.load(Reg::Rax, TOP);
        self.mov(Reg::Rdx, Reg::Rax);
        self.alu_imm(ALU_AND, Reg::Rdx, 0x7fff_ffff);
        self.alu_imm(ALU_CMP, Reg::Rdx, 0x4f00_0000);
        let fits = self.jcc(CC_B);
        self.alu_imm(ALU_CMP, Reg::Rax, 0xcf00_0000u32 as i32);
        self.jcc_stub(CC_NE, fault_code::BAD_FLOAT_OP, pc);
        self.bind(fits)?;
        // cvttss2si eax, [TOP]
        self.op_mem(&[0xF3], false, &[0x0F, 0x2C], Reg::Rax.code(), TOP);
        self.store(TOP, Reg::Rax);
        Ok(())
    }
}

impl CodeEmitter for X86_64Emitter {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    fn emit_prologue(&mut self) -> Result<(), CompileError> {
        // push rbx, rbp, r12-r15
        self.bytes(&[0x53, 0x55, 0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]);
        // keep rsp 16-byte aligned at helper calls; win64 also needs shadow space
        let frame = match self.layout.call_conv {
            CallConv::SysV => 8,
            CallConv::Win64 => 40,
        };
        self.bytes(&[0x48, 0x83, 0xEC, frame]);
        let ctx_arg = match self.layout.call_conv {
            CallConv::SysV => Reg::Rdi,
            CallConv::Win64 => Reg::Rcx,
        };
        self.mov64(Reg::Rbx, ctx_arg);
        self.load64(Reg::R12, ctx(ctx_offset::DATA_BASE));
        self.load64(Reg::R13, ctx(ctx_offset::OP_STACK));
        self.load64(Reg::Rbp, ctx(ctx_offset::INSTRUCTION_TABLE));
        self.load(Reg::R14, ctx(ctx_offset::OP_DEPTH));
        self.load(Reg::R15, ctx(ctx_offset::PROGRAM_STACK));
        self.load(Reg::Rax, ctx(ctx_offset::ENTRY));
        self.jmp_mem(table(Reg::Rax));
        Ok(())
    }

    fn emit_opcode(
        &mut self,
        pc: u32,
        instruction: Instruction,
        fixups: &mut Vec<Fixup>,
    ) -> Result<(), CompileError> {
        let opcode = instruction.opcode;
        let operand = instruction.operand;
        self.emit_checks(pc, opcode);

        match opcode {
            OpCode::Undef => {
                self.mov_imm(Reg::Rax, 0);
                self.jmp_stub(fault_code::INVALID_OPCODE, pc);
            }
            OpCode::Ignore => {}
            OpCode::Break => {
                self.op_mem(&[], true, &[0xFF], 0, ctx(ctx_offset::BREAK_COUNT));
            }
            OpCode::Enter => {
                self.alu_imm(ALU_SUB, Reg::R15, operand);
                self.emit_stack_range_check(pc);
            }
            OpCode::Leave => {
                self.alu_imm(ALU_ADD, Reg::R15, operand);
                self.emit_stack_range_check(pc);
                self.mask_eax();
                self.load(Reg::Rax, data(Reg::Rax));
                self.alu_imm(ALU_CMP, Reg::Rax, -1);
                self.mov_imm(Reg::Rcx, pc as i32);
                let at = self.jcc(CC_E);
                self.exit_refs.push(at);
                self.emit_indirect_jump(fault_code::RETURN_OUT_OF_RANGE, pc);
            }
            OpCode::Call => {
                self.load(Reg::Rax, TOP);
                self.dec(Reg::R14);
                self.mov(Reg::Rdx, Reg::R15);
                self.alu_imm(ALU_AND, Reg::Rdx, self.layout.data_mask as i32);
                self.store_imm(data(Reg::Rdx), pc as i32 + 1);
                self.test(Reg::Rax, Reg::Rax);
                let guest = self.jcc(CC_NS);
                self.emit_helper_call(self.layout.syscall_helper, HelperArg::Eax, pc);
                let done = self.jmp();
                self.bind(guest)?;
                self.emit_indirect_jump(fault_code::CALL_OUT_OF_RANGE, pc);
                self.bind(done)?;
            }
            OpCode::Push => {
                self.store_imm(NEXT, 0);
                self.inc(Reg::R14);
            }
            OpCode::Pop => self.dec(Reg::R14),
            OpCode::Const => {
                self.store_imm(NEXT, operand);
                self.inc(Reg::R14);
            }
            OpCode::Local => {
                self.op_mem(
                    &[],
                    false,
                    &[0x8D],
                    Reg::Rax.code(),
                    Mem {
                        base: Reg::R15,
                        index: None,
                        disp: operand,
                    },
                );
                self.store(NEXT, Reg::Rax);
                self.inc(Reg::R14);
            }
            OpCode::Jump => {
                self.load(Reg::Rax, TOP);
                self.dec(Reg::R14);
                self.emit_indirect_jump(fault_code::JUMP_OUT_OF_RANGE, pc);
            }
            OpCode::Eq => self.emit_int_branch(CC_E, pc, operand, fixups),
            OpCode::Ne => self.emit_int_branch(CC_NE, pc, operand, fixups),
            OpCode::Lti => self.emit_int_branch(CC_L, pc, operand, fixups),
            OpCode::Lei => self.emit_int_branch(CC_LE, pc, operand, fixups),
            OpCode::Gti => self.emit_int_branch(CC_G, pc, operand, fixups),
            OpCode::Gei => self.emit_int_branch(CC_GE, pc, operand, fixups),
            OpCode::Ltu => self.emit_int_branch(CC_B, pc, operand, fixups),
            OpCode::Leu => self.emit_int_branch(CC_BE, pc, operand, fixups),
            OpCode::Gtu => self.emit_int_branch(CC_A, pc, operand, fixups),
            OpCode::Geu => self.emit_int_branch(CC_AE, pc, operand, fixups),
            OpCode::Eqf
            | OpCode::Nef
            | OpCode::Ltf
            | OpCode::Lef
            | OpCode::Gtf
            | OpCode::Gef => self.emit_float_branch(opcode, pc, operand, fixups),
            OpCode::Load1 => self.emit_load(&[0x0F, 0xB6]),
            OpCode::Load2 => self.emit_load(&[0x0F, 0xB7]),
            OpCode::Load4 => self.emit_load(&[0x8B]),
            OpCode::Store1 => self.emit_store(&[], 0x88),
            OpCode::Store2 => self.emit_store(&[0x66], 0x89),
            OpCode::Store4 => self.emit_store(&[], 0x89),
            OpCode::Arg => {
                self.mov(Reg::Rax, Reg::R15);
                self.alu_imm(ALU_ADD, Reg::Rax, operand as u8 as i32);
                self.mask_eax();
                self.load(Reg::Rcx, TOP);
                self.store(data(Reg::Rax), Reg::Rcx);
                self.dec(Reg::R14);
            }
            OpCode::BlockCopy => {
                self.emit_helper_call(
                    self.layout.block_copy_helper,
                    HelperArg::Imm(operand),
                    pc,
                );
            }
            OpCode::Sex8 | OpCode::Sex16 => {
                let opcode = if opcode == OpCode::Sex8 { 0xBE } else { 0xBF };
                self.op_mem(&[], false, &[0x0F, opcode], Reg::Rax.code(), TOP);
                self.store(TOP, Reg::Rax);
            }
            OpCode::Negi => self.op_mem(&[], false, &[0xF7], 3, TOP),
            OpCode::Bcom => self.op_mem(&[], false, &[0xF7], 2, TOP),
            OpCode::Add => self.emit_binary_mem(0x01),
            OpCode::Sub => self.emit_binary_mem(0x29),
            OpCode::Band => self.emit_binary_mem(0x21),
            OpCode::Bor => self.emit_binary_mem(0x09),
            OpCode::Bxor => self.emit_binary_mem(0x31),
            OpCode::Muli | OpCode::Mulu => {
                self.load(Reg::Rax, SEC);
                self.op_mem(&[], false, &[0x0F, 0xAF], Reg::Rax.code(), TOP);
                self.dec(Reg::R14);
                self.store(TOP, Reg::Rax);
            }
            OpCode::Divi | OpCode::Divu | OpCode::Modi | OpCode::Modu => {
                self.emit_divide(opcode, pc)?;
            }
            OpCode::Lsh => self.emit_shift(4),
            OpCode::Rshi => self.emit_shift(7),
            OpCode::Rshu => self.emit_shift(5),
            OpCode::Negf => {
                self.op_mem(&[], false, &[0x81], ALU_XOR, TOP);
                self.imm32(i32::MIN);
            }
            OpCode::Addf => self.emit_float_binary(0x58),
            OpCode::Subf => self.emit_float_binary(0x5C),
            OpCode::Mulf => self.emit_float_binary(0x59),
            OpCode::Divf => self.emit_float_binary(0x5E),
            OpCode::Cvif => {
                self.sse_load(0x2A, XMM0, TOP);
                self.movss_store(TOP, XMM0);
            }
            OpCode::Cvfi => self.emit_cvfi(pc)?,
        }
        Ok(())
    }

    fn emit_fixup(&mut self, fixup: &Fixup, target_offset: usize) -> Result<(), CompileError> {
        self.patch(fixup.at, target_offset)
            .map_err(|_| CompileError::BranchOutOfRange { pc: fixup.source })
    }

    fn finalize(mut self) -> Result<Vec<u8>, CompileError> {
        // falling off the last instruction
        self.mov_imm(Reg::Rax, 0);
        self.mov_imm(Reg::Rdx, fault_code::PC_OUT_OF_RANGE as i32);
        self.mov_imm(Reg::Rcx, self.layout.instruction_count as i32);

        let fault_exit = self.code.len();
        self.store(ctx(ctx_offset::FAULT_KIND), Reg::Rdx);
        self.store(ctx(ctx_offset::FAULT_PC), Reg::Rcx);
        self.store(ctx(ctx_offset::FAULT_DETAIL), Reg::Rax);
        self.mov(Reg::Rax, Reg::Rdx);
        let to_common = self.jmp();

        let exit = self.code.len();
        self.store(ctx(ctx_offset::FAULT_PC), Reg::Rcx);
        self.alu_rr(0x33, Reg::Rax, Reg::Rax);
        self.bind(to_common)?;
        self.store(ctx(ctx_offset::OP_DEPTH), Reg::R14);
        self.store(ctx(ctx_offset::PROGRAM_STACK), Reg::R15);
        let frame = match self.layout.call_conv {
            CallConv::SysV => 8,
            CallConv::Win64 => 40,
        };
        self.bytes(&[0x48, 0x83, 0xC4, frame]);
        // pop r15-r12, rbp, rbx; ret
        self.bytes(&[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D, 0x41, 0x5C, 0x5D, 0x5B, 0xC3]);

        for at in std::mem::take(&mut self.exit_refs) {
            self.patch(at, exit)?;
        }
        let stubs = std::mem::take(&mut self.stubs);
        for ((kind, pc), sites) in stubs {
            let stub = self.code.len();
            self.mov_imm(Reg::Rdx, kind as i32);
            self.mov_imm(Reg::Rcx, pc as i32);
            let back = self.jmp();
            self.patch(back, fault_exit)?;
            for at in sites {
                self.patch(at, stub)?;
            }
        }
        Ok(self.code)
    }
}
