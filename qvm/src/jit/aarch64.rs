//! AArch64 code generation.
//!
//! Register assignment inside generated code: `x19` context, `x20` sandbox
//! base, `x21` operand stack, `w22` operand depth, `w23` program stack,
//! `x24` instruction address table. `x9` holds the address of the first
//! free operand slot for the instruction being executed.

use std::collections::BTreeMap;

use super::{Arch, CodeEmitter, CompileError, CompileLayout, Fixup, ctx_offset, fault_code};
use crate::bytecode::{Instruction, OpCode};
use crate::vm::OP_STACK_SLOTS;

const CTX: u32 = 19;
const DATA: u32 = 20;
const OPS: u32 = 21;
const DEPTH: u32 = 22;
const PS: u32 = 23;
const TABLE: u32 = 24;
const SLOT: u32 = 9;
const TMP: u32 = 16;
const TMP2: u32 = 17;
const ZR: u32 = 31;

const COND_EQ: u32 = 0;
const COND_NE: u32 = 1;
const COND_HS: u32 = 2;
const COND_LO: u32 = 3;
const COND_MI: u32 = 4;
const COND_HI: u32 = 8;
const COND_LS: u32 = 9;
const COND_GE: u32 = 10;
const COND_LT: u32 = 11;
const COND_GT: u32 = 12;
const COND_LE: u32 = 13;

// data-processing (register), 32-bit
const ADD: u32 = 0x0B00_0000;
const SUB: u32 = 0x4B00_0000;
const SUBS: u32 = 0x6B00_0000;
const AND: u32 = 0x0A00_0000;
const ORR: u32 = 0x2A00_0000;
const EOR: u32 = 0x4A00_0000;
const ORN: u32 = 0x2A20_0000;
const SDIV: u32 = 0x1AC0_0C00;
const UDIV: u32 = 0x1AC0_0800;
const LSLV: u32 = 0x1AC0_2000;
const LSRV: u32 = 0x1AC0_2400;
const ASRV: u32 = 0x1AC0_2800;

const FADD: u32 = 0x1E20_2800;
const FSUB: u32 = 0x1E20_3800;
const FMUL: u32 = 0x1E20_0800;
const FDIV: u32 = 0x1E20_1800;

// register-offset loads and stores
const LDR_W: u32 = 0xB860_6800;
const LDRH_W: u32 = 0x7860_6800;
const LDRB_W: u32 = 0x3860_6800;
const STR_W: u32 = 0xB820_6800;
const STRH_W: u32 = 0x7820_6800;
const STRB_W: u32 = 0x3820_6800;

const RET: u32 = 0xD65F_03C0;

pub struct Aarch64Emitter {
    layout: CompileLayout,
    code: Vec<u8>,
    mask_imms: u32,
    stubs: BTreeMap<(u32, u32), Vec<usize>>,
    exit_refs: Vec<usize>,
}

impl Aarch64Emitter {
    /// Fails when the sandbox mask has no logical-immediate encoding.
    pub fn new(layout: CompileLayout) -> Result<Self, CompileError> {
        let mask = layout.data_mask;
        let ones = mask.trailing_ones();
        if ones == 0 || ones >= 32 || mask.count_ones() != ones {
            return Err(CompileError::UnencodableImmediate {
                pc: 0,
                what: "sandbox mask",
            });
        }
        Ok(Self {
            layout,
            code: Vec::new(),
            mask_imms: ones - 1,
            stubs: BTreeMap::new(),
            exit_refs: Vec::new(),
        })
    }

    fn word(&mut self, word: u32) {
        self.code.extend_from_slice(&word.to_le_bytes());
    }

    fn read_word(&self, at: usize) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.code[at..at + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_word(&mut self, at: usize, word: u32) {
        self.code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    fn rrr(&mut self, op: u32, rd: u32, rn: u32, rm: u32) {
        self.word(op | rm << 16 | rn << 5 | rd);
    }

    fn mov(&mut self, rd: u32, rm: u32) {
        self.rrr(ORR, rd, ZR, rm);
    }

    fn mov64(&mut self, rd: u32, rm: u32) {
        self.word(0xAA00_0000 | rm << 16 | ZR << 5 | rd);
    }

    fn mov_imm(&mut self, rd: u32, value: u32) {
        self.word(0x5280_0000 | (value & 0xffff) << 5 | rd);
        if value >> 16 != 0 {
            self.word(0x72A0_0000 | (value >> 16) << 5 | rd);
        }
    }

    fn mov_imm64(&mut self, rd: u32, value: u64) {
        self.word(0xD280_0000 | ((value & 0xffff) as u32) << 5 | rd);
        for shift in 1..4u32 {
            let chunk = ((value >> (16 * shift)) & 0xffff) as u32;
            if chunk != 0 {
                self.word(0xF280_0000 | shift << 21 | chunk << 5 | rd);
            }
        }
    }

    /// `rd = rn + value`; `rn` must not be a scratch temp.
    fn add_imm(&mut self, rd: u32, rn: u32, value: u32) {
        if value < 0x1000 {
            self.word(0x1100_0000 | value << 10 | rn << 5 | rd);
        } else {
            self.mov_imm(TMP, value);
            self.rrr(ADD, rd, rn, TMP);
        }
    }

    fn sub_imm(&mut self, rd: u32, rn: u32, value: u32) {
        if value < 0x1000 {
            self.word(0x5100_0000 | value << 10 | rn << 5 | rd);
        } else {
            self.mov_imm(TMP, value);
            self.rrr(SUB, rd, rn, TMP);
        }
    }

    fn cmp_imm(&mut self, rn: u32, value: u32) {
        if value < 0x1000 {
            self.word(0x7100_0000 | value << 10 | rn << 5 | ZR);
        } else {
            self.mov_imm(TMP, value);
            self.rrr(SUBS, ZR, rn, TMP);
        }
    }

    fn and_mask(&mut self, rd: u32, rn: u32) {
        self.word(0x1200_0000 | self.mask_imms << 10 | rn << 5 | rd);
    }

    fn ldur(&mut self, rt: u32, rn: u32, offset: i32) {
        self.word(0xB840_0000 | ((offset as u32) & 0x1ff) << 12 | rn << 5 | rt);
    }

    fn stur(&mut self, rt: u32, rn: u32, offset: i32) {
        self.word(0xB800_0000 | ((offset as u32) & 0x1ff) << 12 | rn << 5 | rt);
    }

    fn ldur_s(&mut self, rt: u32, rn: u32, offset: i32) {
        self.word(0xBC40_0000 | ((offset as u32) & 0x1ff) << 12 | rn << 5 | rt);
    }

    fn stur_s(&mut self, rt: u32, rn: u32, offset: i32) {
        self.word(0xBC00_0000 | ((offset as u32) & 0x1ff) << 12 | rn << 5 | rt);
    }

    fn ldr_ctx(&mut self, rt: u32, offset: i32) {
        self.word(0xB940_0000 | (offset as u32 / 4) << 10 | CTX << 5 | rt);
    }

    fn str_ctx(&mut self, rt: u32, offset: i32) {
        self.word(0xB900_0000 | (offset as u32 / 4) << 10 | CTX << 5 | rt);
    }

    fn ldr64_ctx(&mut self, rt: u32, offset: i32) {
        self.word(0xF940_0000 | (offset as u32 / 8) << 10 | CTX << 5 | rt);
    }

    fn str64_ctx(&mut self, rt: u32, offset: i32) {
        self.word(0xF900_0000 | (offset as u32 / 8) << 10 | CTX << 5 | rt);
    }

    /// Loads or stores through `x20 + xm`.
    fn data_access(&mut self, op: u32, rt: u32, rm: u32) {
        self.rrr(op, rt, DATA, rm);
    }

    /// `ldr x16, [x24, x0, lsl #3]; br x16`
    fn jump_through_table(&mut self) {
        self.word(0xF860_7800 | TABLE << 5 | TMP);
        self.word(0xD61F_0000 | TMP << 5);
    }

    fn slot_address(&mut self) {
        // add x9, x21, w22, uxtw #2
        self.word(0x8B20_4800 | DEPTH << 16 | OPS << 5 | SLOT);
    }

    fn b_cond(&mut self, cond: u32, words: i32) {
        self.word(0x5400_0000 | ((words as u32) & 0x7ffff) << 5 | cond);
    }

    /// Unconditional `b` with a zero offset; returns the patch site.
    fn b(&mut self) -> usize {
        let at = self.code.len();
        self.word(0x1400_0000);
        at
    }

    /// Conditional branch with a zero offset, for short forward skips.
    fn b_cond_forward(&mut self, cond: u32) -> usize {
        let at = self.code.len();
        self.word(0x5400_0000 | cond);
        at
    }

    fn bind_cond(&mut self, at: usize) {
        let words = ((self.code.len() - at) / 4) as u32;
        let word = self.read_word(at) | (words & 0x7ffff) << 5;
        self.write_word(at, word);
    }

    fn patch_b(&mut self, at: usize, target: usize) -> Result<(), CompileError> {
        let words = (target as i64 - at as i64) / 4;
        if !(-(1 << 25)..(1 << 25)).contains(&words) {
            return Err(CompileError::CodeTooLarge {
                size: self.code.len(),
                limit: 1 << 27,
            });
        }
        self.write_word(at, 0x1400_0000 | (words as u32 & 0x03ff_ffff));
        Ok(())
    }

    /// Branches to the fault stub for `(kind, pc)` when `cond` holds.
    fn stub_if(&mut self, cond: u32, kind: u32, pc: u32) {
        self.b_cond(cond ^ 1, 2);
        self.stub_always(kind, pc);
    }

    fn stub_always(&mut self, kind: u32, pc: u32) {
        let at = self.b();
        self.stubs.entry((kind, pc)).or_default().push(at);
    }

    fn branch_fixup(&mut self, cond: u32, pc: u32, target: i32, fixups: &mut Vec<Fixup>) {
        self.b_cond(cond ^ 1, 2);
        let at = self.b();
        fixups.push(Fixup {
            at,
            source: pc,
            target: target as u32,
        });
    }

    fn emit_checks(&mut self, pc: u32, opcode: OpCode) {
        let (pops, pushes) = opcode.stack_effect();
        if pops > 0 {
            self.cmp_imm(DEPTH, pops as u32);
            self.stub_if(COND_LO, fault_code::OP_STACK_UNDERFLOW, pc);
        }
        if pushes > pops {
            let room = OP_STACK_SLOTS as u32 - (pushes - pops) as u32;
            self.cmp_imm(DEPTH, room);
            self.stub_if(COND_HI, fault_code::OP_STACK_OVERFLOW, pc);
        }
        if opcode.is_control_transfer() {
            self.ldr64_ctx(TMP, ctx_offset::BUDGET);
            // cbnz x16, +8
            self.word(0xB500_0000 | 2 << 5 | TMP);
            self.stub_always(fault_code::BUDGET_EXHAUSTED, pc);
            self.word(0xD100_0400 | TMP << 5 | TMP);
            self.str64_ctx(TMP, ctx_offset::BUDGET);
        }
    }

    fn emit_stack_range_check(&mut self, pc: u32) {
        let span = self.layout.stack_limit - self.layout.stack_bottom;
        self.mov_imm(TMP, self.layout.stack_bottom);
        self.rrr(SUB, TMP2, PS, TMP);
        self.mov_imm(TMP, span);
        self.rrr(SUBS, ZR, TMP2, TMP);
        self.mov(0, PS);
        self.stub_if(COND_HI, fault_code::PROGRAM_STACK_OUT_OF_RANGE, pc);
    }

    fn emit_indirect_jump(&mut self, kind: u32, pc: u32) {
        self.cmp_imm(0, self.layout.instruction_count);
        self.stub_if(COND_HS, kind, pc);
        self.jump_through_table();
    }

    fn emit_helper_call(&mut self, helper: u64, arg_from_w0: bool, arg: u32, pc: u32) {
        self.str_ctx(DEPTH, ctx_offset::OP_DEPTH);
        self.str_ctx(PS, ctx_offset::PROGRAM_STACK);
        if arg_from_w0 {
            self.mov(1, 0);
        } else {
            self.mov_imm(1, arg);
        }
        self.mov64(0, CTX);
        self.mov_imm64(TMP, helper);
        self.word(0xD63F_0000 | TMP << 5);
        self.ldr_ctx(DEPTH, ctx_offset::OP_DEPTH);
        self.ldr_ctx(PS, ctx_offset::PROGRAM_STACK);
        // cbz w0, +8
        self.word(0x3400_0000 | 2 << 5);
        self.stub_always(fault_code::PENDING, pc);
    }

    fn emit_int_branch(&mut self, cond: u32, pc: u32, target: i32, fixups: &mut Vec<Fixup>) {
        self.ldur(1, SLOT, -8);
        self.ldur(0, SLOT, -4);
        self.sub_imm(DEPTH, DEPTH, 2);
        self.rrr(SUBS, ZR, 1, 0);
        self.branch_fixup(cond, pc, target, fixups);
    }

    fn emit_float_branch(&mut self, cond: u32, pc: u32, target: i32, fixups: &mut Vec<Fixup>) {
        self.ldur_s(1, SLOT, -8);
        self.ldur_s(0, SLOT, -4);
        self.sub_imm(DEPTH, DEPTH, 2);
        // fcmp s1, s0
        self.word(0x1E20_2000 | 1 << 5);
        self.branch_fixup(cond, pc, target, fixups);
    }

    fn emit_binary(&mut self, op: u32) {
        self.ldur(1, SLOT, -8);
        self.ldur(0, SLOT, -4);
        self.rrr(op, 1, 1, 0);
        self.stur(1, SLOT, -8);
        self.sub_imm(DEPTH, DEPTH, 1);
    }

    fn emit_float_binary(&mut self, op: u32) {
        self.ldur_s(1, SLOT, -8);
        self.ldur_s(0, SLOT, -4);
        self.rrr(op, 1, 1, 0);
        self.stur_s(1, SLOT, -8);
        self.sub_imm(DEPTH, DEPTH, 1);
    }

    fn emit_divide(&mut self, opcode: OpCode, pc: u32) {
        self.ldur(1, SLOT, -8);
        self.ldur(0, SLOT, -4);
        // cbnz w0, +8
        self.word(0x3500_0000 | 2 << 5);
        self.stub_always(fault_code::DIVIDE_BY_ZERO, pc);
        let divide = match opcode {
            OpCode::Divi | OpCode::Modi => SDIV,
            _ => UDIV,
        };
        self.rrr(divide, 2, 1, 0);
        if matches!(opcode, OpCode::Modi | OpCode::Modu) {
            // msub w2, w2, w0, w1
            self.word(0x1B00_8000 | 1 << 10 | 2 << 5 | 2);
        }
        self.stur(2, SLOT, -8);
        self.sub_imm(DEPTH, DEPTH, 1);
    }

    fn emit_load(&mut self, op: u32) {
        self.ldur(0, SLOT, -4);
        self.and_mask(0, 0);
        self.data_access(op, 0, 0);
        self.stur(0, SLOT, -4);
    }

    fn emit_store(&mut self, op: u32) {
        self.ldur(1, SLOT, -8);
        self.ldur(0, SLOT, -4);
        self.and_mask(1, 1);
        self.data_access(op, 0, 1);
        self.sub_imm(DEPTH, DEPTH, 2);
    }

    fn emit_cvfi(&mut self, pc: u32) {
        self.ldur(0, SLOT, -4);
        // and w1, w0, #0x7fffffff
        self.word(0x1200_7800 | 1);
        self.cmp_imm_reg(1, 0x4f00_0000);
        let fits = self.b_cond_forward(COND_LO);
        self.cmp_imm_reg(0, 0xcf00_0000);
        self.stub_if(COND_NE, fault_code::BAD_FLOAT_OP, pc);
        self.bind_cond(fits);
        // fmov s0, w0; fcvtzs w0, s0
        self.word(0x1E27_0000);
        self.word(0x1E38_0000);
        self.stur(0, SLOT, -4);
    }

    fn cmp_imm_reg(&mut self, rn: u32, value: u32) {
        self.mov_imm(TMP, value);
        self.rrr(SUBS, ZR, rn, TMP);
    }
}

impl CodeEmitter for Aarch64Emitter {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn offset(&self) -> usize {
        self.code.len()
    }

    fn emit_prologue(&mut self) -> Result<(), CompileError> {
        // stp x29, x30, [sp, #-64]!; mov x29, sp
        self.word(0xA9BC_7BFD);
        self.word(0x9100_03FD);
        // stp x19/x20, x21/x22, x23/x24 at sp+16, +32, +48
        for (pair, slot) in [(19u32, 2u32), (21, 4), (23, 6)] {
            self.word(0xA900_0000 | slot << 15 | (pair + 1) << 10 | ZR << 5 | pair);
        }
        self.mov64(CTX, 0);
        self.ldr64_ctx(DATA, ctx_offset::DATA_BASE);
        self.ldr64_ctx(OPS, ctx_offset::OP_STACK);
        self.ldr64_ctx(TABLE, ctx_offset::INSTRUCTION_TABLE);
        self.ldr_ctx(DEPTH, ctx_offset::OP_DEPTH);
        self.ldr_ctx(PS, ctx_offset::PROGRAM_STACK);
        self.ldr_ctx(0, ctx_offset::ENTRY);
        self.jump_through_table();
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
        self.slot_address();

        match opcode {
            OpCode::Undef => {
                self.mov_imm(0, 0);
                self.stub_always(fault_code::INVALID_OPCODE, pc);
            }
            OpCode::Ignore => {}
            OpCode::Break => {
                self.ldr64_ctx(TMP, ctx_offset::BREAK_COUNT);
                self.word(0x9100_0400 | TMP << 5 | TMP);
                self.str64_ctx(TMP, ctx_offset::BREAK_COUNT);
            }
            OpCode::Enter => {
                self.sub_imm(PS, PS, operand as u32);
                self.emit_stack_range_check(pc);
            }
            OpCode::Leave => {
                self.add_imm(PS, PS, operand as u32);
                self.emit_stack_range_check(pc);
                self.and_mask(0, 0);
                self.data_access(LDR_W, 0, 0);
                self.mov_imm(2, pc);
                // cmn w0, #1
                self.word(0x3100_0400 | ZR);
                self.b_cond(COND_NE, 2);
                let at = self.b();
                self.exit_refs.push(at);
                self.emit_indirect_jump(fault_code::RETURN_OUT_OF_RANGE, pc);
            }
            OpCode::Call => {
                self.ldur(0, SLOT, -4);
                self.sub_imm(DEPTH, DEPTH, 1);
                self.and_mask(1, PS);
                self.mov_imm(2, pc + 1);
                self.data_access(STR_W, 2, 1);
                self.cmp_imm(0, 0);
                let guest = self.b_cond_forward(COND_GE);
                self.emit_helper_call(self.layout.syscall_helper, true, 0, pc);
                let done = self.b();
                self.bind_cond(guest);
                self.emit_indirect_jump(fault_code::CALL_OUT_OF_RANGE, pc);
                let here = self.code.len();
                self.patch_b(done, here)?;
            }
            OpCode::Push => {
                self.stur(ZR, SLOT, 0);
                self.add_imm(DEPTH, DEPTH, 1);
            }
            OpCode::Pop => self.sub_imm(DEPTH, DEPTH, 1),
            OpCode::Const => {
                self.mov_imm(0, operand as u32);
                self.stur(0, SLOT, 0);
                self.add_imm(DEPTH, DEPTH, 1);
            }
            OpCode::Local => {
                self.add_imm(0, PS, operand as u32);
                self.stur(0, SLOT, 0);
                self.add_imm(DEPTH, DEPTH, 1);
            }
            OpCode::Jump => {
                self.ldur(0, SLOT, -4);
                self.sub_imm(DEPTH, DEPTH, 1);
                self.emit_indirect_jump(fault_code::JUMP_OUT_OF_RANGE, pc);
            }
            OpCode::Eq => self.emit_int_branch(COND_EQ, pc, operand, fixups),
            OpCode::Ne => self.emit_int_branch(COND_NE, pc, operand, fixups),
            OpCode::Lti => self.emit_int_branch(COND_LT, pc, operand, fixups),
            OpCode::Lei => self.emit_int_branch(COND_LE, pc, operand, fixups),
            OpCode::Gti => self.emit_int_branch(COND_GT, pc, operand, fixups),
            OpCode::Gei => self.emit_int_branch(COND_GE, pc, operand, fixups),
            OpCode::Ltu => self.emit_int_branch(COND_LO, pc, operand, fixups),
            OpCode::Leu => self.emit_int_branch(COND_LS, pc, operand, fixups),
            OpCode::Gtu => self.emit_int_branch(COND_HI, pc, operand, fixups),
            OpCode::Geu => self.emit_int_branch(COND_HS, pc, operand, fixups),
            // unordered compares set C and V: only `ne` holds for NaN
            OpCode::Eqf => self.emit_float_branch(COND_EQ, pc, operand, fixups),
            OpCode::Nef => self.emit_float_branch(COND_NE, pc, operand, fixups),
            OpCode::Ltf => self.emit_float_branch(COND_MI, pc, operand, fixups),
            OpCode::Lef => self.emit_float_branch(COND_LS, pc, operand, fixups),
            OpCode::Gtf => self.emit_float_branch(COND_GT, pc, operand, fixups),
            OpCode::Gef => self.emit_float_branch(COND_GE, pc, operand, fixups),
            OpCode::Load1 => self.emit_load(LDRB_W),
            OpCode::Load2 => self.emit_load(LDRH_W),
            OpCode::Load4 => self.emit_load(LDR_W),
            OpCode::Store1 => self.emit_store(STRB_W),
            OpCode::Store2 => self.emit_store(STRH_W),
            OpCode::Store4 => self.emit_store(STR_W),
            OpCode::Arg => {
                self.add_imm(1, PS, operand as u8 as u32);
                self.and_mask(1, 1);
                self.ldur(0, SLOT, -4);
                self.data_access(STR_W, 0, 1);
                self.sub_imm(DEPTH, DEPTH, 1);
            }
            OpCode::BlockCopy => {
                self.emit_helper_call(self.layout.block_copy_helper, false, operand as u32, pc);
            }
            OpCode::Sex8 | OpCode::Sex16 => {
                self.ldur(0, SLOT, -4);
                let sbfm = if opcode == OpCode::Sex8 { 0x1300_1C00 } else { 0x1300_3C00 };
                self.word(sbfm);
                self.stur(0, SLOT, -4);
            }
            OpCode::Negi | OpCode::Bcom => {
                self.ldur(0, SLOT, -4);
                let op = if opcode == OpCode::Negi { SUB } else { ORN };
                self.rrr(op, 0, ZR, 0);
                self.stur(0, SLOT, -4);
            }
            OpCode::Add => self.emit_binary(ADD),
            OpCode::Sub => self.emit_binary(SUB),
            OpCode::Muli | OpCode::Mulu => self.emit_binary(0x1B00_7C00),
            OpCode::Band => self.emit_binary(AND),
            OpCode::Bor => self.emit_binary(ORR),
            OpCode::Bxor => self.emit_binary(EOR),
            OpCode::Lsh => self.emit_binary(LSLV),
            OpCode::Rshi => self.emit_binary(ASRV),
            OpCode::Rshu => self.emit_binary(LSRV),
            OpCode::Divi | OpCode::Divu | OpCode::Modi | OpCode::Modu => {
                self.emit_divide(opcode, pc);
            }
            OpCode::Negf => {
                self.ldur(0, SLOT, -4);
                // eor w0, w0, #0x80000000
                self.word(0x5201_0000);
                self.stur(0, SLOT, -4);
            }
            OpCode::Addf => self.emit_float_binary(FADD),
            OpCode::Subf => self.emit_float_binary(FSUB),
            OpCode::Mulf => self.emit_float_binary(FMUL),
            OpCode::Divf => self.emit_float_binary(FDIV),
            OpCode::Cvif => {
                self.ldur(0, SLOT, -4);
                // scvtf s0, w0
                self.word(0x1E22_0000);
                self.stur_s(0, SLOT, -4);
            }
            OpCode::Cvfi => self.emit_cvfi(pc),
        }
        Ok(())
    }

    fn emit_fixup(&mut self, fixup: &Fixup, target_offset: usize) -> Result<(), CompileError> {
        self.patch_b(fixup.at, target_offset)
            .map_err(|_| CompileError::BranchOutOfRange { pc: fixup.source })
    }

    fn finalize(mut self) -> Result<Vec<u8>, CompileError> {
        self.mov_imm(0, 0);
        self.mov_imm(1, fault_code::PC_OUT_OF_RANGE);
        self.mov_imm(2, self.layout.instruction_count);

        let fault_exit = self.code.len();
        self.str_ctx(1, ctx_offset::FAULT_KIND);
        self.str_ctx(2, ctx_offset::FAULT_PC);
        self.str_ctx(0, ctx_offset::FAULT_DETAIL);
        self.mov(0, 1);
        let to_common = self.b();

        let exit = self.code.len();
        self.str_ctx(2, ctx_offset::FAULT_PC);
        self.mov_imm(0, 0);
        let common = self.code.len();
        self.patch_b(to_common, common)?;
        self.str_ctx(DEPTH, ctx_offset::OP_DEPTH);
        self.str_ctx(PS, ctx_offset::PROGRAM_STACK);
        for (pair, slot) in [(23u32, 6u32), (21, 4), (19, 2)] {
            self.word(0xA940_0000 | slot << 15 | (pair + 1) << 10 | ZR << 5 | pair);
        }
        // ldp x29, x30, [sp], #64
        self.word(0xA8C4_7BFD);
        self.word(RET);

        for at in std::mem::take(&mut self.exit_refs) {
            self.patch_b(at, exit)?;
        }
        let stubs = std::mem::take(&mut self.stubs);
        for ((kind, pc), sites) in stubs {
            let stub = self.code.len();
            self.mov_imm(1, kind);
            self.mov_imm(2, pc);
            let back = self.b();
            self.patch_b(back, fault_exit)?;
            for at in sites {
                self.patch_b(at, stub)?;
            }
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::{CallConv, compile_with};
    use crate::wire::{BytecodeImage, ImageParts};

    fn layout(count: u32) -> CompileLayout {
        CompileLayout {
            data_mask: 0xffff,
            stack_bottom: 0x8000,
            stack_limit: 0xfffc,
            instruction_count: count,
            syscall_helper: 0,
            block_copy_helper: 0,
            call_conv: CallConv::SysV,
            max_code_bytes: 1 << 20,
        }
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn rejects_masks_without_a_logical_immediate() {
        let mut bad = layout(1);
        bad.data_mask = 0xff0f;
        assert!(matches!(
            Aarch64Emitter::new(bad),
            Err(CompileError::UnencodableImmediate { .. })
        ));
    }

    #[test]
    fn prologue_saves_frame_and_callee_saved_pairs() {
        let mut emitter = Aarch64Emitter::new(layout(1)).expect("emitter");
        emitter.emit_prologue().expect("prologue");
        let words = words(&emitter.code);
        assert_eq!(words[0], 0xA9BC_7BFD);
        assert_eq!(words[1], 0x9100_03FD);
        // stp x19, x20, [sp, #16]
        assert_eq!(words[2], 0xA901_53F3);
        // mov x19, x0
        assert_eq!(words[5], 0xAA00_03F3);
        // br x16
        assert_eq!(*words.last().expect("words"), 0xD61F_0200);
    }

    #[test]
    fn loads_mask_addresses_before_indexing() {
        let mut emitter = Aarch64Emitter::new(layout(1)).expect("emitter");
        emitter
            .emit_opcode(0, Instruction::simple(OpCode::Load4), &mut Vec::new())
            .expect("load4");
        let words = words(&emitter.code);
        // and w0, w0, #0xffff; ldr w0, [x20, x0]
        let and = 0x1200_0000 | 15 << 10;
        let at = words.iter().position(|w| *w == and).expect("and");
        assert_eq!(words[at + 1], 0xB860_6A80);
    }

    #[test]
    fn branch_fixups_resolve_to_instruction_offsets() {
        let image = BytecodeImage::from_parts(ImageParts {
            instructions: vec![
                Instruction::new(OpCode::Const, 1),
                Instruction::new(OpCode::Const, 1),
                Instruction::new(OpCode::Eq, 0),
            ],
            ..ImageParts::default()
        })
        .expect("image");
        let compiled = compile_with(Aarch64Emitter::new(layout(3)).expect("emitter"), &image, 1 << 20)
            .expect("compile");
        let code = compiled.code();
        let start = compiled.native_offset(2).expect("offset");
        let target = compiled.native_offset(0).expect("offset") as i64;
        // b.ne +8 then b target ends the branch sequence
        let all = words(code);
        let skip = (start / 4..all.len())
            .find(|&i| all[i] == (0x5400_0000 | 2 << 5 | COND_NE))
            .expect("b.ne");
        let b = all[skip + 1];
        assert_eq!(b >> 26, 0b000101);
        let imm = ((b & 0x03ff_ffff) << 6) as i32 >> 6;
        assert_eq!((skip as i64 + 1) * 4 + imm as i64 * 4, target);
    }

    #[test]
    fn operands_live_in_the_stack_array_between_instructions() {
        let mut emitter = Aarch64Emitter::new(layout(2)).expect("emitter");
        let mut fixups = Vec::new();
        for value in [5, 6] {
            emitter
                .emit_opcode(0, Instruction::new(OpCode::Const, value), &mut fixups)
                .expect("const");
        }
        let words = words(&emitter.code);
        // add x9, x21, w22, uxtw #2 starts every instruction
        let slot = 0x8B20_4800 | DEPTH << 16 | OPS << 5 | SLOT;
        assert_eq!(words.iter().filter(|w| **w == slot).count(), 2);
        // mov w0, #6; stur w0, [x9]; add w22, w22, #1
        let at = words
            .iter()
            .position(|w| *w == 0x5280_0000 | 6 << 5)
            .expect("mov");
        assert_eq!(words[at + 1], 0xB800_0000 | SLOT << 5);
        assert_eq!(words[at + 2], 0x1100_0000 | 1 << 10 | DEPTH << 5 | DEPTH);
    }
}
