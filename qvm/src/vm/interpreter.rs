use std::rc::Rc;

use super::bridge::dispatch_syscall;
use super::{ExitState, FaultKind, Instance, OP_STACK_SLOTS, RETURN_SENTINEL, RuntimeFault, VmResult};
use crate::bytecode::OpCode;
use crate::registry::{VmHandle, VmRegistry};

struct OpStack {
    slots: [i32; OP_STACK_SLOTS],
    depth: usize,
}

impl OpStack {
    fn new() -> Self {
        Self {
            slots: [0; OP_STACK_SLOTS],
            depth: 0,
        }
    }

    #[inline]
    fn push(&mut self, value: i32) {
        self.slots[self.depth] = value;
        self.depth += 1;
    }

    #[inline]
    fn pop(&mut self) -> i32 {
        self.depth -= 1;
        self.slots[self.depth]
    }

    #[inline]
    fn top(&mut self) -> &mut i32 {
        &mut self.slots[self.depth - 1]
    }

    fn top_or_zero(&self) -> i32 {
        if self.depth == 0 {
            0
        } else {
            self.slots[self.depth - 1]
        }
    }

    #[inline]
    fn binary(&mut self, op: impl FnOnce(i32, i32) -> i32) {
        let r0 = self.pop();
        let r1 = self.top();
        *r1 = op(*r1, r0);
    }

    #[inline]
    fn binary_float(&mut self, op: impl FnOnce(f32, f32) -> f32) {
        self.binary(|r1, r0| op(as_float(r1), as_float(r0)).to_bits() as i32);
    }
}

#[inline]
fn as_float(word: i32) -> f32 {
    f32::from_bits(word as u32)
}

/// Whether CVFI can represent `bits` as an `i32`: finite and inside
/// `[-2^31, 2^31)`.
#[inline]
pub(crate) fn float_fits_i32(bits: u32) -> bool {
    (bits & 0x7fff_ffff) < 0x4f00_0000 || bits == 0xcf00_0000
}

fn fault(kind: FaultKind, pc: u32) -> RuntimeFault {
    RuntimeFault::new(kind, Some(pc))
}

pub(super) fn run(
    instance: &mut Instance,
    registry: &mut VmRegistry,
    handle: VmHandle,
    start_pc: u32,
    frame: u32,
) -> VmResult<ExitState> {
    let image = Rc::clone(&instance.image);
    let code = image.instructions();
    let count = code.len() as u32;
    let stack_bottom = instance.stack_bottom;
    let stack_span = instance.stack_limit - stack_bottom;
    let in_stack = |program_stack: u32| program_stack.wrapping_sub(stack_bottom) <= stack_span;

    let mut stack = OpStack::new();
    let mut program_stack = frame;
    let mut pc = start_pc;
    let mut budget = instance.budget.unwrap_or(u64::MAX);

    loop {
        let Some(instruction) = code.get(pc as usize).copied() else {
            return Err(fault(FaultKind::PcOutOfRange, pc));
        };
        let opcode = instruction.opcode;
        let operand = instruction.operand;

        let (pops, pushes) = opcode.stack_effect();
        if stack.depth < pops as usize {
            return Err(fault(FaultKind::OpStackUnderflow, pc));
        }
        if stack.depth - pops as usize + pushes as usize > OP_STACK_SLOTS {
            return Err(fault(FaultKind::OpStackOverflow, pc));
        }
        if opcode.is_control_transfer() {
            if budget == 0 {
                return Err(fault(FaultKind::BudgetExhausted, pc));
            }
            budget -= 1;
        }

        let memory = &mut instance.memory;
        let mut next = pc + 1;
        match opcode {
            OpCode::Undef => return Err(fault(FaultKind::InvalidOpcode(0), pc)),
            OpCode::Ignore => {}
            OpCode::Break => instance.break_count += 1,
            OpCode::Enter => {
                program_stack = program_stack.wrapping_sub(operand as u32);
                if !in_stack(program_stack) {
                    return Err(fault(
                        FaultKind::ProgramStackOutOfRange { program_stack },
                        pc,
                    ));
                }
            }
            OpCode::Leave => {
                program_stack = program_stack.wrapping_add(operand as u32);
                if !in_stack(program_stack) {
                    return Err(fault(
                        FaultKind::ProgramStackOutOfRange { program_stack },
                        pc,
                    ));
                }
                let target = memory.read_i32(program_stack);
                if target == RETURN_SENTINEL {
                    return Ok(ExitState {
                        value: stack.top_or_zero(),
                        depth: stack.depth,
                        program_stack,
                        pc,
                    });
                }
                if target < 0 || target as u32 >= count {
                    return Err(fault(FaultKind::ReturnOutOfRange(target), pc));
                }
                next = target as u32;
            }
            OpCode::Call => {
                let target = stack.pop();
                memory.write_i32(program_stack, next as i32);
                if target < 0 {
                    let result =
                        dispatch_syscall(instance, registry, handle, program_stack, target)
                            .map_err(|err| err.at(pc))?;
                    stack.push(result);
                } else if target as u32 >= count {
                    return Err(fault(FaultKind::CallOutOfRange(target), pc));
                } else {
                    next = target as u32;
                }
            }
            OpCode::Push => stack.push(0),
            OpCode::Pop => {
                stack.pop();
            }
            OpCode::Const => stack.push(operand),
            OpCode::Local => stack.push(program_stack.wrapping_add(operand as u32) as i32),
            OpCode::Jump => {
                let target = stack.pop();
                if target < 0 || target as u32 >= count {
                    return Err(fault(FaultKind::JumpOutOfRange(target), pc));
                }
                next = target as u32;
            }
            OpCode::Eq
            | OpCode::Ne
            | OpCode::Lti
            | OpCode::Lei
            | OpCode::Gti
            | OpCode::Gei
            | OpCode::Ltu
            | OpCode::Leu
            | OpCode::Gtu
            | OpCode::Geu
            | OpCode::Eqf
            | OpCode::Nef
            | OpCode::Ltf
            | OpCode::Lef
            | OpCode::Gtf
            | OpCode::Gef => {
                let r0 = stack.pop();
                let r1 = stack.pop();
                if branch_taken(opcode, r1, r0) {
                    next = operand as u32;
                }
            }
            OpCode::Load1 => {
                let top = stack.top();
                *top = memory.load_u8(*top as u32) as i32;
            }
            OpCode::Load2 => {
                let top = stack.top();
                *top = memory.load_u16(*top as u32) as i32;
            }
            OpCode::Load4 => {
                let top = stack.top();
                *top = memory.load_u32(*top as u32) as i32;
            }
            OpCode::Store1 => {
                let value = stack.pop();
                let addr = stack.pop();
                memory.store_u8(addr as u32, value as u8);
            }
            OpCode::Store2 => {
                let value = stack.pop();
                let addr = stack.pop();
                memory.store_u16(addr as u32, value as u16);
            }
            OpCode::Store4 => {
                let value = stack.pop();
                let addr = stack.pop();
                memory.store_u32(addr as u32, value as u32);
            }
            OpCode::Arg => {
                let value = stack.pop();
                let offset = operand as u8 as u32;
                memory.write_i32(program_stack.wrapping_add(offset), value);
            }
            OpCode::BlockCopy => {
                let src = stack.pop();
                let dest = stack.pop();
                memory
                    .block_copy(dest as u32, src as u32, operand as u32)
                    .map_err(|kind| fault(kind, pc))?;
            }
            OpCode::Sex8 => {
                let top = stack.top();
                *top = *top as i8 as i32;
            }
            OpCode::Sex16 => {
                let top = stack.top();
                *top = *top as i16 as i32;
            }
            OpCode::Negi => {
                let top = stack.top();
                *top = top.wrapping_neg();
            }
            OpCode::Add => stack.binary(i32::wrapping_add),
            OpCode::Sub => stack.binary(i32::wrapping_sub),
            OpCode::Divi | OpCode::Divu | OpCode::Modi | OpCode::Modu => {
                if *stack.top() == 0 {
                    return Err(fault(FaultKind::DivideByZero, pc));
                }
                match opcode {
                    OpCode::Divi => stack.binary(i32::wrapping_div),
                    OpCode::Modi => stack.binary(i32::wrapping_rem),
                    OpCode::Divu => stack.binary(|r1, r0| (r1 as u32 / r0 as u32) as i32),
                    _ => stack.binary(|r1, r0| (r1 as u32 % r0 as u32) as i32),
                }
            }
            OpCode::Muli | OpCode::Mulu => stack.binary(i32::wrapping_mul),
            OpCode::Band => stack.binary(|r1, r0| r1 & r0),
            OpCode::Bor => stack.binary(|r1, r0| r1 | r0),
            OpCode::Bxor => stack.binary(|r1, r0| r1 ^ r0),
            OpCode::Bcom => {
                let top = stack.top();
                *top = !*top;
            }
            OpCode::Lsh => stack.binary(|r1, r0| r1.wrapping_shl(r0 as u32)),
            OpCode::Rshi => stack.binary(|r1, r0| r1.wrapping_shr(r0 as u32)),
            OpCode::Rshu => stack.binary(|r1, r0| (r1 as u32).wrapping_shr(r0 as u32) as i32),
            OpCode::Negf => {
                let top = stack.top();
                *top ^= i32::MIN;
            }
            OpCode::Addf => stack.binary_float(|r1, r0| r1 + r0),
            OpCode::Subf => stack.binary_float(|r1, r0| r1 - r0),
            OpCode::Divf => stack.binary_float(|r1, r0| r1 / r0),
            OpCode::Mulf => stack.binary_float(|r1, r0| r1 * r0),
            OpCode::Cvif => {
                let top = stack.top();
                *top = (*top as f32).to_bits() as i32;
            }
            OpCode::Cvfi => {
                let top = stack.top();
                if !float_fits_i32(*top as u32) {
                    return Err(fault(FaultKind::BadFloatOp, pc));
                }
                *top = as_float(*top) as i32;
            }
        }
        pc = next;
    }
}

/// Compares `r1` (second from top) against `r0` (top).
pub(crate) fn branch_taken(opcode: OpCode, r1: i32, r0: i32) -> bool {
    let (f1, f0) = (as_float(r1), as_float(r0));
    match opcode {
        OpCode::Eq => r1 == r0,
        OpCode::Ne => r1 != r0,
        OpCode::Lti => r1 < r0,
        OpCode::Lei => r1 <= r0,
        OpCode::Gti => r1 > r0,
        OpCode::Gei => r1 >= r0,
        OpCode::Ltu => (r1 as u32) < r0 as u32,
        OpCode::Leu => r1 as u32 <= r0 as u32,
        OpCode::Gtu => r1 as u32 > r0 as u32,
        OpCode::Geu => r1 as u32 >= r0 as u32,
        OpCode::Eqf => f1 == f0,
        OpCode::Nef => f1 != f0,
        OpCode::Ltf => f1 < f0,
        OpCode::Lef => f1 <= f0,
        OpCode::Gtf => f1 > f0,
        OpCode::Gef => f1 >= f0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_branches_follow_ieee_unordered_rules() {
        let nan = f32::NAN.to_bits() as i32;
        let one = 1.0f32.to_bits() as i32;
        assert!(!branch_taken(OpCode::Eqf, nan, nan));
        assert!(branch_taken(OpCode::Nef, nan, one));
        assert!(!branch_taken(OpCode::Ltf, nan, one));
        assert!(!branch_taken(OpCode::Gef, one, nan));
        assert!(branch_taken(OpCode::Lef, one, one));
    }

    #[test]
    fn unsigned_branches_reinterpret_bits() {
        assert!(branch_taken(OpCode::Gtu, -1, 1));
        assert!(!branch_taken(OpCode::Gti, -1, 1));
        assert!(branch_taken(OpCode::Ltu, 0, -1));
    }

    #[test]
    fn cvfi_range_matches_i32() {
        assert!(float_fits_i32((-2147483648.0f32).to_bits()));
        assert!(!float_fits_i32(2147483648.0f32.to_bits()));
        assert!(float_fits_i32(2147483520.0f32.to_bits()));
        assert!(!float_fits_i32(f32::NAN.to_bits()));
        assert!(!float_fits_i32(f32::NEG_INFINITY.to_bits()));
        assert!(float_fits_i32((-0.5f32).to_bits()));
    }
}
