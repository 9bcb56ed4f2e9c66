#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Undef = 0,
    Ignore = 1,
    Break = 2,
    Enter = 3,
    Leave = 4,
    Call = 5,
    Push = 6,
    Pop = 7,
    Const = 8,
    Local = 9,
    Jump = 10,
    Eq = 11,
    Ne = 12,
    Lti = 13,
    Lei = 14,
    Gti = 15,
    Gei = 16,
    Ltu = 17,
    Leu = 18,
    Gtu = 19,
    Geu = 20,
    Eqf = 21,
    Nef = 22,
    Ltf = 23,
    Lef = 24,
    Gtf = 25,
    Gef = 26,
    Load1 = 27,
    Load2 = 28,
    Load4 = 29,
    Store1 = 30,
    Store2 = 31,
    Store4 = 32,
    Arg = 33,
    BlockCopy = 34,
    Sex8 = 35,
    Sex16 = 36,
    Negi = 37,
    Add = 38,
    Sub = 39,
    Divi = 40,
    Divu = 41,
    Modi = 42,
    Modu = 43,
    Muli = 44,
    Mulu = 45,
    Band = 46,
    Bor = 47,
    Bxor = 48,
    Bcom = 49,
    Lsh = 50,
    Rshi = 51,
    Rshu = 52,
    Negf = 53,
    Addf = 54,
    Subf = 55,
    Divf = 56,
    Mulf = 57,
    Cvif = 58,
    Cvfi = 59,
}

/// Width of the immediate that follows an opcode byte in the code segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Byte,
    Word,
}

impl OperandKind {
    pub fn encoded_len(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Byte => 1,
            OperandKind::Word => 4,
        }
    }
}

pub const OPCODE_COUNT: usize = 60;

const ALL_OPCODES: [OpCode; OPCODE_COUNT] = [
    OpCode::Undef,
    OpCode::Ignore,
    OpCode::Break,
    OpCode::Enter,
    OpCode::Leave,
    OpCode::Call,
    OpCode::Push,
    OpCode::Pop,
    OpCode::Const,
    OpCode::Local,
    OpCode::Jump,
    OpCode::Eq,
    OpCode::Ne,
    OpCode::Lti,
    OpCode::Lei,
    OpCode::Gti,
    OpCode::Gei,
    OpCode::Ltu,
    OpCode::Leu,
    OpCode::Gtu,
    OpCode::Geu,
    OpCode::Eqf,
    OpCode::Nef,
    OpCode::Ltf,
    OpCode::Lef,
    OpCode::Gtf,
    OpCode::Gef,
    OpCode::Load1,
    OpCode::Load2,
    OpCode::Load4,
    OpCode::Store1,
    OpCode::Store2,
    OpCode::Store4,
    OpCode::Arg,
    OpCode::BlockCopy,
    OpCode::Sex8,
    OpCode::Sex16,
    OpCode::Negi,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Divi,
    OpCode::Divu,
    OpCode::Modi,
    OpCode::Modu,
    OpCode::Muli,
    OpCode::Mulu,
    OpCode::Band,
    OpCode::Bor,
    OpCode::Bxor,
    OpCode::Bcom,
    OpCode::Lsh,
    OpCode::Rshi,
    OpCode::Rshu,
    OpCode::Negf,
    OpCode::Addf,
    OpCode::Subf,
    OpCode::Divf,
    OpCode::Mulf,
    OpCode::Cvif,
    OpCode::Cvfi,
];

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        ALL_OPCODES.get(byte as usize).copied()
    }

    pub fn all() -> &'static [OpCode] {
        &ALL_OPCODES
    }

    pub fn operand_kind(self) -> OperandKind {
        match self {
            OpCode::Enter
            | OpCode::Leave
            | OpCode::Const
            | OpCode::Local
            | OpCode::BlockCopy => OperandKind::Word,
            OpCode::Arg => OperandKind::Byte,
            op if op.is_branch() => OperandKind::Word,
            _ => OperandKind::None,
        }
    }

    /// Conditional branches carry their target instruction index inline.
    pub fn is_branch(self) -> bool {
        (OpCode::Eq as u8..=OpCode::Gef as u8).contains(&(self as u8))
    }

    pub fn is_float_branch(self) -> bool {
        (OpCode::Eqf as u8..=OpCode::Gef as u8).contains(&(self as u8))
    }

    /// Instructions charged against the per-call budget. LEAVE counts
    /// because returning to a stored address is a jump the guest controls.
    pub fn is_control_transfer(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::Call | OpCode::Leave) || self.is_branch()
    }

    /// Operand stack slots consumed and produced. `Call` pops its target; the
    /// result is pushed by the callee (or by the syscall bridge).
    pub fn stack_effect(self) -> (u8, u8) {
        match self {
            OpCode::Undef
            | OpCode::Ignore
            | OpCode::Break
            | OpCode::Enter
            | OpCode::Leave => (0, 0),
            OpCode::Call | OpCode::Pop | OpCode::Jump | OpCode::Arg => (1, 0),
            OpCode::Push | OpCode::Const | OpCode::Local => (0, 1),
            op if op.is_branch() => (2, 0),
            OpCode::Store1 | OpCode::Store2 | OpCode::Store4 | OpCode::BlockCopy => (2, 0),
            OpCode::Load1
            | OpCode::Load2
            | OpCode::Load4
            | OpCode::Sex8
            | OpCode::Sex16
            | OpCode::Negi
            | OpCode::Bcom
            | OpCode::Negf
            | OpCode::Cvif
            | OpCode::Cvfi => (1, 1),
            _ => (2, 1),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Undef => "undef",
            OpCode::Ignore => "ignore",
            OpCode::Break => "break",
            OpCode::Enter => "enter",
            OpCode::Leave => "leave",
            OpCode::Call => "call",
            OpCode::Push => "push",
            OpCode::Pop => "pop",
            OpCode::Const => "const",
            OpCode::Local => "local",
            OpCode::Jump => "jump",
            OpCode::Eq => "eq",
            OpCode::Ne => "ne",
            OpCode::Lti => "lti",
            OpCode::Lei => "lei",
            OpCode::Gti => "gti",
            OpCode::Gei => "gei",
            OpCode::Ltu => "ltu",
            OpCode::Leu => "leu",
            OpCode::Gtu => "gtu",
            OpCode::Geu => "geu",
            OpCode::Eqf => "eqf",
            OpCode::Nef => "nef",
            OpCode::Ltf => "ltf",
            OpCode::Lef => "lef",
            OpCode::Gtf => "gtf",
            OpCode::Gef => "gef",
            OpCode::Load1 => "load1",
            OpCode::Load2 => "load2",
            OpCode::Load4 => "load4",
            OpCode::Store1 => "store1",
            OpCode::Store2 => "store2",
            OpCode::Store4 => "store4",
            OpCode::Arg => "arg",
            OpCode::BlockCopy => "block_copy",
            OpCode::Sex8 => "sex8",
            OpCode::Sex16 => "sex16",
            OpCode::Negi => "negi",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Divi => "divi",
            OpCode::Divu => "divu",
            OpCode::Modi => "modi",
            OpCode::Modu => "modu",
            OpCode::Muli => "muli",
            OpCode::Mulu => "mulu",
            OpCode::Band => "band",
            OpCode::Bor => "bor",
            OpCode::Bxor => "bxor",
            OpCode::Bcom => "bcom",
            OpCode::Lsh => "lsh",
            OpCode::Rshi => "rshi",
            OpCode::Rshu => "rshu",
            OpCode::Negf => "negf",
            OpCode::Addf => "addf",
            OpCode::Subf => "subf",
            OpCode::Divf => "divf",
            OpCode::Mulf => "mulf",
            OpCode::Cvif => "cvif",
            OpCode::Cvfi => "cvfi",
        }
    }

    pub fn parse_mnemonic(op: &str) -> Option<Self> {
        ALL_OPCODES
            .iter()
            .copied()
            .find(|opcode| opcode.mnemonic() == op)
    }
}

/// A decoded instruction. `operand` is zero for opcodes without an immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub operand: i32,
}

impl Instruction {
    pub fn new(opcode: OpCode, operand: i32) -> Self {
        Self { opcode, operand }
    }

    pub fn simple(opcode: OpCode) -> Self {
        Self { opcode, operand: 0 }
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.opcode.operand_kind().encoded_len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode as u8);
        match self.opcode.operand_kind() {
            OperandKind::None => {}
            OperandKind::Byte => out.push(self.operand as u8),
            OperandKind::Word => out.extend_from_slice(&self.operand.to_le_bytes()),
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.opcode.operand_kind() {
            OperandKind::None => write!(f, "{}", self.opcode.mnemonic()),
            _ => write!(f, "{} {}", self.opcode.mnemonic(), self.operand),
        }
    }
}
