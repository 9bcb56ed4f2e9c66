use std::collections::BTreeSet;
use std::fmt::Write;

use crate::bytecode::{Instruction, OpCode, OperandKind};

pub const IMAGE_MAGIC: u32 = 0x1272_1444;
pub const VERSION_V1: u32 = 1;
pub const VERSION_V2: u32 = 2;
const HEADER_LEN_V1: usize = 32;
const HEADER_LEN_V2: usize = 36;
const MAX_CODE_PADDING: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    BadMagic(u32),
    VersionMismatch {
        found: u32,
    },
    TruncatedSection {
        section: &'static str,
        offset: usize,
        length: usize,
        available: usize,
    },
    SizeOverflow {
        what: &'static str,
    },
    CodeSizeMismatch {
        instruction_count: u32,
        code_length: u32,
        consumed: usize,
    },
    InvalidOpcode {
        instruction: u32,
        offset: usize,
        opcode: u8,
    },
    InvalidJumpTarget {
        source: Option<u32>,
        target: i64,
    },
    InvalidEntry {
        entry: u32,
        instruction_count: u32,
    },
    TrailingBytes {
        count: usize,
    },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::BadMagic(found) => {
                write!(f, "bad magic {found:#010x}, expected {IMAGE_MAGIC:#010x}")
            }
            LoadError::VersionMismatch { found } => {
                write!(f, "unsupported image version {found}")
            }
            LoadError::TruncatedSection {
                section,
                offset,
                length,
                available,
            } => write!(
                f,
                "truncated {section} section at offset {offset}: need {length} bytes, {available} available",
            ),
            LoadError::SizeOverflow { what } => write!(f, "{what} exceeds the sandbox address space"),
            LoadError::CodeSizeMismatch {
                instruction_count,
                code_length,
                consumed,
            } => write!(
                f,
                "{instruction_count} instructions do not fit the {code_length}-byte code segment (decoded {consumed} bytes)",
            ),
            LoadError::InvalidOpcode {
                instruction,
                offset,
                opcode,
            } => write!(
                f,
                "invalid opcode {opcode:#04x} for instruction {instruction} at code offset {offset}",
            ),
            LoadError::InvalidJumpTarget {
                source: Some(source),
                target,
            } => write!(
                f,
                "invalid jump target {target} referenced by instruction {source}"
            ),
            LoadError::InvalidJumpTarget {
                source: None,
                target,
            } => write!(f, "invalid jump table entry {target}"),
            LoadError::InvalidEntry {
                entry,
                instruction_count,
            } => write!(
                f,
                "entry point {entry} is outside {instruction_count} instructions"
            ),
            LoadError::TrailingBytes { count } => {
                write!(f, "{count} trailing bytes after image payload")
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// Sections of an image assembled in memory, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParts {
    pub version: u32,
    pub instructions: Vec<Instruction>,
    pub data: Vec<u8>,
    pub lit: Vec<u8>,
    pub bss_length: u32,
    pub entry: u32,
    pub jump_targets: Vec<u32>,
}

impl Default for ImageParts {
    fn default() -> Self {
        Self {
            version: VERSION_V2,
            instructions: Vec::new(),
            data: Vec::new(),
            lit: Vec::new(),
            bss_length: 0,
            entry: 0,
            jump_targets: Vec::new(),
        }
    }
}

/// A validated program image. Construction goes through `decode_image` or
/// `BytecodeImage::from_parts`, so every static control target is in range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytecodeImage {
    version: u32,
    instructions: Vec<Instruction>,
    instruction_offsets: Vec<u32>,
    code_length: u32,
    data: Vec<u8>,
    lit: Vec<u8>,
    bss_length: u32,
    entry: u32,
    jump_targets: Vec<u32>,
}

impl BytecodeImage {
    pub fn from_parts(parts: ImageParts) -> Result<Self, LoadError> {
        let mut instruction_offsets = Vec::with_capacity(parts.instructions.len());
        let mut offset = 0usize;
        for instruction in &parts.instructions {
            instruction_offsets.push(
                u32::try_from(offset).map_err(|_| LoadError::SizeOverflow { what: "code" })?,
            );
            offset += instruction.encoded_len();
        }
        let code_length =
            u32::try_from(offset).map_err(|_| LoadError::SizeOverflow { what: "code" })?;
        Self::validated(parts, instruction_offsets, code_length)
    }

    fn validated(
        parts: ImageParts,
        instruction_offsets: Vec<u32>,
        code_length: u32,
    ) -> Result<Self, LoadError> {
        if parts.version != VERSION_V1 && parts.version != VERSION_V2 {
            return Err(LoadError::VersionMismatch {
                found: parts.version,
            });
        }
        if parts.version == VERSION_V1 && !parts.jump_targets.is_empty() {
            return Err(LoadError::VersionMismatch {
                found: parts.version,
            });
        }
        let count = i32::try_from(parts.instructions.len())
            .map_err(|_| LoadError::SizeOverflow { what: "instruction count" })?;
        sandbox_extent(parts.data.len(), parts.lit.len(), parts.bss_length)?;

        let in_range = |target: i64| target >= 0 && target < count as i64;
        for (index, instruction) in parts.instructions.iter().enumerate() {
            let source = Some(index as u32);
            if instruction.opcode.is_branch() && !in_range(instruction.operand as i64) {
                return Err(LoadError::InvalidJumpTarget {
                    source,
                    target: instruction.operand as i64,
                });
            }
            if instruction.opcode != OpCode::Const {
                continue;
            }
            let static_target = match parts.instructions.get(index + 1).map(|next| next.opcode) {
                Some(OpCode::Jump) => true,
                Some(OpCode::Call) => instruction.operand >= 0,
                _ => false,
            };
            if static_target && !in_range(instruction.operand as i64) {
                return Err(LoadError::InvalidJumpTarget {
                    source,
                    target: instruction.operand as i64,
                });
            }
        }
        for target in &parts.jump_targets {
            if !in_range(*target as i64) {
                return Err(LoadError::InvalidJumpTarget {
                    source: None,
                    target: *target as i64,
                });
            }
        }
        if !in_range(parts.entry as i64) {
            return Err(LoadError::InvalidEntry {
                entry: parts.entry,
                instruction_count: count as u32,
            });
        }

        Ok(Self {
            version: parts.version,
            instructions: parts.instructions,
            instruction_offsets,
            code_length,
            data: parts.data,
            lit: parts.lit,
            bss_length: parts.bss_length,
            entry: parts.entry,
            jump_targets: parts.jump_targets,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instruction(&self, pc: u32) -> Option<Instruction> {
        self.instructions.get(pc as usize).copied()
    }

    pub fn instruction_count(&self) -> u32 {
        self.instructions.len() as u32
    }

    /// Byte offset of each instruction within the code segment.
    pub fn instruction_offsets(&self) -> &[u32] {
        &self.instruction_offsets
    }

    pub fn code_length(&self) -> u32 {
        self.code_length
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn lit(&self) -> &[u8] {
        &self.lit
    }

    pub fn bss_length(&self) -> u32 {
        self.bss_length
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn jump_targets(&self) -> &[u32] {
        &self.jump_targets
    }

    /// Bytes occupied by data, lit and bss at the bottom of the sandbox.
    pub fn static_extent(&self) -> u64 {
        self.data.len() as u64 + self.lit.len() as u64 + self.bss_length as u64
    }

    /// Every instruction index that some static control transfer or the
    /// entry point can reach.
    pub fn static_targets(&self) -> BTreeSet<u32> {
        let mut targets = BTreeSet::new();
        targets.insert(self.entry);
        targets.extend(self.jump_targets.iter().copied());
        for (index, instruction) in self.instructions.iter().enumerate() {
            if instruction.opcode.is_branch() {
                targets.insert(instruction.operand as u32);
                continue;
            }
            if instruction.opcode == OpCode::Const && instruction.operand >= 0 {
                if let Some(OpCode::Jump | OpCode::Call) =
                    self.instructions.get(index + 1).map(|next| next.opcode)
                {
                    targets.insert(instruction.operand as u32);
                }
            }
        }
        targets
    }

    pub fn into_parts(self) -> ImageParts {
        ImageParts {
            version: self.version,
            instructions: self.instructions,
            data: self.data,
            lit: self.lit,
            bss_length: self.bss_length,
            entry: self.entry,
            jump_targets: self.jump_targets,
        }
    }
}

fn sandbox_extent(data: usize, lit: usize, bss: u32) -> Result<u32, LoadError> {
    let data = u32::try_from(data).map_err(|_| LoadError::SizeOverflow { what: "data section" })?;
    let lit = u32::try_from(lit).map_err(|_| LoadError::SizeOverflow { what: "lit section" })?;
    data.checked_add(lit)
        .and_then(|total| total.checked_add(bss))
        .filter(|total| *total <= i32::MAX as u32)
        .ok_or(LoadError::SizeOverflow {
            what: "data, lit and bss sections",
        })
}

pub fn decode_image(bytes: &[u8]) -> Result<BytecodeImage, LoadError> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.read_u32("header")?;
    if magic != IMAGE_MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let version = cursor.read_u32("header")?;
    if version != VERSION_V1 && version != VERSION_V2 {
        return Err(LoadError::VersionMismatch { found: version });
    }

    let instruction_count = cursor.read_u32("header")?;
    let code_length = cursor.read_u32("header")?;
    let data_length = cursor.read_u32("header")?;
    let lit_length = cursor.read_u32("header")?;
    let bss_length = cursor.read_u32("header")?;
    let entry = cursor.read_u32("header")?;
    let jump_target_count = if version >= VERSION_V2 {
        cursor.read_u32("header")?
    } else {
        0
    };
    debug_assert_eq!(
        cursor.offset,
        if version >= VERSION_V2 {
            HEADER_LEN_V2
        } else {
            HEADER_LEN_V1
        }
    );

    // every instruction takes at least its opcode byte
    if instruction_count > code_length {
        return Err(LoadError::CodeSizeMismatch {
            instruction_count,
            code_length,
            consumed: 0,
        });
    }
    let code = cursor.read_section("code", code_length as usize)?;
    let (instructions, instruction_offsets) = decode_code(code, instruction_count, code_length)?;
    let data = cursor.read_section("data", data_length as usize)?.to_vec();
    let lit = cursor.read_section("lit", lit_length as usize)?.to_vec();

    let table_bytes = (jump_target_count as usize)
        .checked_mul(4)
        .ok_or(LoadError::SizeOverflow { what: "jump table" })?;
    let table = cursor.read_section("jump table", table_bytes)?;
    let jump_targets = table
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if !cursor.is_eof() {
        return Err(LoadError::TrailingBytes {
            count: cursor.remaining(),
        });
    }

    BytecodeImage::validated(
        ImageParts {
            version,
            instructions,
            data,
            lit,
            bss_length,
            entry,
            jump_targets,
        },
        instruction_offsets,
        code_length,
    )
}

fn decode_code(
    code: &[u8],
    instruction_count: u32,
    code_length: u32,
) -> Result<(Vec<Instruction>, Vec<u32>), LoadError> {
    let mismatch = |consumed| LoadError::CodeSizeMismatch {
        instruction_count,
        code_length,
        consumed,
    };
    let mut instructions = Vec::with_capacity(instruction_count as usize);
    let mut offsets = Vec::with_capacity(instruction_count as usize);
    let mut offset = 0usize;
    for index in 0..instruction_count {
        let start = offset;
        let byte = read_u8(code, &mut offset).ok_or_else(|| mismatch(start))?;
        let opcode = OpCode::from_byte(byte).ok_or(LoadError::InvalidOpcode {
            instruction: index,
            offset: start,
            opcode: byte,
        })?;
        let operand = match opcode.operand_kind() {
            OperandKind::None => 0,
            OperandKind::Byte => read_u8(code, &mut offset).ok_or_else(|| mismatch(start))? as i32,
            OperandKind::Word => read_u32(code, &mut offset).ok_or_else(|| mismatch(start))? as i32,
        };
        offsets.push(start as u32);
        instructions.push(Instruction::new(opcode, operand));
    }
    if code.len() - offset > MAX_CODE_PADDING {
        return Err(mismatch(offset));
    }
    Ok((instructions, offsets))
}

pub fn encode_image(image: &BytecodeImage) -> Vec<u8> {
    let mut code = Vec::with_capacity(image.code_length as usize);
    for instruction in &image.instructions {
        instruction.encode_into(&mut code);
    }
    // keep whatever alignment padding the image was decoded with
    code.resize(image.code_length as usize, 0);

    let header_len = if image.version >= VERSION_V2 {
        HEADER_LEN_V2
    } else {
        HEADER_LEN_V1
    };
    let mut out = Vec::with_capacity(
        header_len + code.len() + image.data.len() + image.lit.len() + image.jump_targets.len() * 4,
    );
    out.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    out.extend_from_slice(&image.version.to_le_bytes());
    out.extend_from_slice(&image.instruction_count().to_le_bytes());
    out.extend_from_slice(&(code.len() as u32).to_le_bytes());
    out.extend_from_slice(&(image.data.len() as u32).to_le_bytes());
    out.extend_from_slice(&(image.lit.len() as u32).to_le_bytes());
    out.extend_from_slice(&image.bss_length.to_le_bytes());
    out.extend_from_slice(&image.entry.to_le_bytes());
    if image.version >= VERSION_V2 {
        out.extend_from_slice(&(image.jump_targets.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(&code);
    out.extend_from_slice(&image.data);
    out.extend_from_slice(&image.lit);
    if image.version >= VERSION_V2 {
        for target in &image.jump_targets {
            out.extend_from_slice(&target.to_le_bytes());
        }
    }
    out
}

pub fn disassemble_bytes(bytes: &[u8]) -> Result<String, LoadError> {
    let image = decode_image(bytes)?;
    Ok(disassemble_image(&image))
}

pub fn disassemble_image(image: &BytecodeImage) -> String {
    let mut out = String::new();
    let _ = writeln!(
        &mut out,
        "image v{} ({} instructions, {} code bytes, entry {})",
        image.version,
        image.instruction_count(),
        image.code_length,
        image.entry
    );
    let _ = writeln!(
        &mut out,
        "data {} bytes, lit {} bytes, bss {} bytes, {} jump targets",
        image.data.len(),
        image.lit.len(),
        image.bss_length,
        image.jump_targets.len()
    );
    let _ = writeln!(&mut out, "code:");
    let targets = image.static_targets();
    for pc in 0..image.instruction_count() {
        let marker = if pc == image.entry {
            '>'
        } else if targets.contains(&pc) {
            '*'
        } else {
            ' '
        };
        let _ = writeln!(&mut out, "{marker}{}", format_instruction(image, pc).unwrap_or_default());
    }
    out
}

/// One disassembly line: instruction index, code offset, raw bytes, mnemonic.
pub fn format_instruction(image: &BytecodeImage, pc: u32) -> Option<String> {
    let instruction = image.instruction(pc)?;
    let offset = image.instruction_offsets.get(pc as usize).copied()?;
    let mut encoded = Vec::with_capacity(instruction.encoded_len());
    instruction.encode_into(&mut encoded);
    let mut line = format!(
        "{pc:04} {offset:06x}\t{:<14}\t{instruction}",
        format_hex_bytes(&encoded)
    );
    if let Some(note) = describe_call_target(image, pc) {
        let _ = write!(&mut line, "\t; {note}");
    }
    Some(line)
}

fn describe_call_target(image: &BytecodeImage, pc: u32) -> Option<String> {
    let instruction = image.instruction(pc)?;
    if instruction.opcode != OpCode::Const {
        return None;
    }
    match image.instruction(pc + 1)?.opcode {
        OpCode::Call if instruction.operand < 0 => {
            Some(format!("trap {}", -1 - instruction.operand as i64))
        }
        OpCode::Call => Some(format!("call {}", instruction.operand)),
        OpCode::Jump => Some(format!("jump {}", instruction.operand)),
        _ => None,
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_u32(&mut self, section: &'static str) -> Result<u32, LoadError> {
        let bytes = self.read_exact_array::<4>(section)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_exact_array<const N: usize>(
        &mut self,
        section: &'static str,
    ) -> Result<[u8; N], LoadError> {
        let bytes = self.read_section(section, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_section(&mut self, section: &'static str, len: usize) -> Result<&'a [u8], LoadError> {
        let truncated = LoadError::TruncatedSection {
            section,
            offset: self.offset,
            length: len,
            available: self.remaining(),
        };
        let end = self.offset.checked_add(len).ok_or(truncated.clone())?;
        if end > self.bytes.len() {
            return Err(truncated);
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_eof(&self) -> bool {
        self.offset == self.bytes.len()
    }
}

fn read_u8(code: &[u8], ip: &mut usize) -> Option<u8> {
    let value = *code.get(*ip)?;
    *ip += 1;
    Some(value)
}

fn read_u32(code: &[u8], ip: &mut usize) -> Option<u32> {
    let bytes = code.get(*ip..(*ip + 4))?;
    *ip += 4;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn format_hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (idx, byte) in bytes.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{byte:02X}");
    }
    out
}
