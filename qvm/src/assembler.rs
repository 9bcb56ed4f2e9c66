use std::collections::HashMap;

use crate::bytecode::{Instruction, OpCode, OperandKind};
use crate::wire::{
    BytecodeImage, IMAGE_MAGIC, ImageParts, LoadError, VERSION_V1, VERSION_V2, encode_image,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataSection {
    Data,
    Lit,
    Bss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    DuplicateLabel(String),
    UnknownLabel(String),
    /// A code label used where a sandbox address is needed, or the reverse.
    WrongLabelKind(String),
    BssInitializer,
    Load(LoadError),
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblerError::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AssemblerError::UnknownLabel(name) => write!(f, "unknown label '{name}'"),
            AssemblerError::WrongLabelKind(name) => {
                write!(f, "label '{name}' cannot be used here")
            }
            AssemblerError::BssInitializer => write!(f, "bss cannot hold initialized bytes"),
            AssemblerError::Load(err) => write!(f, "assembled image is invalid: {err}"),
        }
    }
}

impl std::error::Error for AssemblerError {}

impl From<LoadError> for AssemblerError {
    fn from(value: LoadError) -> Self {
        AssemblerError::Load(value)
    }
}

#[derive(Clone, Copy, Debug)]
enum Label {
    Code(u32),
    Data(DataSection, u32),
}

enum FixupSite {
    /// Operand of the instruction at this index.
    Instruction(usize),
    /// A word inside an initialized section.
    Word(DataSection, usize),
}

struct Fixup {
    site: FixupSite,
    label: String,
    /// Branch operands and jump tables only accept code labels.
    code_only: bool,
}

/// Builds a validated image from instructions and section contents.
/// Label operands are resolved in `finish`: code labels become instruction
/// indices, section labels become sandbox addresses (data at 0, then lit,
/// then bss).
pub struct Assembler {
    instructions: Vec<Instruction>,
    data: Vec<u8>,
    lit: Vec<u8>,
    bss_length: u32,
    labels: HashMap<String, Label>,
    fixups: Vec<Fixup>,
    entry: Option<String>,
    jump_targets: Vec<String>,
    version: Option<u32>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            data: Vec::new(),
            lit: Vec::new(),
            bss_length: 0,
            labels: HashMap::new(),
            fixups: Vec::new(),
            entry: None,
            jump_targets: Vec::new(),
            version: None,
        }
    }

    /// Index of the next instruction.
    pub fn position(&self) -> u32 {
        self.instructions.len() as u32
    }

    pub fn section_len(&self, section: DataSection) -> u32 {
        match section {
            DataSection::Data => self.data.len() as u32,
            DataSection::Lit => self.lit.len() as u32,
            DataSection::Bss => self.bss_length,
        }
    }

    pub fn label(&mut self, name: &str) -> Result<(), AssemblerError> {
        let pos = self.position();
        self.define(name, Label::Code(pos))
    }

    pub fn data_label(&mut self, section: DataSection, name: &str) -> Result<(), AssemblerError> {
        let offset = self.section_len(section);
        self.define(name, Label::Data(section, offset))
    }

    fn define(&mut self, name: &str, label: Label) -> Result<(), AssemblerError> {
        if self.labels.contains_key(name) {
            return Err(AssemblerError::DuplicateLabel(name.to_string()));
        }
        self.labels.insert(name.to_string(), label);
        Ok(())
    }

    pub fn emit(&mut self, opcode: OpCode, operand: i32) {
        self.instructions.push(Instruction::new(opcode, operand));
    }

    pub fn op(&mut self, opcode: OpCode) {
        self.instructions.push(Instruction::simple(opcode));
    }

    /// Emits `opcode` with an operand filled in from `label`.
    pub fn emit_label(&mut self, opcode: OpCode, label: &str) {
        self.fixups.push(Fixup {
            site: FixupSite::Instruction(self.instructions.len()),
            label: label.to_string(),
            code_only: opcode.is_branch(),
        });
        self.emit(opcode, 0);
    }

    pub fn const_f32(&mut self, value: f32) {
        self.emit(OpCode::Const, value.to_bits() as i32);
    }

    pub fn call(&mut self, label: &str) {
        self.emit_label(OpCode::Const, label);
        self.op(OpCode::Call);
    }

    pub fn jump(&mut self, label: &str) {
        self.emit_label(OpCode::Const, label);
        self.op(OpCode::Jump);
    }

    /// Calls host syscall `id`.
    pub fn trap(&mut self, id: i32) {
        self.emit(OpCode::Const, -1 - id);
        self.op(OpCode::Call);
    }

    pub fn bytes(&mut self, section: DataSection, bytes: &[u8]) -> Result<(), AssemblerError> {
        match section {
            DataSection::Data => self.data.extend_from_slice(bytes),
            DataSection::Lit => self.lit.extend_from_slice(bytes),
            DataSection::Bss => return Err(AssemblerError::BssInitializer),
        }
        Ok(())
    }

    pub fn word(&mut self, section: DataSection, value: i32) -> Result<(), AssemblerError> {
        self.bytes(section, &value.to_le_bytes())
    }

    /// A word holding the address or instruction index of `label`.
    pub fn word_label(&mut self, section: DataSection, label: &str) -> Result<(), AssemblerError> {
        let offset = self.section_len(section) as usize;
        self.word(section, 0)?;
        self.fixups.push(Fixup {
            site: FixupSite::Word(section, offset),
            label: label.to_string(),
            code_only: false,
        });
        Ok(())
    }

    /// Appends `text` and its terminating NUL.
    pub fn string(&mut self, section: DataSection, text: &str) -> Result<(), AssemblerError> {
        self.bytes(section, text.as_bytes())?;
        self.bytes(section, &[0])
    }

    pub fn space(&mut self, section: DataSection, len: u32) {
        match section {
            DataSection::Data => self.data.resize(self.data.len() + len as usize, 0),
            DataSection::Lit => self.lit.resize(self.lit.len() + len as usize, 0),
            DataSection::Bss => self.bss_length += len,
        }
    }

    pub fn align(&mut self, section: DataSection, alignment: u32) {
        if alignment <= 1 {
            return;
        }
        let len = self.section_len(section);
        let padding = (alignment - len % alignment) % alignment;
        self.space(section, padding);
    }

    pub fn set_entry(&mut self, label: &str) {
        self.entry = Some(label.to_string());
    }

    /// Adds `label` to the jump-target table. Any target forces a v2 image.
    pub fn jump_target(&mut self, label: &str) {
        self.jump_targets.push(label.to_string());
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = Some(version);
    }

    pub fn finish(mut self) -> Result<BytecodeImage, AssemblerError> {
        // lit and bss start on word boundaries
        self.align(DataSection::Data, 4);
        self.align(DataSection::Lit, 4);
        let lit_base = self.data.len() as u32;
        let bss_base = lit_base + self.lit.len() as u32;

        let resolve = |labels: &HashMap<String, Label>, name: &str, code_only: bool| {
            match labels.get(name) {
                None => Err(AssemblerError::UnknownLabel(name.to_string())),
                Some(Label::Code(pc)) => Ok(*pc as i32),
                Some(Label::Data(..)) if code_only => {
                    Err(AssemblerError::WrongLabelKind(name.to_string()))
                }
                Some(Label::Data(section, offset)) => Ok(match section {
                    DataSection::Data => *offset,
                    DataSection::Lit => lit_base + offset,
                    DataSection::Bss => bss_base + offset,
                } as i32),
            }
        };

        for fixup in &self.fixups {
            let value = resolve(&self.labels, &fixup.label, fixup.code_only)?;
            match fixup.site {
                FixupSite::Instruction(index) => self.instructions[index].operand = value,
                FixupSite::Word(section, offset) => {
                    let bytes = match section {
                        DataSection::Data => &mut self.data,
                        DataSection::Lit => &mut self.lit,
                        DataSection::Bss => return Err(AssemblerError::BssInitializer),
                    };
                    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }

        let entry = match &self.entry {
            Some(name) => resolve(&self.labels, name, true)? as u32,
            None => 0,
        };
        let jump_targets = self
            .jump_targets
            .iter()
            .map(|name| resolve(&self.labels, name, true).map(|pc| pc as u32))
            .collect::<Result<Vec<_>, _>>()?;
        let version = self.version.unwrap_or(if jump_targets.is_empty() {
            VERSION_V1
        } else {
            VERSION_V2
        });

        Ok(BytecodeImage::from_parts(ImageParts {
            version,
            instructions: self.instructions,
            data: self.data,
            lit: self.lit,
            bss_length: self.bss_length,
            entry,
            jump_targets,
        })?)
    }

    pub fn finish_bytes(self) -> Result<Vec<u8>, AssemblerError> {
        Ok(encode_image(&self.finish()?))
    }
}

/// Writes image bytes without validating them, for exercising the loader
/// with images the assembler would refuse to produce.
pub struct BytecodeBuilder {
    version: u32,
    code: Vec<u8>,
    instruction_count: u32,
    declared_count: Option<u32>,
    data: Vec<u8>,
    lit: Vec<u8>,
    bss_length: u32,
    entry: u32,
    jump_targets: Vec<u32>,
    magic: u32,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self {
            version: VERSION_V1,
            code: Vec::new(),
            instruction_count: 0,
            declared_count: None,
            data: Vec::new(),
            lit: Vec::new(),
            bss_length: 0,
            entry: 0,
            jump_targets: Vec::new(),
            magic: IMAGE_MAGIC,
        }
    }

    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn instruction(&mut self, opcode: OpCode, operand: i32) -> &mut Self {
        Instruction::new(opcode, operand).encode_into(&mut self.code);
        self.instruction_count += 1;
        self
    }

    pub fn op(&mut self, opcode: OpCode) -> &mut Self {
        self.instruction(opcode, 0)
    }

    /// One instruction made of arbitrary bytes.
    pub fn raw_instruction(&mut self, bytes: &[u8]) -> &mut Self {
        self.code.extend_from_slice(bytes);
        self.instruction_count += 1;
        self
    }

    pub fn padding(&mut self, len: usize) -> &mut Self {
        self.code.resize(self.code.len() + len, 0);
        self
    }

    pub fn declared_count(&mut self, count: u32) -> &mut Self {
        self.declared_count = Some(count);
        self
    }

    pub fn version(&mut self, version: u32) -> &mut Self {
        self.version = version;
        self
    }

    pub fn magic(&mut self, magic: u32) -> &mut Self {
        self.magic = magic;
        self
    }

    pub fn data(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn lit(&mut self, bytes: &[u8]) -> &mut Self {
        self.lit.extend_from_slice(bytes);
        self
    }

    pub fn bss(&mut self, len: u32) -> &mut Self {
        self.bss_length = len;
        self
    }

    pub fn entry(&mut self, entry: u32) -> &mut Self {
        self.entry = entry;
        self
    }

    pub fn jump_targets(&mut self, targets: &[u32]) -> &mut Self {
        self.jump_targets = targets.to_vec();
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut word = |value: u32| out.extend_from_slice(&value.to_le_bytes());
        word(self.magic);
        word(self.version);
        word(self.declared_count.unwrap_or(self.instruction_count));
        word(self.code.len() as u32);
        word(self.data.len() as u32);
        word(self.lit.len() as u32);
        word(self.bss_length);
        word(self.entry);
        if self.version >= VERSION_V2 {
            word(self.jump_targets.len() as u32);
        }
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.lit);
        if self.version >= VERSION_V2 {
            for target in &self.jump_targets {
                out.extend_from_slice(&target.to_le_bytes());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for AsmParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmParseError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AsmSection {
    Code,
    Data(DataSection),
}

enum Operand<'a> {
    Value(i32),
    Label(&'a str),
}

/// Assembles the text form into a validated image.
///
/// ```text
/// .data
/// .label counter
/// .word 0
/// .lit
/// .label greeting
/// .string "hi\n"
/// .code
/// .entry main
/// .label main
///     enter 8
///     const greeting
///     arg 8
///     trap 0
///     leave 8
/// ```
pub fn assemble(source: &str) -> Result<BytecodeImage, AsmParseError> {
    let mut assembler = Assembler::new();
    let mut section = AsmSection::Code;
    let mut last_line = 0;

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = strip_comments(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        last_line = line_no;
        let error = |message: String| AsmParseError {
            line: line_no,
            message,
        };

        if line.ends_with(':') {
            return Err(error("label definitions must use '.label NAME'".to_string()));
        }

        if let Some(rest) = line.strip_prefix('.') {
            let mut parts = rest.split_whitespace();
            let directive = parts.next().unwrap_or("").to_ascii_lowercase();
            match directive.as_str() {
                "code" => section = AsmSection::Code,
                "data" => section = AsmSection::Data(DataSection::Data),
                "lit" => section = AsmSection::Data(DataSection::Lit),
                "bss" => section = AsmSection::Data(DataSection::Bss),
                "label" => {
                    let name = next_token(&mut parts, line_no, "label name")?;
                    let defined = match section {
                        AsmSection::Code => assembler.label(name),
                        AsmSection::Data(data) => assembler.data_label(data, name),
                    };
                    defined.map_err(|err| error(err.to_string()))?;
                }
                "entry" => {
                    let name = next_token(&mut parts, line_no, "entry label")?;
                    assembler.set_entry(name);
                }
                "target" => {
                    for name in parts.by_ref() {
                        assembler.jump_target(name);
                    }
                }
                "version" => {
                    let token = next_token(&mut parts, line_no, "image version")?;
                    let version = parse_int(token, line_no)?;
                    assembler.set_version(version as u32);
                }
                "word" | "byte" | "string" | "space" | "align" => {
                    let AsmSection::Data(data) = section else {
                        return Err(error(format!(
                            "'.{directive}' is only valid in data, lit or bss"
                        )));
                    };
                    data_directive(&mut assembler, data, &directive, rest, line_no)?;
                    continue;
                }
                other => return Err(error(format!("unknown directive '.{other}'"))),
            }
            if parts.next().is_some() {
                return Err(error("unexpected extra tokens".to_string()));
            }
            continue;
        }

        if section != AsmSection::Code {
            return Err(error("instructions must follow '.code'".to_string()));
        }
        let mut parts = line.split_whitespace();
        let mnemonic = parts.next().unwrap_or("").to_ascii_lowercase();
        let operand = parts.next();
        if parts.next().is_some() {
            return Err(error("unexpected extra tokens".to_string()));
        }

        match (mnemonic.as_str(), operand) {
            ("trap", Some(token)) => assembler.trap(parse_int(token, line_no)?),
            ("trap", None) => return Err(error("missing trap number".to_string())),
            ("call", Some(token)) | ("jump", Some(token)) => {
                let opcode = if mnemonic == "call" {
                    OpCode::Call
                } else {
                    OpCode::Jump
                };
                match parse_operand(token, line_no)? {
                    Operand::Value(value) => assembler.emit(OpCode::Const, value),
                    Operand::Label(name) => assembler.emit_label(OpCode::Const, name),
                }
                assembler.op(opcode);
            }
            _ => {
                let opcode = OpCode::parse_mnemonic(&mnemonic)
                    .ok_or_else(|| error(format!("unknown instruction '{mnemonic}'")))?;
                emit_instruction(&mut assembler, opcode, operand, line_no)?;
            }
        }
    }

    assembler.finish().map_err(|err| AsmParseError {
        line: last_line,
        message: err.to_string(),
    })
}

fn emit_instruction(
    assembler: &mut Assembler,
    opcode: OpCode,
    operand: Option<&str>,
    line_no: usize,
) -> Result<(), AsmParseError> {
    let missing = || AsmParseError {
        line: line_no,
        message: format!("'{}' needs an operand", opcode.mnemonic()),
    };
    match opcode.operand_kind() {
        OperandKind::None => {
            if operand.is_some() {
                return Err(AsmParseError {
                    line: line_no,
                    message: "unexpected extra tokens".to_string(),
                });
            }
            assembler.op(opcode);
        }
        OperandKind::Byte => {
            let token = operand.ok_or_else(missing)?;
            let value = parse_u8(token, line_no)?;
            assembler.emit(opcode, value as i32);
        }
        OperandKind::Word => match parse_operand(operand.ok_or_else(missing)?, line_no)? {
            Operand::Value(value) => assembler.emit(opcode, value),
            Operand::Label(name) => assembler.emit_label(opcode, name),
        },
    }
    Ok(())
}

fn data_directive(
    assembler: &mut Assembler,
    section: DataSection,
    directive: &str,
    rest: &str,
    line_no: usize,
) -> Result<(), AsmParseError> {
    let error = |err: AssemblerError| AsmParseError {
        line: line_no,
        message: err.to_string(),
    };
    let args = rest_after_n_tokens(rest, 1).unwrap_or("");
    if args.is_empty() {
        return Err(AsmParseError {
            line: line_no,
            message: format!("'.{directive}' needs a value"),
        });
    }
    match directive {
        "string" => {
            let text = parse_string_literal(args, line_no)?;
            assembler.string(section, &text).map_err(error)?;
        }
        "byte" => {
            for token in args.split_whitespace() {
                let value = parse_int(token, line_no)?;
                assembler.bytes(section, &[value as u8]).map_err(error)?;
            }
        }
        "word" => {
            for token in args.split_whitespace() {
                let written = match parse_operand(token, line_no)? {
                    Operand::Value(value) => assembler.word(section, value),
                    Operand::Label(name) => assembler.word_label(section, name),
                };
                written.map_err(error)?;
            }
        }
        "space" | "align" => {
            let mut parts = args.split_whitespace();
            let token = next_token(&mut parts, line_no, "size")?;
            if parts.next().is_some() {
                return Err(AsmParseError {
                    line: line_no,
                    message: "unexpected extra tokens".to_string(),
                });
            }
            let size = parse_int(token, line_no)? as u32;
            if directive == "space" {
                assembler.space(section, size);
            } else {
                assembler.align(section, size);
            }
        }
        _ => unreachable!("caller filters data directives"),
    }
    Ok(())
}

fn strip_comments(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    let bytes = line.as_bytes();
    for (idx, ch) in line.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            ';' | '#' => return &line[..idx],
            '/' if bytes.get(idx + 1) == Some(&b'/') => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn next_token<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    line_no: usize,
    what: &str,
) -> Result<&'a str, AsmParseError> {
    parts.next().ok_or_else(|| AsmParseError {
        line: line_no,
        message: format!("missing {what}"),
    })
}

fn parse_u8(token: &str, line_no: usize) -> Result<u8, AsmParseError> {
    let value = parse_int(token, line_no)?;
    u8::try_from(value).map_err(|_| AsmParseError {
        line: line_no,
        message: format!("invalid u8 '{token}'"),
    })
}

/// Decimal or `0x` hex, optionally negative. Hex values may use all 32 bits.
fn parse_int(token: &str, line_no: usize) -> Result<i32, AsmParseError> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok().map(|value| value as i64),
        None => digits.parse::<i64>().ok(),
    };
    parsed
        .map(|value| if negative { -value } else { value })
        .filter(|value| *value >= i32::MIN as i64 && *value <= u32::MAX as i64)
        .map(|value| value as i32)
        .ok_or_else(|| AsmParseError {
            line: line_no,
            message: format!("invalid integer '{token}'"),
        })
}

/// Integers, float literals (stored as their bit pattern) or label names.
fn parse_operand(token: &str, line_no: usize) -> Result<Operand<'_>, AsmParseError> {
    let starts_numeric = token
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_digit() || ch == '-' || ch == '.');
    if !starts_numeric {
        return Ok(Operand::Label(token));
    }
    if let Ok(value) = parse_int(token, line_no) {
        return Ok(Operand::Value(value));
    }
    token
        .strip_suffix('f')
        .unwrap_or(token)
        .parse::<f32>()
        .map(|value| Operand::Value(value.to_bits() as i32))
        .map_err(|_| AsmParseError {
            line: line_no,
            message: format!("invalid operand '{token}'"),
        })
}

fn parse_string_literal(token: &str, line_no: usize) -> Result<String, AsmParseError> {
    let mut chars = token.char_indices();
    if chars.next().map(|(_, ch)| ch) != Some('"') {
        return Err(AsmParseError {
            line: line_no,
            message: "string literal must start with '\"'".to_string(),
        });
    }

    let mut out = String::new();
    let mut escaped = false;
    let mut end_idx = None;

    for (idx, ch) in chars {
        if escaped {
            let mapped = match ch {
                'n' => '\n',
                't' => '\t',
                '\\' => '\\',
                '"' => '"',
                other => {
                    return Err(AsmParseError {
                        line: line_no,
                        message: format!("invalid escape '\\{other}'"),
                    });
                }
            };
            out.push(mapped);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => {
                end_idx = Some(idx);
                break;
            }
            other => out.push(other),
        }
    }

    let Some(end_idx) = end_idx else {
        return Err(AsmParseError {
            line: line_no,
            message: "unterminated string literal".to_string(),
        });
    };
    if token[end_idx + 1..].trim().is_empty() {
        Ok(out)
    } else {
        Err(AsmParseError {
            line: line_no,
            message: "unexpected trailing characters after string literal".to_string(),
        })
    }
}

fn rest_after_n_tokens(line: &str, n: usize) -> Option<&str> {
    let mut count = 0;
    let mut in_token = false;
    let mut end_idx = 0;
    for (idx, ch) in line.char_indices() {
        if ch.is_whitespace() {
            if in_token {
                in_token = false;
                count += 1;
                if count == n {
                    end_idx = idx;
                    break;
                }
            }
        } else if !in_token {
            in_token = true;
        }
    }
    if in_token && count < n {
        count += 1;
        end_idx = line.len();
    }
    if count < n {
        None
    } else {
        Some(line[end_idx..].trim_start())
    }
}
