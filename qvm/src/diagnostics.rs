use crate::vm::RuntimeFault;
use crate::wire::{
    BytecodeImage, IMAGE_MAGIC, LoadError, VERSION_V1, VERSION_V2, format_instruction,
};

/// Instructions shown ahead of the faulting one.
const CONTEXT_BEFORE: u32 = 2;

pub fn render_fault(image: &BytecodeImage, fault: &RuntimeFault) -> String {
    let mut out = format!("runtime error: {}", fault.kind);
    let Some(pc) = fault.pc else {
        return out;
    };
    out.push_str(&format!("\nat instruction {pc}"));
    for index in pc.saturating_sub(CONTEXT_BEFORE)..=pc {
        if let Some(line) = format_instruction(image, index) {
            let marker = if index == pc { '>' } else { ' ' };
            out.push_str(&format!("\n{marker} {line}"));
        }
    }
    out
}

pub fn render_load_error(err: &LoadError) -> String {
    let mut out = format!("load error: {err}");
    match err {
        LoadError::BadMagic(_) => {
            out.push_str(&format!("\n  expected magic {IMAGE_MAGIC:#010x}"));
        }
        LoadError::VersionMismatch { .. } => {
            out.push_str(&format!(
                "\n  supported versions: {VERSION_V1} (no jump table), {VERSION_V2}"
            ));
        }
        LoadError::InvalidJumpTarget {
            source: Some(source),
            ..
        } => {
            out.push_str(&format!("\n  referenced by instruction {source}"));
        }
        _ => {}
    }
    out
}
