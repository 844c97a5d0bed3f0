//! Text disassembly and container reports

use std::fmt::Write;

use rustc_hash::FxHashMap;

use crate::container::Container;
use crate::decode::{Blob, BlobKind};
use crate::instruction::{Opcode, instructions};
use crate::operand::{BlobIndex, CodeIndex, ConstIndex, StringIndex};
use crate::wtf8;

/// Render `code` one instruction per line, EXTENDED_ARG folded in
pub fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    for item in instructions(code) {
        match item {
            Ok((pc, instr)) => {
                if instr.opcode.has_arg() {
                    let _ = writeln!(out, "{:>6} {:<22} {}", pc, instr.opcode.name(), instr.arg);
                } else {
                    let _ = writeln!(out, "{:>6} {}", pc, instr.opcode.name());
                }
            }
            Err(e) => {
                let _ = writeln!(out, "       <{e}>");
            }
        }
    }
    out
}

/// Infer blob kinds from the instructions that reference them
fn blob_kinds(container: &Container) -> FxHashMap<u32, BlobKind> {
    let mut kinds = FxHashMap::default();
    for index in 1..container.counts().consts {
        let Ok(fragment) = container.fragment(ConstIndex(index)) else {
            continue;
        };
        for (_, instr) in instructions(fragment.code).flatten() {
            if let Some(kind) = BlobKind::for_opcode(instr.opcode) {
                kinds.insert(instr.arg, kind);
            }
        }
    }
    kinds
}

fn render_string(container: &Container, index: StringIndex) -> String {
    match container.optional_string(index) {
        Ok(Some(units)) => format!("{:?}", wtf8::to_string_lossy(&units)),
        Ok(None) => "-".to_string(),
        Err(e) => format!("<{e}>"),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render every table of a container
pub fn report(container: &Container) -> String {
    let mut out = String::new();
    let counts = container.counts();
    let header = container.header();
    let _ = writeln!(
        out,
        "version {} flags {:#06x} total_size {} binary {} bytes",
        header.version,
        header.flags,
        header.total_size,
        container.region().len()
    );

    let _ = writeln!(out, "Code table:");
    for index in 1..counts.code {
        match container.code(CodeIndex(index)) {
            Ok(code) => {
                let _ = writeln!(
                    out,
                    "{index:4}: {} ({}) args={} locals={} stack={} consts={}",
                    render_string(container, code.name),
                    render_string(container, code.filename),
                    code.argcount,
                    code.nlocals,
                    code.stacksize,
                    code.consts.len(),
                );
                out.push_str(&disassemble(code.code));
                for (slot, name) in code.varnames.iter().enumerate() {
                    let _ = writeln!(out, "      var {slot}: {}", render_string(container, *name));
                }
            }
            Err(e) => {
                let _ = writeln!(out, "{index:4}: <{e}>");
            }
        }
    }

    let _ = writeln!(out, "Constant table:");
    for index in 1..counts.consts {
        match container.fragment(ConstIndex(index)) {
            Ok(fragment) => {
                let _ = writeln!(
                    out,
                    "{index:4}: stack={} instrs={}",
                    fragment.stack_size, fragment.num_instrs
                );
                out.push_str(&disassemble(fragment.code));
            }
            Err(e) => {
                let _ = writeln!(out, "{index:4}: <{e}>");
            }
        }
    }

    let _ = writeln!(out, "String table:");
    for index in 1..counts.strings {
        let _ = writeln!(out, "{index:4}: {}", render_string(container, StringIndex(index)));
    }

    let _ = writeln!(out, "Blob table:");
    let kinds = blob_kinds(container);
    for index in 1..counts.blobs {
        let line = match kinds.get(&index) {
            Some(&kind) => match container.blob(BlobIndex(index), kind) {
                Ok(Blob::Long(v)) => format!("long {v}"),
                Ok(Blob::Float(x)) => format!("float {x:?}"),
                Ok(Blob::Bytes(b)) => format!("bytes [{}]", hex(b)),
                Err(e) => format!("<{e}>"),
            },
            None => match container.blob_offset(BlobIndex(index)) {
                Ok(Some(offset)) => format!("unreferenced at {offset}"),
                Ok(None) => "-".to_string(),
                Err(e) => format!("<{e}>"),
            },
        };
        let _ = writeln!(out, "{index:4}: {line}");
    }
    out
}

/// Name of the opcode stored in `byte`, for diagnostics
pub fn opcode_name(byte: u8) -> &'static str {
    Opcode::from_byte(byte).map_or("<unknown>", Opcode::name)
}
