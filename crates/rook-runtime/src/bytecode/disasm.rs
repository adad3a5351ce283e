//! Bytecode disassembler
//!
//! Converts a chunk back to a human-readable listing. Used by tests, the
//! `--disasm` CLI flag, and the VM's execution trace.

use super::{Chunk, OpCode};
use crate::heap::Heap;
use crate::object::Obj;
use crate::value::Value;
use std::fmt::Write;

/// Disassemble a whole chunk under a heading.
///
/// # Format
/// ```text
/// == counter ==
/// 0000    1 Constant            0 '0'
/// 0002    | DefineGlobal        1 'i'
/// ```
pub fn disassemble(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (line, next) = disassemble_instruction(chunk, offset, heap);
        let _ = writeln!(output, "{}", line);
        offset = next;
    }
    output
}

/// Disassemble the instruction at `offset`.
///
/// Returns the formatted line and the offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let mut text = format!("{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        text.push_str("   | ");
    } else {
        let _ = write!(text, "{:4} ", chunk.lines[offset]);
    }

    let byte = chunk.code[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(_) => {
            let _ = write!(text, "<unknown opcode {:#04x}>", byte);
            return (text, offset + 1);
        }
    };

    use OpCode::*;
    match op {
        Pop | Equal | Greater | Less | Add | Subtract | Multiply | Divide | Not | Negate
        | Print | CloseUpvalue | Return | Inherit | InstanceOf => {
            let _ = write!(text, "{:?}", op);
            (text, offset + 1)
        }

        GetLocal | SetLocal | Call => {
            let slot = chunk.code[offset + 1];
            let _ = write!(text, "{:<16?} {:4}", op, slot);
            (text, offset + 2)
        }

        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty
        | GetSuper | Class | Method => {
            let constant = chunk.code[offset + 1];
            let _ = write!(
                text,
                "{:<16?} {:4} '{}'",
                op,
                constant,
                render_constant(chunk, constant, heap)
            );
            (text, offset + 2)
        }

        GetUpvalue | SetUpvalue => {
            let slot = chunk.code[offset + 1];
            let _ = write!(text, "{:<16?} {:4}", op, slot);
            (text, offset + 2)
        }

        Jump | JumpIfFalse => {
            let jump = read_u16(chunk, offset + 1) as usize;
            let _ = write!(text, "{:<16?} {:4} -> {}", op, offset, offset + 3 + jump);
            (text, offset + 3)
        }
        Loop => {
            let jump = read_u16(chunk, offset + 1) as usize;
            let _ = write!(text, "{:<16?} {:4} -> {}", op, offset, offset + 3 - jump);
            (text, offset + 3)
        }

        Invoke | SuperInvoke => {
            let constant = chunk.code[offset + 1];
            let argc = chunk.code[offset + 2];
            let _ = write!(
                text,
                "{:<16?} ({} args) {:4} '{}'",
                op,
                argc,
                constant,
                render_constant(chunk, constant, heap)
            );
            (text, offset + 3)
        }

        Closure => {
            let constant = chunk.code[offset + 1];
            let _ = write!(
                text,
                "{:<16?} {:4} {}",
                op,
                constant,
                render_constant(chunk, constant, heap)
            );
            let mut next = offset + 2;
            let upvalue_count = match chunk.constants.get(constant as usize) {
                Some(Value::Obj(handle)) => match heap.get(*handle) {
                    Obj::Function(f) => f.upvalue_count,
                    _ => 0,
                },
                _ => 0,
            };
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.code[next + 1];
                let _ = write!(
                    text,
                    "\n{:04}    |   {} {}",
                    next,
                    if is_local == 1 { "local" } else { "upvalue" },
                    index
                );
                next += 2;
            }
            (text, next)
        }
    }
}

fn render_constant(chunk: &Chunk, index: u8, heap: &Heap) -> String {
    match chunk.constants.get(index as usize) {
        Some(value) => heap.format_value(*value),
        None => "<bad constant>".to_string(),
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    ((chunk.code[offset] as u16) << 8) | chunk.code[offset + 1] as u16
}
