//! Human-readable listing of a chunk.

use std::fmt::Write;

use crate::chunk::{Chunk, Constant};
use crate::opcode::OpCode;

/// Disassemble `chunk` and every function constant it contains.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = instruction(chunk, offset, &mut out);
    }
    for constant in &chunk.constants {
        if let Constant::Function(function) = constant {
            out.push('\n');
            out.push_str(&disassemble(
                &function.chunk,
                &format!("fn {}/{}", function.name, function.arity),
            ));
        }
    }
    out
}

fn describe(constant: Option<&Constant>) -> String {
    match constant {
        None => "<missing>".into(),
        Some(Constant::Nil) => "nil".into(),
        Some(Constant::Bool(b)) => b.to_string(),
        Some(Constant::Number(n)) => n.to_string(),
        Some(Constant::String(s)) => format!("{s:?}"),
        Some(Constant::Opaque(_)) => "<opaque>".into(),
        Some(Constant::Function(f)) => format!("<fn {}>", f.name),
    }
}

fn instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let byte = chunk.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        let _ = writeln!(out, "{offset:04} ??? {byte:#04x}");
        return offset + 1;
    };
    let next = offset + 1 + op.operand_len();
    let Some(operands) = chunk.code.get(offset + 1..next) else {
        let _ = writeln!(out, "{offset:04} {} <truncated>", op.mnemonic());
        return chunk.code.len();
    };
    let wide = || usize::from(u16::from_le_bytes([operands[0], operands[1]]));

    let detail = match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal => {
            let index = wide();
            format!(" {index} {}", describe(chunk.constants.get(index)))
        }
        OpCode::GetLocal | OpCode::SetLocal => {
            let slot = usize::from(operands[0]);
            let name = chunk.locals.get(slot).map_or("?", String::as_str);
            format!(" {slot} ({name})")
        }
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::IterNext | OpCode::TryBegin => {
            format!(" -> {:04}", next + wide())
        }
        OpCode::Loop => format!(" -> {:04}", next.saturating_sub(wide())),
        OpCode::BuildList | OpCode::BuildMap => format!(" {}", wide()),
        OpCode::Call => format!(" {}", operands[0]),
        OpCode::CallSlot => {
            let index = wide();
            format!(" {} pairs={}", describe(chunk.constants.get(index)), operands[2])
        }
        _ => String::new(),
    };
    let _ = writeln!(out, "{offset:04} {}{detail}", op.mnemonic());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkBuilder;

    #[test]
    fn test_listing_shows_operands_and_jump_targets() {
        let mut b = ChunkBuilder::new();
        let x = b.local("x").unwrap();
        b.emit_constant(Constant::Number(1.0)).unwrap();
        let site = b.emit_jump(OpCode::JumpIfFalse);
        b.op(OpCode::True).op_u8(OpCode::SetLocal, x);
        b.patch_jump(site).unwrap();
        b.op(OpCode::Stop);

        let text = disassemble(&b.finish(), "main");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "== main ==",
                "0000 CONSTANT 0 1",
                "0003 JUMP_IF_FALSE -> 0009",
                "0006 TRUE",
                "0007 SET_LOCAL 0 (x)",
                "0009 STOP",
            ]
        );
    }
}
