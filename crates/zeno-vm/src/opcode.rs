//! Instruction set.
//!
//! Operands follow the opcode byte, little-endian. Jump offsets are
//! relative to the instruction pointer after the operand.

/// One bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// `u16` constant index.
    Constant,
    Nil,
    True,
    False,
    Pop,
    Dup,
    /// `u16` constant index of the name.
    GetGlobal,
    /// `u16` constant index of the name; pops the value.
    SetGlobal,
    /// `u8` slot relative to the frame base.
    GetLocal,
    /// `u8` slot; pops the value.
    SetLocal,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,
    Not,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    /// Pops key and container, pushes the member or nil.
    GetProperty,
    /// `u16` element count.
    BuildList,
    /// `u16` pair count; pairs are pushed key first.
    BuildMap,
    /// `u16` forward offset.
    Jump,
    /// `u16` forward offset; pops the condition.
    JumpIfFalse,
    /// `u16` backward offset.
    Loop,
    /// `u8` argument count.
    Call,
    Return,
    /// `u16` forward offset taken when the iterator is exhausted.
    IterNext,
    IterEnd,
    /// `u16` slot name constant, `u8` argument pair count.
    CallSlot,
    /// `u16` forward offset of the handler.
    TryBegin,
    TryEnd,
    Stop,
}

impl OpCode {
    /// Every opcode, indexed by its byte value.
    pub const ALL: [Self; 37] = [
        Self::Constant,
        Self::Nil,
        Self::True,
        Self::False,
        Self::Pop,
        Self::Dup,
        Self::GetGlobal,
        Self::SetGlobal,
        Self::GetLocal,
        Self::SetLocal,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Negate,
        Self::Not,
        Self::Equal,
        Self::NotEqual,
        Self::Greater,
        Self::GreaterEqual,
        Self::Less,
        Self::LessEqual,
        Self::GetProperty,
        Self::BuildList,
        Self::BuildMap,
        Self::Jump,
        Self::JumpIfFalse,
        Self::Loop,
        Self::Call,
        Self::Return,
        Self::IterNext,
        Self::IterEnd,
        Self::CallSlot,
        Self::TryBegin,
        Self::TryEnd,
        Self::Stop,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.get(usize::from(byte)).copied()
    }

    /// Number of operand bytes following the opcode.
    pub fn operand_len(self) -> usize {
        match self {
            Self::Constant
            | Self::GetGlobal
            | Self::SetGlobal
            | Self::BuildList
            | Self::BuildMap
            | Self::Jump
            | Self::JumpIfFalse
            | Self::Loop
            | Self::IterNext
            | Self::TryBegin => 2,
            Self::GetLocal | Self::SetLocal | Self::Call => 1,
            Self::CallSlot => 3,
            _ => 0,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Constant => "CONSTANT",
            Self::Nil => "NIL",
            Self::True => "TRUE",
            Self::False => "FALSE",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::GetGlobal => "GET_GLOBAL",
            Self::SetGlobal => "SET_GLOBAL",
            Self::GetLocal => "GET_LOCAL",
            Self::SetLocal => "SET_LOCAL",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Negate => "NEGATE",
            Self::Not => "NOT",
            Self::Equal => "EQUAL",
            Self::NotEqual => "NOT_EQUAL",
            Self::Greater => "GREATER",
            Self::GreaterEqual => "GREATER_EQUAL",
            Self::Less => "LESS",
            Self::LessEqual => "LESS_EQUAL",
            Self::GetProperty => "GET_PROPERTY",
            Self::BuildList => "BUILD_LIST",
            Self::BuildMap => "BUILD_MAP",
            Self::Jump => "JUMP",
            Self::JumpIfFalse => "JUMP_IF_FALSE",
            Self::Loop => "LOOP",
            Self::Call => "CALL",
            Self::Return => "RETURN",
            Self::IterNext => "ITER_NEXT",
            Self::IterEnd => "ITER_END",
            Self::CallSlot => "CALL_SLOT",
            Self::TryBegin => "TRY_BEGIN",
            Self::TryEnd => "TRY_END",
            Self::Stop => "STOP",
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_values_match_table_order() {
        for (i, op) in OpCode::ALL.iter().enumerate() {
            assert_eq!(usize::from(u8::from(*op)), i, "{op:?}");
            assert_eq!(OpCode::from_byte(u8::from(*op)), Some(*op));
        }
        assert_eq!(OpCode::from_byte(200), None);
    }
}
