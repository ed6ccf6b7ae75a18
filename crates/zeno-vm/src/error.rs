//! VM and bytecode format errors.

use thiserror::Error;
use zeno_common::RuntimeError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("stack overflow: more than {limit} values")]
    StackOverflow { limit: usize },

    #[error("stack overflow: more than {limit} call frames")]
    FrameOverflow { limit: usize },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("invalid opcode {byte:#04x} at offset {offset}")]
    InvalidOpcode { byte: u8, offset: usize },

    #[error("constant index {0} out of range")]
    BadConstant(usize),

    #[error("local slot {0} out of range")]
    BadLocal(usize),

    #[error("truncated bytecode")]
    Truncated,

    #[error("not a zeno bytecode file (magic {0:?})")]
    BadMagic([u8; 4]),

    #[error("unknown constant tag {0}")]
    UnknownConstantTag(u8),

    #[error("invalid UTF-8 in bytecode")]
    InvalidUtf8,

    #[error("opaque constants cannot be serialized")]
    Unserializable,

    #[error("{what} limit exceeded")]
    Limit { what: &'static str },

    #[error("{0}")]
    Type(String),
}

impl From<VmError> for RuntimeError {
    fn from(err: VmError) -> Self {
        RuntimeError::vm(err.to_string())
    }
}
