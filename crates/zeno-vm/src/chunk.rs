//! Compiled chunks and the `ZBC1` binary format.
//!
//! Layout, little-endian throughout:
//!
//! ```text
//! "ZBC1"
//! u32 code length, code bytes
//! u32 constant count, constants: u8 tag + payload
//! u32 local count, locals: u32 length + UTF-8
//! ```
//!
//! Function constants embed their chunk body (without the magic).

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use zeno_core::{Opaque, Value};

use crate::error::VmError;
use crate::opcode::OpCode;

/// File magic.
pub const MAGIC: &[u8; 4] = b"ZBC1";

/// Prefix marking a local as block-scoped; such locals are never synced
/// into the host scope.
pub const HIDDEN_PREFIX: char = '@';

/// Nesting limit of function constants when decoding.
const MAX_NESTING: usize = 32;

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_FUNCTION: u8 = 4;

/// A compiled function.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub arity: u8,
    pub chunk: Arc<Chunk>,
}

/// Constant pool entry.
#[derive(Debug, Clone)]
pub enum Constant {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    /// Host object; only valid in memory.
    Opaque(Opaque),
    Function(Arc<Function>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => {
                Value::Opaque(a.clone()) == Value::Opaque(b.clone())
            }
            (Self::Function(a), Self::Function(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.name == b.name && a.arity == b.arity && a.chunk == b.chunk)
            }
            _ => false,
        }
    }
}

impl Constant {
    /// Runtime value of this constant.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Nil => Value::Nil,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::number(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Opaque(o) => Value::Opaque(o.clone()),
            Self::Function(f) => Value::Opaque(Opaque::from_arc(Arc::clone(f))),
        }
    }
}

/// Immutable compiled artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    /// Local names by slot.
    pub locals: Vec<String>,
}

impl Chunk {
    /// Whether local `slot` is block-scoped.
    pub fn is_hidden(&self, slot: usize) -> bool {
        self.locals
            .get(slot)
            .is_none_or(|name| name.starts_with(HIDDEN_PREFIX))
    }

    /// Encode as a `ZBC1` file.
    ///
    /// # Errors
    ///
    /// Fails on opaque constants, which have no serialized form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VmError> {
        let mut buf = BytesMut::with_capacity(self.code.len() + 64);
        buf.put_slice(MAGIC);
        self.write_body(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode a `ZBC1` file.
    ///
    /// # Errors
    ///
    /// Rejects unknown magic, truncated input, unknown constant tags and
    /// invalid UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        let mut buf = bytes;
        if buf.remaining() < MAGIC.len() {
            return Err(VmError::Truncated);
        }
        let mut magic = [0_u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(VmError::BadMagic(magic));
        }
        read_body(&mut buf, 0)
    }

    fn write_body(&self, buf: &mut BytesMut) -> Result<(), VmError> {
        put_len(buf, self.code.len())?;
        buf.put_slice(&self.code);

        put_len(buf, self.constants.len())?;
        for constant in &self.constants {
            match constant {
                Constant::Nil => buf.put_u8(TAG_NIL),
                Constant::Bool(b) => {
                    buf.put_u8(TAG_BOOL);
                    buf.put_u8(u8::from(*b));
                }
                Constant::Number(n) => {
                    buf.put_u8(TAG_NUMBER);
                    buf.put_f64_le(*n);
                }
                Constant::String(s) => {
                    buf.put_u8(TAG_STRING);
                    put_str(buf, s)?;
                }
                Constant::Function(f) => {
                    buf.put_u8(TAG_FUNCTION);
                    put_str(buf, &f.name)?;
                    buf.put_u8(f.arity);
                    f.chunk.write_body(buf)?;
                }
                Constant::Opaque(_) => return Err(VmError::Unserializable),
            }
        }

        put_len(buf, self.locals.len())?;
        for name in &self.locals {
            put_str(buf, name)?;
        }
        Ok(())
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<(), VmError> {
    let len = u32::try_from(len).map_err(|_| VmError::Limit { what: "section length" })?;
    buf.put_u32_le(len);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), VmError> {
    put_len(buf, s.len())?;
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, VmError> {
    if buf.remaining() < 1 {
        return Err(VmError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_len(buf: &mut &[u8]) -> Result<usize, VmError> {
    if buf.remaining() < 4 {
        return Err(VmError::Truncated);
    }
    usize::try_from(buf.get_u32_le()).map_err(|_| VmError::Truncated)
}

fn get_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, VmError> {
    if buf.remaining() < len {
        return Err(VmError::Truncated);
    }
    let mut out = vec![0; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn get_str(buf: &mut &[u8]) -> Result<String, VmError> {
    let len = get_len(buf)?;
    String::from_utf8(get_bytes(buf, len)?).map_err(|_| VmError::InvalidUtf8)
}

fn read_body(buf: &mut &[u8], depth: usize) -> Result<Chunk, VmError> {
    if depth > MAX_NESTING {
        return Err(VmError::Limit { what: "function nesting" });
    }
    let code_len = get_len(buf)?;
    let code = get_bytes(buf, code_len)?;

    let count = get_len(buf)?;
    let mut constants = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        let constant = match get_u8(buf)? {
            TAG_NIL => Constant::Nil,
            TAG_BOOL => Constant::Bool(get_u8(buf)? != 0),
            TAG_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(VmError::Truncated);
                }
                Constant::Number(buf.get_f64_le())
            }
            TAG_STRING => Constant::String(get_str(buf)?),
            TAG_FUNCTION => {
                let name = get_str(buf)?;
                let arity = get_u8(buf)?;
                let chunk = read_body(buf, depth + 1)?;
                Constant::Function(Arc::new(Function {
                    name,
                    arity,
                    chunk: Arc::new(chunk),
                }))
            }
            other => return Err(VmError::UnknownConstantTag(other)),
        };
        constants.push(constant);
    }

    let count = get_len(buf)?;
    let mut locals = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        locals.push(get_str(buf)?);
    }

    Ok(Chunk {
        code,
        constants,
        locals,
    })
}

/// Incremental chunk writer used by the compiler and by tests.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    chunk: Chunk,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code length (the offset of the next instruction).
    pub fn len(&self) -> usize {
        self.chunk.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.code.is_empty()
    }

    pub fn op(&mut self, op: OpCode) -> &mut Self {
        self.chunk.code.push(op.into());
        self
    }

    pub fn op_u8(&mut self, op: OpCode, operand: u8) -> &mut Self {
        self.chunk.code.push(op.into());
        self.chunk.code.push(operand);
        self
    }

    pub fn op_u16(&mut self, op: OpCode, operand: u16) -> &mut Self {
        self.chunk.code.push(op.into());
        self.chunk.code.extend_from_slice(&operand.to_le_bytes());
        self
    }

    /// Emit `CallSlot` for the slot named by constant `name`.
    pub fn call_slot(&mut self, name: u16, pairs: u8) -> &mut Self {
        self.op_u16(OpCode::CallSlot, name);
        self.chunk.code.push(pairs);
        self
    }

    /// Intern a constant, reusing an equal scalar entry.
    ///
    /// # Errors
    ///
    /// Fails past 65 536 constants.
    pub fn constant(&mut self, constant: Constant) -> Result<u16, VmError> {
        let existing = match &constant {
            Constant::Function(_) | Constant::Opaque(_) => None,
            scalar => self.chunk.constants.iter().position(|c| c == scalar),
        };
        let index = match existing {
            Some(index) => index,
            None => {
                self.chunk.constants.push(constant);
                self.chunk.constants.len() - 1
            }
        };
        u16::try_from(index).map_err(|_| VmError::Limit { what: "constant pool" })
    }

    /// Emit `Constant` loading `constant`.
    ///
    /// # Errors
    ///
    /// Fails when the constant pool is full.
    pub fn emit_constant(&mut self, constant: Constant) -> Result<&mut Self, VmError> {
        let index = self.constant(constant)?;
        Ok(self.op_u16(OpCode::Constant, index))
    }

    /// Emit a forward jump with a placeholder offset; returns its patch site.
    pub fn emit_jump(&mut self, op: OpCode) -> usize {
        self.op_u16(op, u16::MAX);
        self.len() - 2
    }

    /// Point the jump at `site` to the current end of code.
    ///
    /// # Errors
    ///
    /// Fails when the distance does not fit in 16 bits.
    pub fn patch_jump(&mut self, site: usize) -> Result<(), VmError> {
        let distance = self.len() - (site + 2);
        let distance = u16::try_from(distance).map_err(|_| VmError::Limit { what: "jump distance" })?;
        self.chunk.code[site..site + 2].copy_from_slice(&distance.to_le_bytes());
        Ok(())
    }

    /// Emit a backward jump to `start`.
    ///
    /// # Errors
    ///
    /// Fails when the distance does not fit in 16 bits.
    pub fn emit_loop(&mut self, start: usize) -> Result<(), VmError> {
        let distance = self.len() + 3 - start;
        let distance = u16::try_from(distance).map_err(|_| VmError::Limit { what: "loop body" })?;
        self.op_u16(OpCode::Loop, distance);
        Ok(())
    }

    /// Add a local name; returns its slot.
    ///
    /// # Errors
    ///
    /// Fails past 256 locals.
    pub fn local(&mut self, name: impl Into<String>) -> Result<u8, VmError> {
        let slot = u8::try_from(self.chunk.locals.len())
            .map_err(|_| VmError::Limit { what: "local slots" })?;
        self.chunk.locals.push(name.into());
        Ok(slot)
    }

    pub fn finish(self) -> Chunk {
        self.chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Chunk {
        let mut inner = ChunkBuilder::new();
        inner.op_u8(OpCode::GetLocal, 0).op(OpCode::Return);
        inner.local("@n").unwrap();
        let function = Arc::new(Function {
            name: "id".into(),
            arity: 1,
            chunk: Arc::new(inner.finish()),
        });

        let mut b = ChunkBuilder::new();
        b.local("s").unwrap();
        b.emit_constant(Constant::Number(1.5)).unwrap();
        b.emit_constant(Constant::String("héllo".into())).unwrap();
        b.emit_constant(Constant::Bool(true)).unwrap();
        b.emit_constant(Constant::Nil).unwrap();
        b.emit_constant(Constant::Function(function)).unwrap();
        b.op(OpCode::Stop);
        b.finish()
    }

    #[test]
    fn test_serialize_roundtrip_with_nested_function() {
        let chunk = sample();
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"ZBC1");
        assert_eq!(Chunk::from_bytes(&bytes).unwrap(), chunk);
    }

    #[test]
    fn test_layout_is_little_endian_length_prefixed() {
        let mut b = ChunkBuilder::new();
        b.emit_constant(Constant::String("ab".into())).unwrap();
        b.local("x").unwrap();
        let bytes = b.finish().to_bytes().unwrap();

        assert_eq!(
            bytes,
            vec![
                b'Z', b'B', b'C', b'1', //
                3, 0, 0, 0, 0, 0, 0, // code: CONSTANT 0
                1, 0, 0, 0, TAG_STRING, 2, 0, 0, 0, b'a', b'b', //
                1, 0, 0, 0, 1, 0, 0, 0, b'x',
            ]
        );
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        assert_eq!(
            Chunk::from_bytes(b"ZBC2\0\0\0\0"),
            Err(VmError::BadMagic(*b"ZBC2"))
        );
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(
            Chunk::from_bytes(&bytes[..bytes.len() - 1]),
            Err(VmError::Truncated)
        );
        assert_eq!(Chunk::from_bytes(b"ZB"), Err(VmError::Truncated));
    }

    #[test]
    fn test_unknown_constant_tag() {
        let bytes = [b'Z', b'B', b'C', b'1', 0, 0, 0, 0, 1, 0, 0, 0, 9];
        assert_eq!(Chunk::from_bytes(&bytes), Err(VmError::UnknownConstantTag(9)));
    }

    #[test]
    fn test_opaque_constants_do_not_serialize() {
        let mut b = ChunkBuilder::new();
        b.emit_constant(Constant::Opaque(Opaque::new(5_u8))).unwrap();
        assert_eq!(b.finish().to_bytes(), Err(VmError::Unserializable));
    }

    #[test]
    fn test_builder_interns_scalars_and_patches_jumps() {
        let mut b = ChunkBuilder::new();
        assert_eq!(b.constant(Constant::String("k".into())).unwrap(), 0);
        assert_eq!(b.constant(Constant::Number(2.0)).unwrap(), 1);
        assert_eq!(b.constant(Constant::String("k".into())).unwrap(), 0);

        let site = b.emit_jump(OpCode::Jump);
        b.op(OpCode::Nil).op(OpCode::Pop);
        b.patch_jump(site).unwrap();
        let chunk = b.finish();
        assert_eq!(chunk.code, vec![u8::from(OpCode::Jump), 2, 0, 1, 4]);
    }
}
