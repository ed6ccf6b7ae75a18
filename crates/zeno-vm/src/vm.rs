//! The stack machine.
//!
//! A VM instance is single-threaded: it owns its stack, call frames and
//! handler stack, and is never shared across tasks. Locals live on the
//! stack at `base + slot`; named (non-hidden) locals are copied into the
//! host before every slot call and when execution stops, and are refreshed
//! from the host after each slot call.

use std::collections::HashMap;
use std::sync::Arc;

use zeno_common::RuntimeError;
use zeno_core::expr::BinOp;
use zeno_core::slots::error_value;
use zeno_core::{Value, ValueMap};

use crate::chunk::{Chunk, Function};
use crate::error::VmError;
use crate::host::Host;
use crate::opcode::OpCode;

/// Maximum number of values on the stack.
pub const STACK_MAX: usize = 256;

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;

/// Instructions between deadline checks and cooperative yields.
const CHECK_EVERY: u32 = 1024;

/// Globals with this prefix stay inside the VM (compiled functions).
pub const FUNCTION_GLOBAL_PREFIX: &str = "_fn.";

struct Frame {
    chunk: Arc<Chunk>,
    ip: usize,
    base: usize,
    /// Which local slots hold a value.
    defined: Vec<bool>,
}

/// Snapshot taken by `TryBegin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchFrame {
    pub target: usize,
    pub sp: usize,
    pub frames: usize,
}

enum Step {
    Continue,
    Done,
}

/// Bytecode interpreter bound to a host.
pub struct Vm<H: Host> {
    host: H,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<CatchFrame>,
    globals: HashMap<String, Value>,
}

impl<H: Host> Vm<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            handlers: Vec::new(),
            globals: HashMap::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    /// Values currently on the stack.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Execute `chunk` to completion.
    ///
    /// Named top-level locals start from the host's value when it has one
    /// and are written back when execution stops.
    ///
    /// # Errors
    ///
    /// Returns the first error not caught by a `try` handler. Control-flow
    /// sentinels and timeouts are never caught.
    pub async fn run(&mut self, chunk: Arc<Chunk>) -> Result<(), RuntimeError> {
        self.stack.clear();
        self.frames.clear();
        self.handlers.clear();

        let result = self.execute(chunk).await;

        self.stack.clear();
        self.frames.clear();
        self.handlers.clear();
        result
    }

    async fn execute(&mut self, chunk: Arc<Chunk>) -> Result<(), RuntimeError> {
        self.enter(chunk, 0, 0)?;
        self.load_locals();

        let mut steps = 0_u32;
        loop {
            steps = steps.wrapping_add(1);
            if steps % CHECK_EVERY == 0 {
                self.host.check()?;
                tokio::task::yield_now().await;
            }
            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => return Ok(()),
                Err(err) => self.recover(err)?,
            }
        }
    }

    /// Unwind to the innermost handler, or give the error back.
    fn recover(&mut self, err: RuntimeError) -> Result<(), RuntimeError> {
        if err.is_sentinel() || err.is_timeout() {
            return Err(err);
        }
        let Some(handler) = self.handlers.pop() else {
            return Err(err);
        };
        tracing::debug!(error = %err, target = handler.target, "vm caught error");
        self.frames.truncate(handler.frames);
        self.stack.truncate(handler.sp);
        let frame = self.frames.last_mut().ok_or(VmError::StackUnderflow)?;
        frame.ip = handler.target;
        self.push(error_value(&err))?;
        Ok(())
    }

    /// Push a frame whose locals start at `base`; `args` locals are already
    /// on the stack.
    fn enter(&mut self, chunk: Arc<Chunk>, base: usize, args: usize) -> Result<(), VmError> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(VmError::FrameOverflow { limit: FRAMES_MAX });
        }
        let locals = chunk.locals.len();
        for _ in args..locals {
            self.push(Value::Nil)?;
        }
        let mut defined = vec![false; locals];
        for slot in defined.iter_mut().take(args) {
            *slot = true;
        }
        self.frames.push(Frame {
            chunk,
            ip: 0,
            base,
            defined,
        });
        Ok(())
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= STACK_MAX {
            return Err(VmError::StackOverflow { limit: STACK_MAX });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn frame(&self) -> Result<&Frame, VmError> {
        self.frames.last().ok_or(VmError::StackUnderflow)
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, VmError> {
        self.frames.last_mut().ok_or(VmError::StackUnderflow)
    }

    fn read_u8(&mut self) -> Result<u8, VmError> {
        let frame = self.frame_mut()?;
        let byte = *frame.chunk.code.get(frame.ip).ok_or(VmError::Truncated)?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, VmError> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn constant(&self, index: u16) -> Result<Value, VmError> {
        let index = usize::from(index);
        self.frame()?
            .chunk
            .constants
            .get(index)
            .map(crate::chunk::Constant::to_value)
            .ok_or(VmError::BadConstant(index))
    }

    fn constant_name(&self, index: u16) -> Result<String, VmError> {
        match self.constant(index)? {
            Value::String(name) => Ok(name),
            other => Err(VmError::Type(format!(
                "expected a name constant, got {}",
                other.type_name()
            ))),
        }
    }

    fn jump(&mut self, forward: bool, offset: u16) -> Result<(), VmError> {
        let frame = self.frame_mut()?;
        let offset = usize::from(offset);
        frame.ip = if forward {
            frame.ip + offset
        } else {
            frame.ip.checked_sub(offset).ok_or(VmError::Truncated)?
        };
        Ok(())
    }

    /// Copy named, defined locals of the current frame into the host.
    fn sync_locals(&mut self) {
        let Some(frame) = self.frames.last() else {
            return;
        };
        for (slot, name) in frame.chunk.locals.iter().enumerate() {
            if frame.chunk.is_hidden(slot) || !frame.defined[slot] {
                continue;
            }
            if let Some(value) = self.stack.get(frame.base + slot) {
                self.host.set(name, value.clone());
            }
        }
    }

    /// Refresh named locals of the current frame from the host.
    fn load_locals(&mut self) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        for (slot, name) in frame.chunk.locals.iter().enumerate() {
            if frame.chunk.is_hidden(slot) {
                continue;
            }
            if let Some(value) = self.host.get(name) {
                if let Some(cell) = self.stack.get_mut(frame.base + slot) {
                    *cell = value;
                    frame.defined[slot] = true;
                }
            }
        }
    }

    fn binary(&mut self, op: BinOp) -> Result<(), RuntimeError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = op.apply(&lhs, &rhs)?;
        self.push(result)?;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn step(&mut self) -> Result<Step, RuntimeError> {
        let offset = self.frame()?.ip;
        if offset >= self.frame()?.chunk.code.len() {
            return self.finish_frame(Value::Nil);
        }
        let byte = self.read_u8()?;
        let op = OpCode::from_byte(byte).ok_or(VmError::InvalidOpcode { byte, offset })?;

        match op {
            OpCode::Constant => {
                let index = self.read_u16()?;
                let value = self.constant(index)?;
                self.push(value)?;
            }
            OpCode::Nil => self.push(Value::Nil)?,
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Dup => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.push(top)?;
            }
            OpCode::GetGlobal => {
                let index = self.read_u16()?;
                let name = self.constant_name(index)?;
                let value = match self.globals.get(&name) {
                    Some(value) => Some(value.clone()),
                    None => self.host.get(&name),
                };
                self.push(value.unwrap_or_default())?;
            }
            OpCode::SetGlobal => {
                let index = self.read_u16()?;
                let name = self.constant_name(index)?;
                let value = self.pop()?;
                if name.starts_with(FUNCTION_GLOBAL_PREFIX) {
                    self.globals.insert(name, value);
                } else {
                    self.host.set(&name, value);
                }
            }
            OpCode::GetLocal => {
                let slot = usize::from(self.read_u8()?);
                let base = self.frame()?.base;
                let value = self
                    .stack
                    .get(base + slot)
                    .cloned()
                    .ok_or(VmError::BadLocal(slot))?;
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = usize::from(self.read_u8()?);
                let value = self.pop()?;
                let frame = self.frames.last_mut().ok_or(VmError::StackUnderflow)?;
                let cell = self
                    .stack
                    .get_mut(frame.base + slot)
                    .ok_or(VmError::BadLocal(slot))?;
                *cell = value;
                if let Some(defined) = frame.defined.get_mut(slot) {
                    *defined = true;
                }
            }
            OpCode::Add => self.binary(BinOp::Add)?,
            OpCode::Sub => self.binary(BinOp::Sub)?,
            OpCode::Mul => self.binary(BinOp::Mul)?,
            OpCode::Div => self.binary(BinOp::Div)?,
            OpCode::Mod => self.binary(BinOp::Rem)?,
            OpCode::Equal => self.binary(BinOp::Eq)?,
            OpCode::NotEqual => self.binary(BinOp::Ne)?,
            OpCode::Greater => self.binary(BinOp::Gt)?,
            OpCode::GreaterEqual => self.binary(BinOp::Ge)?,
            OpCode::Less => self.binary(BinOp::Lt)?,
            OpCode::LessEqual => self.binary(BinOp::Le)?,
            OpCode::Negate => {
                let value = match self.pop()? {
                    Value::Int(i) => Value::Int(
                        i.checked_neg()
                            .ok_or_else(|| VmError::Type("integer overflow".into()))?,
                    ),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(VmError::Type(format!("cannot negate {}", other.type_name())).into());
                    }
                };
                self.push(value)?;
            }
            OpCode::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            OpCode::GetProperty => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.push(property(&container, &key))?;
            }
            OpCode::BuildList => {
                let count = usize::from(self.read_u16()?);
                let start = self
                    .stack
                    .len()
                    .checked_sub(count)
                    .ok_or(VmError::StackUnderflow)?;
                let items = self.stack.split_off(start);
                self.push(Value::List(items))?;
            }
            OpCode::BuildMap => {
                let pairs = usize::from(self.read_u16()?);
                let start = self
                    .stack
                    .len()
                    .checked_sub(pairs * 2)
                    .ok_or(VmError::StackUnderflow)?;
                let flat = self.stack.split_off(start);
                let mut map = ValueMap::with_capacity(pairs);
                let mut iter = flat.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    map.insert(key.to_display_string(), value);
                }
                self.push(Value::Map(map))?;
            }
            OpCode::Jump => {
                let offset = self.read_u16()?;
                self.jump(true, offset)?;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16()?;
                if !self.pop()?.is_truthy() {
                    self.jump(true, offset)?;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16()?;
                self.jump(false, offset)?;
            }
            OpCode::Call => {
                let argc = usize::from(self.read_u8()?);
                self.call(argc)?;
            }
            OpCode::Return => {
                let result = self.pop()?;
                return self.finish_frame(result);
            }
            OpCode::IterNext => {
                let offset = self.read_u16()?;
                self.iter_next(offset)?;
            }
            OpCode::IterEnd => {
                let len = self.stack.len();
                if len < 4 {
                    return Err(VmError::StackUnderflow.into());
                }
                self.stack.truncate(len - 4);
            }
            OpCode::CallSlot => {
                let index = self.read_u16()?;
                let pairs = usize::from(self.read_u8()?);
                let name = self.constant_name(index)?;
                let start = self
                    .stack
                    .len()
                    .checked_sub(pairs * 2)
                    .ok_or(VmError::StackUnderflow)?;
                let flat = self.stack.split_off(start);
                let mut args = ValueMap::with_capacity(pairs);
                let mut iter = flat.into_iter();
                while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                    args.insert(key.to_display_string(), value);
                }

                self.sync_locals();
                tracing::trace!(slot = %name, "vm slot call");
                let result = self.host.call(&name, args).await?;
                self.load_locals();
                self.push(result)?;
            }
            OpCode::TryBegin => {
                let offset = usize::from(self.read_u16()?);
                let target = self.frame()?.ip + offset;
                self.handlers.push(CatchFrame {
                    target,
                    sp: self.stack.len(),
                    frames: self.frames.len(),
                });
            }
            OpCode::TryEnd => {
                self.handlers.pop();
            }
            OpCode::Stop => {
                self.sync_locals();
                return Ok(Step::Done);
            }
        }
        Ok(Step::Continue)
    }

    /// Pop the current frame, leaving `result` for the caller.
    fn finish_frame(&mut self, result: Value) -> Result<Step, RuntimeError> {
        self.sync_locals();
        let frame = self.frames.pop().ok_or(VmError::StackUnderflow)?;
        let depth = self.frames.len();
        self.handlers.retain(|h| h.frames <= depth);
        if self.frames.is_empty() {
            return Ok(Step::Done);
        }
        // Drop the callee and everything above it.
        self.stack.truncate(frame.base.saturating_sub(1));
        self.push(result)?;
        Ok(Step::Continue)
    }

    fn call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee_at = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or(VmError::StackUnderflow)?;
        let function = match &self.stack[callee_at] {
            Value::Opaque(o) => o.downcast::<Function>(),
            _ => None,
        }
        .ok_or_else(|| VmError::Type("value is not callable".into()))?;

        if usize::from(function.arity) != argc {
            return Err(RuntimeError::failed(format!(
                "function '{}' expects {} arguments, got {argc}",
                function.name, function.arity
            )));
        }
        self.sync_locals();
        self.enter(Arc::clone(&function.chunk), callee_at + 1, argc)?;
        Ok(())
    }

    fn iter_next(&mut self, offset: u16) -> Result<(), RuntimeError> {
        let len = self.stack.len();
        if len < 2 {
            return Err(VmError::StackUnderflow.into());
        }
        let index = match &self.stack[len - 2] {
            Value::Int(i) => usize::try_from(*i).unwrap_or(usize::MAX),
            _ => return Err(VmError::Type("corrupt iterator index".into()).into()),
        };
        let element = match &self.stack[len - 1] {
            Value::Nil => None,
            Value::List(items) => items.get(index).cloned(),
            Value::Map(map) => map.get_index(index).map(|(_, v)| v.clone()),
            Value::Int(n) => {
                let i = i64::try_from(index).unwrap_or(i64::MAX);
                (i < *n).then_some(Value::Int(i))
            }
            other => {
                return Err(RuntimeError::failed(format!(
                    "cannot iterate over {}",
                    other.type_name()
                )));
            }
        };

        if let Some(element) = element {
            self.stack[len - 2] = Value::Int(i64::try_from(index + 1).unwrap_or(i64::MAX));
            self.push(element)?;
            self.push(Value::Bool(true))?;
        } else {
            self.push(Value::Nil)?;
            self.push(Value::Bool(false))?;
            self.jump(true, offset)?;
        }
        Ok(())
    }
}

/// Member of a map (by key) or list (by index); nil otherwise.
fn property(container: &Value, key: &Value) -> Value {
    match container {
        Value::Map(map) => map
            .get(&key.to_display_string())
            .cloned()
            .unwrap_or_default(),
        Value::List(items) => key
            .to_display_string()
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or_default(),
        _ => Value::Nil,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkBuilder, Constant};
    use crate::host::NoopHost;

    async fn run(chunk: Chunk) -> (Vm<NoopHost>, Result<(), RuntimeError>) {
        let mut vm = Vm::new(NoopHost::new());
        let result = vm.run(Arc::new(chunk)).await;
        (vm, result)
    }

    #[tokio::test]
    async fn test_arithmetic_into_local() {
        let mut b = ChunkBuilder::new();
        let x = b.local("x").unwrap();
        b.emit_constant(Constant::Number(6.0)).unwrap();
        b.emit_constant(Constant::Number(7.0)).unwrap();
        b.op(OpCode::Mul).op_u8(OpCode::SetLocal, x).op(OpCode::Stop);

        let (vm, result) = run(b.finish()).await;
        result.unwrap();
        assert_eq!(vm.host().globals.get("x"), Some(&Value::Int(42)));
        assert_eq!(vm.stack_len(), 0);
    }

    #[tokio::test]
    async fn test_iteration_sums_list() {
        let mut b = ChunkBuilder::new();
        let s = b.local("s").unwrap();
        let item = b.local("@item").unwrap();
        b.emit_constant(Constant::Number(0.0)).unwrap();
        b.op_u8(OpCode::SetLocal, s);
        // hidden index, then the iterable
        b.emit_constant(Constant::Number(0.0)).unwrap();
        for n in [10.0, 20.0, 30.0] {
            b.emit_constant(Constant::Number(n)).unwrap();
        }
        b.op_u16(OpCode::BuildList, 3);
        let top = b.len();
        let exit = b.emit_jump(OpCode::IterNext);
        b.op(OpCode::Pop).op_u8(OpCode::SetLocal, item);
        b.op_u8(OpCode::GetLocal, s)
            .op_u8(OpCode::GetLocal, item)
            .op(OpCode::Add)
            .op_u8(OpCode::SetLocal, s);
        b.emit_loop(top).unwrap();
        b.patch_jump(exit).unwrap();
        b.op(OpCode::IterEnd).op(OpCode::Stop);

        let (vm, result) = run(b.finish()).await;
        result.unwrap();
        assert_eq!(vm.host().globals.get("s"), Some(&Value::Int(60)));
        assert!(!vm.host().globals.contains_key("@item"));
        assert_eq!(vm.stack_len(), 0);
    }

    #[tokio::test]
    async fn test_try_catches_slot_error_and_restores_stack() {
        struct Failing;

        #[async_trait::async_trait]
        impl Host for Failing {
            async fn call(&mut self, _: &str, _: ValueMap) -> Result<Value, RuntimeError> {
                Err(RuntimeError::failed("db down"))
            }
            fn get(&self, _: &str) -> Option<Value> {
                None
            }
            fn set(&mut self, key: &str, value: Value) {
                assert_eq!(key, "err");
                let diagnostic = value.as_map().expect("diagnostic map");
                assert_eq!(diagnostic["message"], Value::from("db down"));
            }
        }

        let mut b = ChunkBuilder::new();
        let err = b.local("err").unwrap();
        let handler = b.emit_jump(OpCode::TryBegin);
        b.op(OpCode::Nil).op(OpCode::Nil);
        let name = b.constant(Constant::String("db.query".into())).unwrap();
        b.call_slot(name, 0);
        b.op(OpCode::TryEnd);
        let done = b.emit_jump(OpCode::Jump);
        b.patch_jump(handler).unwrap();
        b.op_u8(OpCode::SetLocal, err);
        b.patch_jump(done).unwrap();
        b.op(OpCode::Stop);

        let mut vm = Vm::new(Failing);
        vm.run(Arc::new(b.finish())).await.unwrap();
        assert_eq!(vm.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_sentinels_are_not_caught() {
        struct Responds;

        #[async_trait::async_trait]
        impl Host for Responds {
            async fn call(&mut self, _: &str, _: ValueMap) -> Result<Value, RuntimeError> {
                Err(RuntimeError::Return)
            }
            fn get(&self, _: &str) -> Option<Value> {
                None
            }
            fn set(&mut self, _: &str, _: Value) {}
        }

        let mut b = ChunkBuilder::new();
        b.emit_jump(OpCode::TryBegin);
        let name = b.constant(Constant::String("http.response".into())).unwrap();
        b.call_slot(name, 0);
        b.op(OpCode::Stop);

        let mut vm = Vm::new(Responds);
        let err = vm.run(Arc::new(b.finish())).await.unwrap_err();
        assert_eq!(err, RuntimeError::Return);
    }

    #[tokio::test]
    async fn test_stack_overflow() {
        let mut b = ChunkBuilder::new();
        let top = b.len();
        b.op(OpCode::Nil);
        b.emit_loop(top).unwrap();

        let (_, result) = run(b.finish()).await;
        assert!(result.unwrap_err().to_string().contains("stack overflow"));
    }

    #[tokio::test]
    async fn test_unbounded_recursion_hits_frame_limit() {
        let mut inner = ChunkBuilder::new();
        let name = inner.constant(Constant::String("_fn.f".into())).unwrap();
        inner.op_u16(OpCode::GetGlobal, name).op_u8(OpCode::Call, 0).op(OpCode::Return);
        let f = Arc::new(Function {
            name: "f".into(),
            arity: 0,
            chunk: Arc::new(inner.finish()),
        });

        let mut b = ChunkBuilder::new();
        b.emit_constant(Constant::Function(f)).unwrap();
        let global = b.constant(Constant::String("_fn.f".into())).unwrap();
        b.op_u16(OpCode::SetGlobal, global)
            .op_u16(OpCode::GetGlobal, global)
            .op_u8(OpCode::Call, 0)
            .op(OpCode::Pop)
            .op(OpCode::Stop);

        let (_, result) = run(b.finish()).await;
        assert!(result.unwrap_err().to_string().contains("call frames"));
    }

    #[tokio::test]
    async fn test_invalid_opcode() {
        let chunk = Chunk {
            code: vec![250],
            ..Chunk::default()
        };
        let (_, result) = run(chunk).await;
        assert!(result.unwrap_err().to_string().contains("invalid opcode 0xfa"));
    }
}
