//! Slot tree → bytecode.
//!
//! Control flow (`if`, `switch`, `for`, `while`, `try`, `break`,
//! `continue`), assignments, expressions and functions declared in the same
//! tree compile to native instructions. Every other slot becomes a
//! `CallSlot` with its attributes evaluated into an argument map.
//!
//! Trees the VM cannot express with identical semantics are rejected with
//! `CompilationFailed`, and callers fall back to the interpreter:
//! - slots carrying nested blocks (`do`, `then`, ...);
//! - dotted assignment targets (`$user.email`);
//! - unbounded ranges, `index`/`key` loop bindings and list-valued `case`;
//! - `return`, `break` and `continue` outside their construct.
//!
//! Variables first assigned inside a loop body, a `catch` block or a
//! function are block-scoped and never written back to the host scope.

use std::collections::HashMap;
use std::sync::Arc;

use zeno_common::RuntimeError;
use zeno_core::engine::STRUCTURAL;
use zeno_core::expr::{self, BinOp, Expr, Operand};
use zeno_core::{Node, Value};

use crate::chunk::{Chunk, ChunkBuilder, Constant, Function, HIDDEN_PREFIX};
use crate::error::VmError;
use crate::opcode::OpCode;
use crate::vm::FUNCTION_GLOBAL_PREFIX;

/// Compile `root` into a top-level chunk.
///
/// # Errors
///
/// Returns `CompilationFailed` when the tree uses a construct the VM does
/// not support.
pub fn compile(root: &Node) -> Result<Chunk, RuntimeError> {
    let mut compiler = Compiler::default();
    let mut unit = Unit::new(false);
    compiler.statement(&mut unit, root)?;
    unit.builder.op(OpCode::Stop);
    Ok(unit.builder.finish())
}

fn unsupported(reason: impl Into<String>) -> RuntimeError {
    RuntimeError::compilation_failed(reason)
}

struct LoopState {
    start: usize,
    breaks: Vec<usize>,
    try_depth: usize,
    iterator: bool,
}

/// Per-chunk compilation state.
struct Unit {
    builder: ChunkBuilder,
    scopes: Vec<Vec<(String, u8)>>,
    loops: Vec<LoopState>,
    try_depth: usize,
    function: bool,
    temps: usize,
}

impl Unit {
    fn new(function: bool) -> Self {
        Self {
            builder: ChunkBuilder::new(),
            scopes: vec![Vec::new()],
            loops: Vec::new(),
            try_depth: 0,
            function,
            temps: 0,
        }
    }

    fn resolve(&self, name: &str) -> Option<u8> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, slot)| *slot)
    }

    fn declare(&mut self, name: &str) -> Result<u8, VmError> {
        let hidden = self.function || self.scopes.len() > 1;
        let stored = if hidden {
            format!("{HIDDEN_PREFIX}{name}")
        } else {
            name.to_string()
        };
        let slot = self.builder.local(stored)?;
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), slot));
        }
        Ok(slot)
    }

    fn temp(&mut self, what: &str) -> Result<u8, VmError> {
        self.temps += 1;
        self.builder
            .local(format!("{HIDDEN_PREFIX}{what}{}", self.temps))
    }

    fn store(&mut self, name: &str) -> Result<(), VmError> {
        let slot = match self.resolve(name) {
            Some(slot) => slot,
            None => self.declare(name)?,
        };
        self.builder.op_u8(OpCode::SetLocal, slot);
        Ok(())
    }

    /// Bind in the innermost block, shadowing outer variables.
    fn bind(&mut self, name: &str) -> Result<(), VmError> {
        let local = self
            .scopes
            .last()
            .and_then(|scope| scope.iter().rev().find(|(n, _)| n == name))
            .map(|(_, slot)| *slot);
        let slot = match local {
            Some(slot) => slot,
            None => self.declare(name)?,
        };
        self.builder.op_u8(OpCode::SetLocal, slot);
        Ok(())
    }

    fn patch(&mut self, site: usize) -> Result<(), VmError> {
        self.builder.patch_jump(site)
    }

    /// Close handlers opened since the innermost loop began.
    fn unwind_tries(&mut self) -> Result<(), RuntimeError> {
        let depth = self
            .loops
            .last()
            .map(|l| l.try_depth)
            .ok_or_else(|| unsupported("break or continue outside of a loop"))?;
        for _ in depth..self.try_depth {
            self.builder.op(OpCode::TryEnd);
        }
        Ok(())
    }
}

/// Children forming the body of `node`: its `do` block or, without one,
/// its children except `skip`.
fn body<'a>(node: &'a Node, skip: &'a [&'a str]) -> Box<dyn Iterator<Item = &'a Node> + 'a> {
    match node.child("do") {
        Some(block) => Box::new(block.children.iter()),
        None => Box::new(
            node.children
                .iter()
                .filter(move |c| !skip.contains(&c.name.as_str())),
        ),
    }
}

#[derive(Default)]
struct Compiler {
    /// Parameters of the functions declared so far.
    functions: HashMap<String, Vec<String>>,
}

impl Compiler {
    fn statement(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        if let Some(target) = node.name.strip_prefix('$') {
            if target.is_empty() || target.contains('.') {
                return Err(unsupported(format!("assignment to '{target}'")));
            }
            self.node_value(unit, node)?;
            unit.store(target)?;
            return Ok(());
        }

        match node.name.as_str() {
            "as" | "index" => Ok(()),
            "if" => self.if_stmt(unit, node),
            "switch" => self.switch_stmt(unit, node),
            "for" => self.for_stmt(unit, node),
            "while" => self.while_stmt(unit, node),
            "break" => {
                unit.unwind_tries()?;
                let iterator = unit.loops.last().is_some_and(|l| l.iterator);
                if iterator {
                    unit.builder.op(OpCode::Nil).op(OpCode::False);
                }
                let site = unit.builder.emit_jump(OpCode::Jump);
                if let Some(state) = unit.loops.last_mut() {
                    state.breaks.push(site);
                }
                Ok(())
            }
            "continue" => {
                unit.unwind_tries()?;
                let start = unit.loops.last().map_or(0, |l| l.start);
                unit.builder.emit_loop(start)?;
                Ok(())
            }
            "try" => self.try_stmt(unit, node),
            "fn" => self.function(unit, node),
            "call" => self.call(unit, node),
            "return" => {
                if !unit.function {
                    return Err(unsupported("return outside of a function"));
                }
                self.node_value(unit, node)?;
                unit.builder.op(OpCode::Return);
                Ok(())
            }
            name if STRUCTURAL.contains(&name) => self.block(unit, node.children.iter()),
            _ => self.slot_call(unit, node),
        }
    }

    fn block<'a>(
        &mut self,
        unit: &mut Unit,
        nodes: impl Iterator<Item = &'a Node>,
    ) -> Result<(), RuntimeError> {
        for node in nodes {
            self.statement(unit, node)?;
        }
        Ok(())
    }

    fn if_stmt(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        self.value(unit, &node.value)?;
        let otherwise = unit.builder.emit_jump(OpCode::JumpIfFalse);
        match node.child("then") {
            Some(then) => self.block(unit, then.children.iter())?,
            None => self.block(unit, body(node, &["else"]))?,
        }
        let end = unit.builder.emit_jump(OpCode::Jump);
        unit.patch(otherwise)?;
        if let Some(branch) = node.child("else") {
            self.block(unit, branch.children.iter())?;
        }
        unit.patch(end)?;
        Ok(())
    }

    fn switch_stmt(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        self.value(unit, &node.value)?;
        let subject = unit.temp("switch")?;
        unit.builder.op_u8(OpCode::SetLocal, subject);

        let mut ends = Vec::new();
        for case in node.children_named("case") {
            if matches!(case.value, Value::List(_)) {
                return Err(unsupported("case with a list of values"));
            }
            unit.builder.op_u8(OpCode::GetLocal, subject);
            self.value(unit, &case.value)?;
            unit.builder.op(OpCode::Equal);
            let next = unit.builder.emit_jump(OpCode::JumpIfFalse);
            self.block(unit, case.children.iter())?;
            ends.push(unit.builder.emit_jump(OpCode::Jump));
            unit.patch(next)?;
        }
        if let Some(default) = node.child("default") {
            self.block(unit, default.children.iter())?;
        }
        for site in ends {
            unit.patch(site)?;
        }
        Ok(())
    }

    fn for_stmt(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        if node.has_child("index") || node.has_child("key") {
            return Err(unsupported("for with an index binding"));
        }
        let item = node.as_name().unwrap_or_else(|| "item".to_string());

        // Hidden index, then the iterable.
        unit.builder.emit_constant(Constant::Number(0.0))?;
        let offset = match &node.value {
            Value::String(text) if is_range(text) => {
                let (start, count) = bounded_range(text)?;
                unit.builder.emit_constant(Constant::Number(count))?;
                Some(start)
            }
            other => {
                self.value(unit, other)?;
                None
            }
        };

        let start = unit.builder.len();
        let exit = unit.builder.emit_jump(OpCode::IterNext);
        unit.scopes.push(Vec::new());
        unit.loops.push(LoopState {
            start,
            breaks: Vec::new(),
            try_depth: unit.try_depth,
            iterator: true,
        });

        unit.builder.op(OpCode::Pop);
        if let Some(first) = offset {
            unit.builder.emit_constant(Constant::Number(first))?;
            unit.builder.op(OpCode::Add);
        }
        let slot = unit.declare(&item)?;
        unit.builder.op_u8(OpCode::SetLocal, slot);
        self.block(unit, body(node, &["as", "index", "key"]))?;

        let state = unit.loops.pop();
        unit.scopes.pop();
        unit.builder.emit_loop(start)?;
        unit.patch(exit)?;
        for site in state.map(|s| s.breaks).unwrap_or_default() {
            unit.patch(site)?;
        }
        unit.builder.op(OpCode::IterEnd);
        Ok(())
    }

    fn while_stmt(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        let start = unit.builder.len();
        self.value(unit, &node.value)?;
        let exit = unit.builder.emit_jump(OpCode::JumpIfFalse);
        unit.scopes.push(Vec::new());
        unit.loops.push(LoopState {
            start,
            breaks: Vec::new(),
            try_depth: unit.try_depth,
            iterator: false,
        });

        self.block(unit, body(node, &["as", "index", "key"]))?;

        let state = unit.loops.pop();
        unit.scopes.pop();
        unit.builder.emit_loop(start)?;
        unit.patch(exit)?;
        for site in state.map(|s| s.breaks).unwrap_or_default() {
            unit.patch(site)?;
        }
        Ok(())
    }

    fn try_stmt(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        let handler = unit.builder.emit_jump(OpCode::TryBegin);
        unit.try_depth += 1;
        if let Some(block) = node.child("do") {
            self.block(unit, block.children.iter())?;
        }
        unit.try_depth -= 1;
        unit.builder.op(OpCode::TryEnd);
        let done = unit.builder.emit_jump(OpCode::Jump);

        // The VM pushes the error diagnostic before jumping here.
        unit.patch(handler)?;
        match node.child("catch") {
            Some(catch) => {
                let name = catch
                    .as_name()
                    .or_else(|| node.as_name())
                    .unwrap_or_else(|| "error".to_string());
                unit.scopes.push(Vec::new());
                let slot = unit.declare(&name)?;
                unit.builder.op_u8(OpCode::SetLocal, slot);
                self.block(unit, catch.children.iter())?;
                unit.scopes.pop();
            }
            None => {
                unit.builder.op(OpCode::Pop);
            }
        }
        unit.patch(done)?;

        if let Some(finally) = node.child("finally") {
            self.block(unit, finally.children.iter())?;
        }
        Ok(())
    }

    fn function(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        let name = node
            .value_str()
            .filter(|n| !n.is_empty() && !n.contains('$'))
            .ok_or_else(|| unsupported("fn without a literal name"))?
            .to_string();
        let params: Vec<String> = match node.child("params").map(|p| &p.value) {
            Some(Value::List(items)) => items.iter().map(Value::to_display_string).collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };
        let arity = u8::try_from(params.len()).map_err(|_| unsupported("too many parameters"))?;
        self.functions.insert(name.clone(), params.clone());

        let mut inner = Unit::new(true);
        for param in &params {
            inner.declare(param)?;
        }
        if let Some(block) = node.child("do") {
            self.block(&mut inner, block.children.iter())?;
        }
        inner.builder.op(OpCode::Nil).op(OpCode::Return);

        let function = Arc::new(Function {
            name: name.clone(),
            arity,
            chunk: Arc::new(inner.builder.finish()),
        });
        unit.builder.emit_constant(Constant::Function(function))?;
        let global = unit
            .builder
            .constant(Constant::String(format!("{FUNCTION_GLOBAL_PREFIX}{name}")))?;
        unit.builder.op_u16(OpCode::SetGlobal, global);
        Ok(())
    }

    fn call(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        let Some(params) = node
            .value_str()
            .and_then(|name| self.functions.get(name))
            .cloned()
        else {
            // Not declared in this tree: let the interpreter's `call` run it.
            return self.slot_call(unit, node);
        };
        let name = node.value_str().unwrap_or_default().to_string();

        if let Some(extra) = node
            .children
            .iter()
            .find(|c| c.name != "as" && c.name != "args" && !params.contains(&c.name))
        {
            return Err(unsupported(format!(
                "argument '{}' is not a parameter of '{name}'",
                extra.name
            )));
        }
        let positional = match node.child("args").map(|a| &a.value) {
            None => Vec::new(),
            Some(Value::List(items)) => items.clone(),
            Some(_) => return Err(unsupported("non-literal args list")),
        };

        let global = unit
            .builder
            .constant(Constant::String(format!("{FUNCTION_GLOBAL_PREFIX}{name}")))?;
        unit.builder.op_u16(OpCode::GetGlobal, global);
        for (i, param) in params.iter().enumerate() {
            match (node.child(param), positional.get(i)) {
                (Some(arg), _) => self.node_value(unit, arg)?,
                (None, Some(value)) => self.value(unit, value)?,
                (None, None) => {
                    unit.builder.op(OpCode::Nil);
                }
            }
        }
        let argc = u8::try_from(params.len()).map_err(|_| unsupported("too many arguments"))?;
        unit.builder.op_u8(OpCode::Call, argc);

        match node.as_name() {
            Some(target) => unit.bind(&target)?,
            None => {
                unit.builder.op(OpCode::Pop);
            }
        }
        Ok(())
    }

    fn slot_call(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        if !node.value.is_nil() && node.has_child("value") {
            return Err(unsupported(format!(
                "slot '{}' has both a value and a 'value' attribute",
                node.name
            )));
        }
        if let Some(block) = node
            .children
            .iter()
            .find(|c| STRUCTURAL.contains(&c.name.as_str()))
        {
            return Err(unsupported(format!(
                "slot '{}' has a '{}' block",
                node.name, block.name
            )));
        }

        let mut pairs = 0_usize;
        if !node.value.is_nil() {
            unit.builder.emit_constant(Constant::String("value".into()))?;
            self.value(unit, &node.value)?;
            pairs += 1;
        }
        for child in &node.children {
            unit.builder
                .emit_constant(Constant::String(child.name.clone()))?;
            if child.name == "as" {
                unit.builder
                    .emit_constant(Constant::String(child.value.to_display_string()))?;
            } else {
                self.node_value(unit, child)?;
            }
            pairs += 1;
        }

        let name = unit.builder.constant(Constant::String(node.name.clone()))?;
        let pairs = u8::try_from(pairs).map_err(|_| unsupported("too many slot arguments"))?;
        unit.builder.call_slot(name, pairs);

        match node.as_name() {
            Some(target) => unit.bind(&target)?,
            None => {
                unit.builder.op(OpCode::Pop);
            }
        }
        Ok(())
    }

    /// A node's value; a valueless node with children becomes a map.
    fn node_value(&mut self, unit: &mut Unit, node: &Node) -> Result<(), RuntimeError> {
        if node.value.is_nil() && !node.children.is_empty() {
            for child in &node.children {
                unit.builder
                    .emit_constant(Constant::String(child.name.clone()))?;
                self.node_value(unit, child)?;
            }
            let count =
                u16::try_from(node.children.len()).map_err(|_| unsupported("map too large"))?;
            unit.builder.op_u16(OpCode::BuildMap, count);
            return Ok(());
        }
        self.value(unit, &node.value)
    }

    /// A value as the interpreter would resolve it.
    fn value(&mut self, unit: &mut Unit, value: &Value) -> Result<(), RuntimeError> {
        match value {
            Value::String(s) => match expr::parse(s) {
                Some(parsed) => self.expr(unit, &parsed)?,
                None => {
                    unit.builder.emit_constant(Constant::String(s.clone()))?;
                }
            },
            Value::List(items) => {
                for item in items {
                    self.value(unit, item)?;
                }
                let count = u16::try_from(items.len()).map_err(|_| unsupported("list too large"))?;
                unit.builder.op_u16(OpCode::BuildList, count);
            }
            Value::Map(map) => {
                for (key, item) in map {
                    unit.builder.emit_constant(Constant::String(key.clone()))?;
                    self.value(unit, item)?;
                }
                let count = u16::try_from(map.len()).map_err(|_| unsupported("map too large"))?;
                unit.builder.op_u16(OpCode::BuildMap, count);
            }
            scalar => literal(unit, scalar)?,
        }
        Ok(())
    }

    fn expr(&mut self, unit: &mut Unit, expr: &Expr) -> Result<(), RuntimeError> {
        match expr {
            Expr::Operand(operand) => self.operand(unit, operand),
            Expr::Binary(BinOp::And, lhs, rhs) => {
                self.expr(unit, lhs)?;
                unit.builder.op(OpCode::Dup);
                let skip = unit.builder.emit_jump(OpCode::JumpIfFalse);
                unit.builder.op(OpCode::Pop);
                self.expr(unit, rhs)?;
                unit.patch(skip)?;
                unit.builder.op(OpCode::Not).op(OpCode::Not);
                Ok(())
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                self.expr(unit, lhs)?;
                unit.builder.op(OpCode::Dup).op(OpCode::Not);
                let skip = unit.builder.emit_jump(OpCode::JumpIfFalse);
                unit.builder.op(OpCode::Pop);
                self.expr(unit, rhs)?;
                unit.patch(skip)?;
                unit.builder.op(OpCode::Not).op(OpCode::Not);
                Ok(())
            }
            Expr::Binary(op, lhs, rhs) => {
                self.expr(unit, lhs)?;
                self.expr(unit, rhs)?;
                let code = binary_opcode(*op).ok_or_else(|| unsupported("logical operator"))?;
                unit.builder.op(code);
                Ok(())
            }
        }
    }

    fn operand(&mut self, unit: &mut Unit, operand: &Operand) -> Result<(), RuntimeError> {
        match operand {
            Operand::Path(path) => {
                let mut segments = path.split('.');
                let head = segments.next().unwrap_or_default();
                match unit.resolve(head) {
                    Some(slot) => {
                        unit.builder.op_u8(OpCode::GetLocal, slot);
                    }
                    None => {
                        let name = unit.builder.constant(Constant::String(head.to_string()))?;
                        unit.builder.op_u16(OpCode::GetGlobal, name);
                    }
                }
                for segment in segments {
                    unit.builder
                        .emit_constant(Constant::String(segment.to_string()))?;
                    unit.builder.op(OpCode::GetProperty);
                }
                Ok(())
            }
            Operand::Literal(value) => literal(unit, value),
            Operand::Not(inner) => {
                self.operand(unit, inner)?;
                unit.builder.op(OpCode::Not);
                Ok(())
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn literal(unit: &mut Unit, value: &Value) -> Result<(), RuntimeError> {
    match value {
        Value::Nil => {
            unit.builder.op(OpCode::Nil);
        }
        Value::Bool(true) => {
            unit.builder.op(OpCode::True);
        }
        Value::Bool(false) => {
            unit.builder.op(OpCode::False);
        }
        Value::Int(i) => {
            unit.builder.emit_constant(Constant::Number(*i as f64))?;
        }
        Value::Float(f) => {
            unit.builder.emit_constant(Constant::Number(*f))?;
        }
        Value::String(s) => {
            unit.builder.emit_constant(Constant::String(s.clone()))?;
        }
        Value::Opaque(o) => {
            unit.builder.emit_constant(Constant::Opaque(o.clone()))?;
        }
        Value::List(_) | Value::Map(_) => {
            return Err(unsupported("collection in literal position"));
        }
    }
    Ok(())
}

/// Opcode of a non-short-circuiting operator.
fn binary_opcode(op: BinOp) -> Option<OpCode> {
    let code = match op {
        BinOp::Eq => OpCode::Equal,
        BinOp::Ne => OpCode::NotEqual,
        BinOp::Lt => OpCode::Less,
        BinOp::Le => OpCode::LessEqual,
        BinOp::Gt => OpCode::Greater,
        BinOp::Ge => OpCode::GreaterEqual,
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Div => OpCode::Div,
        BinOp::Rem => OpCode::Mod,
        BinOp::Or | BinOp::And => return None,
    };
    Some(code)
}

fn is_range(text: &str) -> bool {
    text.contains("..") && !text.contains('$')
}

/// Start and element count of an inclusive `a..b` range.
#[allow(clippy::cast_precision_loss)]
fn bounded_range(text: &str) -> Result<(f64, f64), RuntimeError> {
    let (lo, hi) = text
        .split_once("..")
        .ok_or_else(|| unsupported("malformed range"))?;
    let start = lo
        .trim()
        .parse::<i64>()
        .map_err(|_| unsupported(format!("range '{text}' has no literal start")))?;
    let end = hi
        .trim()
        .parse::<i64>()
        .map_err(|_| unsupported(format!("unbounded or non-literal range '{text}'")))?;
    let count = end.saturating_sub(start).saturating_add(1).max(0);
    Ok((start as f64, count as f64))
}
