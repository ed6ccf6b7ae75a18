//! User-defined functions: `fn`, `call`, `return`.
//!
//! A call runs the body in a fresh frame scope whose parent is the caller's
//! scope, so functions read outer variables but never write them. The
//! return value travels in the frame under [`RETURN_VALUE_KEY`].

use async_trait::async_trait;
use zeno_common::RuntimeError;

use crate::context::Context;
use crate::node::Node;
use crate::registry::SlotHandler;
use crate::scope::{FUNCTION_PREFIX, RETURN_VALUE_KEY, Scope};
use crate::value::{Opaque, Value};

/// Maximum nesting of scopes a call may start from.
pub const MAX_CALL_DEPTH: usize = 64;

/// A declared function.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Node,
}

/// Scope key under which a function is stored.
pub fn function_key(name: &str) -> String {
    format!("{FUNCTION_PREFIX}{name}")
}

/// `fn: <name>` with an optional `params` list and a `do` body.
pub struct Declare;

#[async_trait]
impl SlotHandler for Declare {
    async fn call(&self, _: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let name = node
            .value_str()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| RuntimeError::failed("fn requires a name"))?
            .to_string();

        let params = match node.child("params").map(|p| &p.value) {
            Some(Value::List(items)) => items.iter().map(Value::to_display_string).collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        };
        let body = node.child("do").cloned().unwrap_or_else(|| Node::new("do"));

        tracing::debug!(function = %name, params = ?params, "declared function");
        scope.set(
            function_key(&name),
            Value::Opaque(Opaque::new(FunctionDef { name, params, body })),
        );
        Ok(())
    }
}

fn depth(scope: &Scope) -> usize {
    let mut n = 0;
    let mut current = Some(scope);
    while let Some(s) = current {
        n += 1;
        current = s.parent();
    }
    n
}

/// `call: <name>` with named arguments (or an `args` list) and `as`.
pub struct Call;

#[async_trait]
impl SlotHandler for Call {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let name = engine.resolve(&node.value, scope)?.to_display_string();

        let def = scope
            .get(&function_key(&name))
            .and_then(|v| v.as_opaque().and_then(Opaque::downcast::<FunctionDef>))
            .ok_or_else(|| RuntimeError::failed(format!("undefined function '{name}'")))?;

        if depth(scope) > MAX_CALL_DEPTH {
            return Err(RuntimeError::failed(format!(
                "call depth exceeded while calling '{name}'"
            )));
        }

        let named = engine.attributes(node, scope, &["as", "args"])?;
        let positional = match engine.attr(node, "args", scope)? {
            Some(Value::List(items)) => items,
            _ => Vec::new(),
        };

        let frame = scope.frame_child();
        for (i, param) in def.params.iter().enumerate() {
            let value = named
                .get(param)
                .cloned()
                .or_else(|| positional.get(i).cloned())
                .unwrap_or_default();
            frame.set(param.clone(), value);
        }
        for (key, value) in &named {
            if !def.params.contains(key) {
                frame.set(key.clone(), value.clone());
            }
        }

        match engine.execute_children(ctx, &def.body, &frame).await {
            Ok(()) | Err(RuntimeError::FnReturn) => {}
            Err(e) => return Err(e),
        }

        if let Some(target) = node.as_name() {
            let result = frame.get_local(RETURN_VALUE_KEY).unwrap_or_default();
            scope.set(target, result);
        }
        Ok(())
    }
}

/// `return: <value>` leaves the innermost function frame.
pub struct Return;

#[async_trait]
impl SlotHandler for Return {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let value = engine.resolve_node(node, scope)?;
        scope.frame().set(RETURN_VALUE_KEY, value);
        Err(RuntimeError::FnReturn)
    }
}
