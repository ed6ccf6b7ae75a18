//! Branching, loops and error handling.

use async_trait::async_trait;
use zeno_common::RuntimeError;

use crate::context::Context;
use crate::engine::{Engine, YIELD_EVERY};
use crate::node::Node;
use crate::registry::SlotHandler;
use crate::scope::Scope;
use crate::value::Value;

/// `if: <cond>` with `then` / `else` blocks.
pub struct If;

#[async_trait]
impl SlotHandler for If {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let condition = engine.resolve(&node.value, scope)?;

        if condition.is_truthy() {
            match node.child("then") {
                Some(then) => engine.execute_children(ctx, then, scope).await,
                None => engine.execute_body(ctx, node, scope, &["else"]).await,
            }
        } else if let Some(otherwise) = node.child("else") {
            engine.execute_children(ctx, otherwise, scope).await
        } else {
            Ok(())
        }
    }
}

/// `switch: <value>` with `case: <v>` blocks and an optional `default`.
pub struct Switch;

#[async_trait]
impl SlotHandler for Switch {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let subject = engine.resolve(&node.value, scope)?;

        for case in node.children_named("case") {
            let candidate = engine.resolve(&case.value, scope)?;
            let matched = match &candidate {
                Value::List(options) => options.iter().any(|o| o.loose_eq(&subject)),
                single => single.loose_eq(&subject),
            };
            if matched {
                return engine.execute_children(ctx, case, scope).await;
            }
        }

        match node.child("default") {
            Some(default) => engine.execute_children(ctx, default, scope).await,
            None => Ok(()),
        }
    }
}

/// Outcome of one loop body run.
enum Flow {
    Next,
    Stop,
}

async fn run_iteration(
    engine: &Engine,
    ctx: &Context,
    node: &Node,
    scope: &Scope,
) -> Result<Flow, RuntimeError> {
    match engine
        .execute_body(ctx, node, scope, &["as", "index", "key"])
        .await
    {
        Ok(()) | Err(RuntimeError::Continue) => Ok(Flow::Next),
        Err(RuntimeError::Break) => Ok(Flow::Stop),
        Err(e) => Err(e),
    }
}

/// Items produced by a `for` source.
enum Source {
    Items(Vec<(Value, Value)>),
    Range { start: i64, end: Option<i64> },
}

fn parse_range(text: &str, engine: &Engine, scope: &Scope) -> Result<Option<Source>, RuntimeError> {
    let Some((lo, hi)) = text.split_once("..") else {
        return Ok(None);
    };
    let bound = |part: &str| -> Result<Option<i64>, RuntimeError> {
        let part = part.trim();
        if part.is_empty() || part == "∞" || part == "inf" {
            return Ok(None);
        }
        let value = engine.resolve(&Value::from(part), scope)?;
        value
            .as_i64()
            .map(Some)
            .ok_or_else(|| RuntimeError::failed(format!("invalid range bound '{part}'")))
    };
    let Some(start) = bound(lo)? else {
        return Err(RuntimeError::failed(format!("range '{text}' has no start")));
    };
    Ok(Some(Source::Range {
        start,
        end: bound(hi)?,
    }))
}

fn source_of(value: Value, engine: &Engine, scope: &Scope) -> Result<Source, RuntimeError> {
    Ok(match value {
        Value::Nil => Source::Items(Vec::new()),
        Value::List(items) => Source::Items(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i64::try_from(i).unwrap_or(i64::MAX)), v))
                .collect(),
        ),
        Value::Map(map) => Source::Items(
            map.into_iter()
                .map(|(k, v)| (Value::String(k), v))
                .collect(),
        ),
        Value::Int(n) => Source::Range {
            start: 0,
            end: Some(n - 1),
        },
        Value::String(text) => parse_range(&text, engine, scope)?
            .ok_or_else(|| RuntimeError::failed(format!("cannot iterate over string '{text}'")))?,
        other => {
            return Err(RuntimeError::failed(format!(
                "cannot iterate over {}",
                other.type_name()
            )));
        }
    })
}

/// Per-item state of a running `for`.
struct Iteration<'a> {
    engine: &'a Engine,
    ctx: &'a Context,
    node: &'a Node,
    scope: &'a Scope,
    item_name: String,
    index_name: Option<String>,
    step: usize,
}

impl Iteration<'_> {
    async fn visit(&mut self, index: Value, item: Value) -> Result<Flow, RuntimeError> {
        self.step += 1;
        if self.step % YIELD_EVERY == 0 {
            tokio::task::yield_now().await;
        }
        self.ctx.check_deadline()?;
        let body = self.scope.child();
        body.set(self.item_name.clone(), item);
        if let Some(name) = &self.index_name {
            body.set(name.clone(), index);
        }
        run_iteration(self.engine, self.ctx, self.node, &body).await
    }
}

/// `for: <list|map|range>` binding `as` (and optionally `index`) per item.
///
/// Ranges are inclusive: `"1..3"` yields 1, 2, 3; `"1.."` is unbounded.
pub struct For;

#[async_trait]
impl SlotHandler for For {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let source = source_of(engine.resolve(&node.value, scope)?, engine, scope)?;

        let mut iteration = Iteration {
            engine,
            ctx,
            node,
            scope,
            item_name: node.as_name().unwrap_or_else(|| "item".to_string()),
            index_name: node
                .child("index")
                .or_else(|| node.child("key"))
                .and_then(|c| c.value.as_str())
                .map(|s| s.trim_start_matches('$').to_string()),
            step: 0,
        };

        match source {
            Source::Items(items) => {
                for (index, item) in items {
                    if let Flow::Stop = iteration.visit(index, item).await? {
                        break;
                    }
                }
            }
            Source::Range { start, end } => {
                let mut i = start;
                while end.is_none_or(|end| i <= end) {
                    if let Flow::Stop = iteration.visit(Value::Int(i - start), Value::Int(i)).await? {
                        break;
                    }
                    i += 1;
                }
            }
        }
        Ok(())
    }
}

/// `while: <cond>` re-evaluating the condition before each iteration.
pub struct While;

#[async_trait]
impl SlotHandler for While {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let mut step = 0_usize;

        loop {
            step += 1;
            if step % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
            ctx.check_deadline()?;
            if !engine.resolve(&node.value, scope)?.is_truthy() {
                return Ok(());
            }
            let body = scope.child();
            if let Flow::Stop = run_iteration(engine, ctx, node, &body).await? {
                return Ok(());
            }
        }
    }
}

pub struct Break;

#[async_trait]
impl SlotHandler for Break {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        Err(RuntimeError::Break)
    }
}

pub struct Continue;

#[async_trait]
impl SlotHandler for Continue {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        Err(RuntimeError::Continue)
    }
}

/// `try` with `do`, `catch` and `finally` blocks.
///
/// `catch` binds the diagnostic map `{message, slot, file, line, col}` to
/// `error`, or to the name given by `as` on the `catch` or `try` node.
/// Sentinels and timeouts are never caught.
pub struct Try;

/// Diagnostic of `err` as a scope value.
pub fn error_value(err: &RuntimeError) -> Value {
    let diag = err.diagnostic();
    serde_json::to_value(&diag).map_or(Value::Nil, Value::from_json)
}

#[async_trait]
impl SlotHandler for Try {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;

        let result = match node.child("do") {
            Some(body) => engine.execute_children(ctx, body, scope).await,
            None => Ok(()),
        };

        let result = match result {
            Err(err) if !err.is_sentinel() && !err.is_timeout() => {
                tracing::debug!(error = %err, "caught error");
                match node.child("catch") {
                    Some(catch) => {
                        let name = catch
                            .as_name()
                            .or_else(|| node.as_name())
                            .unwrap_or_else(|| "error".to_string());
                        let handler_scope = scope.child();
                        handler_scope.set(name, error_value(&err));
                        engine.execute_children(ctx, catch, &handler_scope).await
                    }
                    None => Ok(()),
                }
            }
            other => other,
        };

        if let Some(finally) = node.child("finally") {
            engine.execute_children(ctx, finally, scope).await?;
        }
        result
    }
}
