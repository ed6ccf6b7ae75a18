//! `var`, `log`, `sleep`, `noop`.

use std::time::Duration;

use async_trait::async_trait;
use zeno_common::{RuntimeError, parse_duration};

use crate::context::Context;
use crate::node::Node;
use crate::registry::SlotHandler;
use crate::scope::Scope;
use crate::value::Value;

/// `var: <name>` with a `value` attribute; declares in the current scope.
pub struct Var;

#[async_trait]
impl SlotHandler for Var {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let name = match node.value_str() {
            Some(name) => name.trim_start_matches('$').to_string(),
            None => engine
                .attr_string(node, "name", scope)?
                .ok_or_else(|| RuntimeError::failed("var requires a name"))?,
        };
        let value = engine.attr(node, "value", scope)?.unwrap_or_default();
        scope.set(name, value);
        Ok(())
    }
}

/// `log: <message>` with an optional `level`.
pub struct Log;

#[async_trait]
impl SlotHandler for Log {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let message = engine.value_or_attr(node, "message", scope)?.to_display_string();
        let level = engine
            .attr_string(node, "level", scope)?
            .unwrap_or_else(|| "info".to_string());
        let at = &node.location;

        match level.to_ascii_lowercase().as_str() {
            "trace" => tracing::trace!(slot = "log", location = %at, "{message}"),
            "debug" => tracing::debug!(slot = "log", location = %at, "{message}"),
            "warn" | "warning" => tracing::warn!(slot = "log", location = %at, "{message}"),
            "error" => tracing::error!(slot = "log", location = %at, "{message}"),
            _ => tracing::info!(slot = "log", location = %at, "{message}"),
        }
        Ok(())
    }
}

/// Duration from a number of milliseconds or a `100ms` / `2s` string.
pub fn duration_of(value: &Value) -> Result<Duration, RuntimeError> {
    match value {
        Value::Int(ms) => Ok(Duration::from_millis(u64::try_from(*ms).unwrap_or(0))),
        Value::Float(ms) => Ok(Duration::from_secs_f64((ms / 1000.0).max(0.0))),
        Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<u64>() {
                return Ok(Duration::from_millis(ms));
            }
            parse_duration(s).map_err(RuntimeError::failed)
        }
        other => Err(RuntimeError::failed(format!(
            "expected a duration, got {}",
            other.type_name()
        ))),
    }
}

/// `sleep: <duration>`; cut short by the request deadline.
pub struct Sleep;

#[async_trait]
impl SlotHandler for Sleep {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let duration = duration_of(&engine.value_or_attr(node, "duration", scope)?)?;
        ctx.sleep(duration).await
    }
}

pub struct Noop;

#[async_trait]
impl SlotHandler for Noop {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        Ok(())
    }
}
