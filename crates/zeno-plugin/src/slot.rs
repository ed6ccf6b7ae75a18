//! Engine slots backed by plugins.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value as Json, json};
use tracing::{debug, error, warn};
use zeno_common::RuntimeError;
use zeno_core::scope::is_reserved;
use zeno_core::{Context, Engine, Node, Scope, SlotHandler, Value};

use crate::backend::{CallOutcome, CallRequest};
use crate::manager::{LoadedPlugin, PluginManager};

/// Parameter key holding the caller's visible variables.
pub const SCOPE_KEY: &str = "_scope";

/// Parameter that requests a fire-and-forget call.
pub const ASYNC_FLAG: &str = "async";

/// Dispatches one declared slot to the plugin currently loaded under a
/// name. The plugin is looked up per call, so a reload takes effect for
/// the next invocation.
pub struct PluginSlot {
    manager: Weak<PluginManager>,
    plugin: String,
}

impl PluginSlot {
    pub fn new(manager: Weak<PluginManager>, plugin: impl Into<String>) -> Self {
        Self {
            manager,
            plugin: plugin.into(),
        }
    }

    async fn loaded(&self) -> Result<Arc<LoadedPlugin>, RuntimeError> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| RuntimeError::plugin(&self.plugin, "plugin host has shut down"))?;
        manager
            .get(&self.plugin)
            .await
            .ok_or_else(|| RuntimeError::plugin(&self.plugin, "not loaded"))
    }
}

#[async_trait]
impl SlotHandler for PluginSlot {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let plugin = self.loaded().await?;
        let engine = ctx.require_engine()?;

        let mut parameters = collect_parameters(engine, node, scope)?;
        let background = parameters
            .remove(ASYNC_FLAG)
            .is_some_and(|flag| truthy(&flag));
        let snapshot = scope.snapshot();
        parameters.insert(SCOPE_KEY.into(), Value::Map(snapshot.clone()).to_json());

        let request = CallRequest {
            slot_name: node.name.clone(),
            parameters,
            context: Some(json!({
                "plugin": self.plugin,
                "file": node.location.file,
                "line": node.location.line,
            })),
        };

        if background {
            let name = self.plugin.clone();
            let slot = node.name.clone();
            tokio::spawn(async move {
                let call = AssertUnwindSafe(plugin.backend.call(request, snapshot)).catch_unwind();
                match call.await {
                    Ok(Ok(outcome)) if outcome.response.success => {
                        debug!(plugin = %name, slot = %slot, "background plugin call finished");
                    }
                    Ok(Ok(outcome)) => {
                        warn!(plugin = %name, slot = %slot, error = ?outcome.response.error, "background plugin call failed");
                    }
                    Ok(Err(e)) => {
                        warn!(plugin = %name, slot = %slot, error = %e, "background plugin call failed");
                    }
                    Err(_) => error!(plugin = %name, slot = %slot, "background plugin call panicked"),
                }
            });
            return Ok(());
        }

        let call = AssertUnwindSafe(plugin.backend.call(request, snapshot)).catch_unwind();
        let result = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, call)
                .await
                .map_err(|_| ctx.timeout_error())?,
            None => call.await,
        };
        let outcome: CallOutcome = result.map_err(|_| {
            error!(plugin = %self.plugin, slot = %node.name, "plugin call panicked");
            RuntimeError::plugin(&self.plugin, "plugin call panicked")
        })??;

        if !outcome.response.success {
            return Err(RuntimeError::plugin(
                &self.plugin,
                outcome
                    .response
                    .error
                    .unwrap_or_else(|| format!("{} failed", node.name)),
            ));
        }

        for (key, value) in outcome.scope_writes {
            scope.set(key, value);
        }
        let data = outcome.response.data.unwrap_or(Json::Null);
        if let Some(target) = node.as_name() {
            scope.set(target, Value::from_json(data.clone()));
        }
        if let Json::Object(map) = data {
            for (key, value) in map {
                if !is_reserved(&key) {
                    scope.set(key, Value::from_json(value));
                }
            }
        }
        Ok(())
    }
}

/// Node value (as `value`) and child attributes by name.
fn collect_parameters(
    engine: &Engine,
    node: &Node,
    scope: &Scope,
) -> Result<serde_json::Map<String, Json>, RuntimeError> {
    let mut parameters = serde_json::Map::new();
    if !node.value.is_nil() {
        let value = coerce(engine.resolve(&node.value, scope)?);
        parameters.insert("value".into(), value.to_json());
    }
    for child in &node.children {
        if child.name == "as" {
            continue;
        }
        let value = coerce(engine.resolve_node(child, scope)?);
        parameters.insert(child.name.clone(), value.to_json());
    }
    Ok(parameters)
}

/// Numeric and boolean strings become numbers and booleans.
fn coerce(value: Value) -> Value {
    let Value::String(text) = &value else {
        return value;
    };
    let trimmed = text.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Int(int);
    }
    match trimmed.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::Float(float),
        _ => value,
    }
}

fn truthy(flag: &Json) -> bool {
    match flag {
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Json::String(s) => matches!(s.as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(Value::from("42")), Value::Int(42));
        assert_eq!(coerce(Value::from("2.5")), Value::Float(2.5));
        assert_eq!(coerce(Value::from("true")), Value::Bool(true));
        assert_eq!(coerce(Value::from("hello")), Value::from("hello"));
        assert_eq!(coerce(Value::from("NaN")), Value::from("NaN"));
        assert_eq!(coerce(Value::Int(3)), Value::Int(3));
    }

    #[test]
    fn test_truthy() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("yes")));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(null)));
    }

    #[test]
    fn test_collect_parameters() {
        let engine = Engine::new();
        let scope = Scope::new();
        scope.set("city", Value::from("Oslo"));
        let node = Node::new("weather.get")
            .with_value("now")
            .with_attr("city", "$city")
            .with_attr("days", "3")
            .with_attr("as", "forecast");

        let params = collect_parameters(&engine, &node, &scope).unwrap();
        assert_eq!(params["value"], json!("now"));
        assert_eq!(params["city"], json!("Oslo"));
        assert_eq!(params["days"], json!(3));
        assert!(!params.contains_key("as"));
    }
}
