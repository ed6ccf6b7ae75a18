//! The boundary between the VM and the outside world.

use std::collections::HashMap;

use async_trait::async_trait;
use zeno_common::RuntimeError;
use zeno_core::{Context, Engine, Scope, Value, ValueMap};

/// Services the VM needs from its embedder.
#[async_trait]
pub trait Host: Send {
    /// Run an external slot with an argument map.
    async fn call(&mut self, slot: &str, args: ValueMap) -> Result<Value, RuntimeError>;

    /// Read a global variable.
    fn get(&self, key: &str) -> Option<Value>;

    /// Write a global variable.
    fn set(&mut self, key: &str, value: Value);

    /// Called periodically by the VM; a failure aborts execution.
    fn check(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// In-memory host for tests: globals in a map, slot calls recorded.
#[derive(Debug, Default)]
pub struct NoopHost {
    pub globals: HashMap<String, Value>,
    pub calls: Vec<(String, ValueMap)>,
}

impl NoopHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Host for NoopHost {
    async fn call(&mut self, slot: &str, args: ValueMap) -> Result<Value, RuntimeError> {
        self.calls.push((slot.to_string(), args));
        Ok(Value::Nil)
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.globals.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.globals.insert(key.to_string(), value);
    }
}

/// Production host: slots run on the [`Engine`], globals live in a [`Scope`].
#[derive(Debug, Clone)]
pub struct EngineHost {
    engine: Engine,
    ctx: Context,
    scope: Scope,
}

impl EngineHost {
    pub fn new(engine: Engine, ctx: Context, scope: Scope) -> Self {
        let ctx = if ctx.engine().is_none() {
            ctx.with_engine(engine.clone())
        } else {
            ctx
        };
        Self { engine, ctx, scope }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[async_trait]
impl Host for EngineHost {
    async fn call(&mut self, slot: &str, args: ValueMap) -> Result<Value, RuntimeError> {
        self.engine
            .call_slot(&self.ctx, slot, &args, &self.scope)
            .await?;
        let result = args
            .get("as")
            .and_then(Value::as_str)
            .and_then(|name| self.scope.get(name.trim_start_matches('$')));
        Ok(result.unwrap_or_default())
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.scope.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.scope.assign(key, value);
    }

    fn check(&self) -> Result<(), RuntimeError> {
        self.ctx.check_deadline()
    }
}
