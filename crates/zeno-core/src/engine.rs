//! The tree-walking interpreter.
//!
//! [`Engine::execute`] looks the node's name up in the [`SlotRegistry`] and
//! hands `(ctx, node, scope)` to the handler. Unregistered structural names
//! (`root`, `do`, `then`, ...) run their children in order; any other
//! unregistered name is an [`RuntimeError::UnknownSlot`]. Handler failures
//! are attributed to the dispatching node on the way out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use zeno_common::RuntimeError;

use crate::context::Context;
use crate::expr;
use crate::loader::{JsonLoader, NodeLoader};
use crate::node::Node;
use crate::registry::{SlotHandler, SlotMetadata, SlotRegistry};
use crate::scope::Scope;
use crate::slots;
use crate::value::{Value, ValueMap};

/// Names that group children without being slots.
pub const STRUCTURAL: &[&str] = &[
    "root", "program", "do", "then", "else", "case", "default", "catch", "finally", "body",
];

/// Attribute names that are inert when reached by the walker.
const INERT: &[&str] = &["as", "index"];

/// Loop iterations between cooperative yields.
pub const YIELD_EVERY: usize = 64;

/// Interpreter handle; clones share the registry and loader.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: Arc<SlotRegistry>,
    loader: Arc<dyn NodeLoader>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with the core slots and the JSON loader.
    pub fn new() -> Self {
        Self::with_loader(Arc::new(JsonLoader))
    }

    /// Create an engine with the core slots and a custom loader.
    pub fn with_loader(loader: Arc<dyn NodeLoader>) -> Self {
        let engine = Self::bare(Arc::new(SlotRegistry::new()), loader);
        slots::register_core(&engine);
        engine
    }

    /// Create an engine over an existing registry without adding slots.
    pub fn bare(registry: Arc<SlotRegistry>, loader: Arc<dyn NodeLoader>) -> Self {
        Self {
            inner: Arc::new(EngineInner { registry, loader }),
        }
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.inner.registry
    }

    pub fn loader(&self) -> &Arc<dyn NodeLoader> {
        &self.inner.loader
    }

    /// Register a slot handler.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn SlotHandler>,
        metadata: SlotMetadata,
    ) {
        self.inner.registry.register(name, handler, metadata);
    }

    /// Metadata of every registered slot.
    pub fn documentation(&self) -> BTreeMap<String, SlotMetadata> {
        self.inner.registry.documentation()
    }

    /// Execute `node` against `scope`.
    ///
    /// The engine attaches itself to the context when the caller did not.
    ///
    /// # Errors
    ///
    /// Propagates handler failures (attributed to the node), control-flow
    /// sentinels, `UnknownSlot` and `Timeout`.
    pub fn execute<'a>(
        &'a self,
        ctx: &'a Context,
        node: &'a Node,
        scope: &'a Scope,
    ) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            if ctx.engine().is_none() {
                let ctx = ctx.with_engine(self.clone());
                return self.dispatch(&ctx, node, scope).await;
            }
            self.dispatch(ctx, node, scope).await
        })
    }

    async fn dispatch(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        ctx.check_deadline()?;

        if let Some(target) = node.name.strip_prefix('$') {
            let value = self.resolve_node(node, scope)?;
            assign_path(scope, target, value);
            return Ok(());
        }

        if let Some(entry) = self.inner.registry.get(&node.name) {
            tracing::trace!(slot = %node.name, location = %node.location, "dispatch");
            return entry
                .handler
                .call(ctx, node, scope)
                .await
                .map_err(|e| e.at_slot(&node.name, &node.location));
        }

        if STRUCTURAL.contains(&node.name.as_str()) {
            return self.execute_children(ctx, node, scope).await;
        }
        if INERT.contains(&node.name.as_str()) {
            return Ok(());
        }

        Err(RuntimeError::UnknownSlot {
            slot: node.name.clone(),
            location: node.location.clone(),
        })
    }

    /// Execute every child of `node` in order.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first child error.
    pub async fn execute_children(
        &self,
        ctx: &Context,
        node: &Node,
        scope: &Scope,
    ) -> Result<(), RuntimeError> {
        for child in &node.children {
            self.execute(ctx, child, scope).await?;
        }
        Ok(())
    }

    /// Execute the `do` block of `node`, or its children except `skip`.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first child error.
    pub async fn execute_body(
        &self,
        ctx: &Context,
        node: &Node,
        scope: &Scope,
        skip: &[&str],
    ) -> Result<(), RuntimeError> {
        if let Some(block) = node.child("do") {
            return self.execute_children(ctx, block, scope).await;
        }
        for child in node.children.iter().filter(|c| !skip.contains(&c.name.as_str())) {
            self.execute(ctx, child, scope).await?;
        }
        Ok(())
    }

    /// Run a slot by name with an argument map (used by the VM host bridge).
    ///
    /// # Errors
    ///
    /// Returns the slot's failure.
    pub async fn call_slot(
        &self,
        ctx: &Context,
        name: &str,
        args: &ValueMap,
        scope: &Scope,
    ) -> Result<(), RuntimeError> {
        let node = Node::from_args(name, args);
        self.execute(ctx, &node, scope).await
    }

    /// Resolve a value through the scope (paths, expressions, collections).
    ///
    /// # Errors
    ///
    /// Fails when an expression is ill-typed.
    pub fn resolve(&self, value: &Value, scope: &Scope) -> Result<Value, RuntimeError> {
        expr::resolve(value, scope)
    }

    /// Resolve a node's value; a valueless node with children becomes a map.
    ///
    /// # Errors
    ///
    /// Fails when an expression is ill-typed.
    pub fn resolve_node(&self, node: &Node, scope: &Scope) -> Result<Value, RuntimeError> {
        if node.value.is_nil() && !node.children.is_empty() {
            let mut map = ValueMap::new();
            for child in &node.children {
                map.insert(child.name.clone(), self.resolve_node(child, scope)?);
            }
            return Ok(Value::Map(map));
        }
        self.resolve(&node.value, scope)
    }

    /// Resolved value of the named attribute child.
    ///
    /// # Errors
    ///
    /// Fails when an expression is ill-typed.
    pub fn attr(&self, node: &Node, name: &str, scope: &Scope) -> Result<Option<Value>, RuntimeError> {
        node.child(name)
            .map(|c| self.resolve_node(c, scope))
            .transpose()
    }

    /// Attribute as display text; `None` when absent or nil.
    ///
    /// # Errors
    ///
    /// Fails when an expression is ill-typed.
    pub fn attr_string(
        &self,
        node: &Node,
        name: &str,
        scope: &Scope,
    ) -> Result<Option<String>, RuntimeError> {
        Ok(self
            .attr(node, name, scope)?
            .filter(|v| !v.is_nil())
            .map(|v| v.to_display_string()))
    }

    /// The node's value, falling back to the named attribute.
    ///
    /// # Errors
    ///
    /// Fails when an expression is ill-typed.
    pub fn value_or_attr(
        &self,
        node: &Node,
        name: &str,
        scope: &Scope,
    ) -> Result<Value, RuntimeError> {
        if !node.value.is_nil() {
            return self.resolve(&node.value, scope);
        }
        Ok(self.attr(node, name, scope)?.unwrap_or_default())
    }

    /// All attribute children resolved into a map, except blocks in `skip`.
    ///
    /// # Errors
    ///
    /// Fails when an expression is ill-typed.
    pub fn attributes(
        &self,
        node: &Node,
        scope: &Scope,
        skip: &[&str],
    ) -> Result<ValueMap, RuntimeError> {
        let mut map = ValueMap::new();
        for child in node.children.iter().filter(|c| !skip.contains(&c.name.as_str())) {
            map.insert(child.name.clone(), self.resolve_node(child, scope)?);
        }
        Ok(map)
    }
}

/// Assign `value` to `name` or to a dotted path inside an existing map.
pub fn assign_path(scope: &Scope, target: &str, value: Value) {
    let Some((head, rest)) = target.split_once('.') else {
        scope.assign(target, value);
        return;
    };
    let mut root = scope
        .get(head)
        .filter(|v| matches!(v, Value::Map(_) | Value::List(_)))
        .unwrap_or_else(|| Value::Map(ValueMap::new()));
    set_in(&mut root, rest, value);
    scope.assign(head, root);
}

fn set_in(container: &mut Value, path: &str, value: Value) {
    let (segment, rest) = match path.split_once('.') {
        Some((s, r)) => (s, Some(r)),
        None => (path, None),
    };
    let slot = match container {
        Value::Map(map) => map.entry(segment.to_string()).or_default(),
        Value::List(list) => match segment.parse::<usize>() {
            Ok(i) if i < list.len() => &mut list[i],
            Ok(i) if i == list.len() => {
                list.push(Value::Nil);
                &mut list[i]
            }
            _ => return,
        },
        other => {
            *other = Value::Map(ValueMap::new());
            let Value::Map(map) = other else { return };
            map.entry(segment.to_string()).or_default()
        }
    };
    match rest {
        Some(rest) => set_in(slot, rest, value),
        None => *slot = value,
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("slots", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Record(Arc<Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl SlotHandler for Record {
        async fn call(&self, _: &Context, node: &Node, _: &Scope) -> Result<(), RuntimeError> {
            self.0.lock().push(node.value.to_display_string());
            Ok(())
        }
    }

    struct Fail;

    #[async_trait::async_trait]
    impl SlotHandler for Fail {
        async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
            Err(RuntimeError::failed("always fails"))
        }
    }

    #[tokio::test]
    async fn test_children_execute_in_order() {
        let engine = Engine::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine.register("rec", Arc::new(Record(Arc::clone(&seen))), SlotMetadata::new("r"));

        let tree = Node::new("root").with_children((1..=3).map(|i| Node::new("rec").with_value(i)));
        engine.execute(&Context::new(), &tree, &Scope::new()).await.unwrap();

        assert_eq!(*seen.lock(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_unknown_slot() {
        let engine = Engine::new();
        let node = Node::new("nope").at(zeno_common::SourceLocation::new("a.json", 4, 2));
        let err = engine.execute(&Context::new(), &node, &Scope::new()).await.unwrap_err();

        assert_eq!(
            err,
            RuntimeError::UnknownSlot {
                slot: "nope".into(),
                location: zeno_common::SourceLocation::new("a.json", 4, 2),
            }
        );
    }

    #[tokio::test]
    async fn test_handler_errors_carry_slot_and_location() {
        let engine = Engine::new();
        engine.register("fail", Arc::new(Fail), SlotMetadata::new("f"));
        let loc = zeno_common::SourceLocation::new("app.json", 9, 5);
        let tree = Node::new("root").with_child(Node::new("do").with_child(Node::new("fail").at(loc.clone())));

        let err = engine.execute(&Context::new(), &tree, &Scope::new()).await.unwrap_err();
        let diag = err.diagnostic();
        assert_eq!(diag.slot.as_deref(), Some("fail"));
        assert_eq!(diag.line, 9);
        assert_eq!(diag.message, "always fails");
    }

    #[tokio::test]
    async fn test_assignment_and_paths() {
        let engine = Engine::new();
        let scope = Scope::new();
        let tree = Node::new("root")
            .with_child(Node::new("$u").with_value(42))
            .with_child(Node::new("$user").with_attr("name", "ada").with_attr("age", 36))
            .with_child(Node::new("$user.email").with_value("a@b.c"))
            .with_child(Node::new("$next").with_value("$u + 1"));

        engine.execute(&Context::new(), &tree, &scope).await.unwrap();

        assert_eq!(scope.get("u"), Some(Value::Int(42)));
        assert_eq!(scope.get("next"), Some(Value::Int(43)));
        assert_eq!(
            scope.get("user").unwrap().to_json(),
            serde_json::json!({"name": "ada", "age": 36, "email": "a@b.c"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_checked_per_node() {
        let engine = Engine::new();
        let ctx = Context::new().with_timeout(std::time::Duration::from_millis(10));
        tokio::time::advance(std::time::Duration::from_millis(20)).await;

        let err = engine
            .execute(&ctx, &Node::new("noop"), &Scope::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_documentation_lists_core_slots() {
        let docs = Engine::new().documentation();
        for name in ["if", "for", "while", "try", "fn", "call", "include", "log", "sleep", "noop"] {
            assert!(docs.contains_key(name), "missing {name}");
        }
    }
}
