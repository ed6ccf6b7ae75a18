//! `include: <path>` loads another tree and runs it in the current scope.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use zeno_common::RuntimeError;

use crate::context::Context;
use crate::loader::resolve_include_path;
use crate::node::Node;
use crate::registry::SlotHandler;
use crate::scope::Scope;

/// Context key holding the files currently being included.
pub const INCLUDE_STACK: &str = "includeStack";

pub struct Include;

#[async_trait]
impl SlotHandler for Include {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let target = engine.resolve(&node.value, scope)?.to_display_string();
        if target.is_empty() {
            return Err(RuntimeError::failed("include requires a path"));
        }
        let path = resolve_include_path(&target, &node.location);

        let mut stack: Vec<PathBuf> = ctx
            .value::<Vec<PathBuf>>(INCLUDE_STACK)
            .map(|s| (*s).clone())
            .unwrap_or_default();
        if stack.contains(&path) {
            return Err(RuntimeError::failed(format!(
                "include cycle through {}",
                path.display()
            )));
        }
        stack.push(path.clone());

        let tree = engine.loader().load(&path)?;
        tracing::debug!(path = %path.display(), nodes = tree.size(), "including tree");

        let ctx = ctx.with_value(INCLUDE_STACK, Arc::new(stack));
        engine.execute(&ctx, &tree, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::value::Value;

    #[tokio::test]
    async fn test_include_runs_in_current_scope() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("part.json"),
            r#"{"name": "$greeting", "value": "$name + '!'"}"#,
        )
        .unwrap();
        let main = dir.path().join("main.json");
        std::fs::write(
            &main,
            r#"[{"name": "$name", "value": "ada"}, {"name": "include", "value": "part.json"}]"#,
        )
        .unwrap();

        let engine = Engine::new();
        let tree = engine.loader().load(&main).unwrap();
        let scope = Scope::new();
        engine.execute(&Context::new(), &tree, &scope).await.unwrap();

        assert_eq!(scope.get("greeting"), Some(Value::from("ada!")));
    }

    #[tokio::test]
    async fn test_include_cycle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, r#"{"name": "include", "value": "b.json"}"#).unwrap();
        std::fs::write(&b, r#"{"name": "include", "value": "a.json"}"#).unwrap();

        let engine = Engine::new();
        let tree = Node::new("include").with_value(a.display().to_string());
        let err = engine
            .execute(&Context::new(), &tree, &Scope::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("include cycle"));
    }

    #[tokio::test]
    async fn test_include_cycle_detected_across_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let pages = dir.path().join("pages");
        std::fs::create_dir(&pages).unwrap();
        let page = pages.join("a.json");
        std::fs::write(&page, r#"{"name": "include", "value": "../pages/a.json"}"#).unwrap();

        let engine = Engine::new();
        let tree = Node::new("include").with_value(page.display().to_string());
        let err = engine
            .execute(&Context::new(), &tree, &Scope::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("include cycle"), "{err}");
    }
}
