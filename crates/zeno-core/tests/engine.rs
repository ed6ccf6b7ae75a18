//! End-to-end interpreter behavior over loaded trees.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use zeno_core::{
    Analyzer, ArenaPool, Context, Engine, JsonLoader, Node, RuntimeError, Scope, SlotHandler,
    SlotMetadata, Value,
};

/// Records the resolved value of every invocation.
struct Probe(Arc<Mutex<Vec<Value>>>);

#[async_trait::async_trait]
impl SlotHandler for Probe {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let value = ctx.require_engine()?.resolve(&node.value, scope)?;
        self.0.lock().push(value);
        Ok(())
    }
}

fn engine_with_probe() -> (Engine, Arc<Mutex<Vec<Value>>>) {
    let engine = Engine::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    engine.register(
        "probe",
        Arc::new(Probe(Arc::clone(&seen))),
        SlotMetadata::new("records values"),
    );
    (engine, seen)
}

const PROGRAM: &str = r#"[
    {"name": "$total", "value": 0},
    {"name": "fn", "value": "double", "children": [
        {"name": "params", "value": ["n"]},
        {"name": "do", "children": [{"name": "return", "value": "$n * 2"}]}
    ]},
    {"name": "for", "value": [1, 2, 3], "children": [
        {"name": "as", "value": "x"},
        {"name": "do", "children": [
            {"name": "call", "value": "double", "children": [
                {"name": "n", "value": "$x"},
                {"name": "as", "value": "d"}
            ]},
            {"name": "$total", "value": "$total + $d"},
            {"name": "probe", "value": "$d"}
        ]}
    ]},
    {"name": "try", "children": [
        {"name": "do", "children": [{"name": "call", "value": "missing"}]},
        {"name": "catch", "children": [{"name": "probe", "value": "$error.slot"}]}
    ]},
    {"name": "probe", "value": "$total"}
]"#;

#[tokio::test]
async fn test_program_runs_in_source_order() {
    let (engine, seen) = engine_with_probe();
    let tree = JsonLoader::parse_str(PROGRAM, "program.json").unwrap();

    assert!(Analyzer::new(&engine).run(&tree).is_empty());

    let scope = Scope::new();
    engine.execute(&Context::new(), &tree, &scope).await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            Value::Int(2),
            Value::Int(4),
            Value::Int(6),
            Value::from("call"),
            Value::Int(12),
        ]
    );
    assert_eq!(scope.get("total"), Some(Value::Int(12)));
    assert_eq!(scope.get("x"), None);
}

#[tokio::test]
async fn test_request_scopes_do_not_leak_into_registration_scope() {
    let (engine, _) = engine_with_probe();
    let pool = ArenaPool::new();
    let registration = Scope::new();
    registration.set("greeting", Value::from("hi"));

    for _ in 0..3 {
        let guard = pool.acquire();
        let request = registration.frame_child_in(guard.arena());
        let body = Node::new("do")
            .with_child(Node::new("$greeting").with_value("changed"))
            .with_child(Node::new("$local").with_value(1));
        engine.execute(&Context::new(), &body, &request).await.unwrap();
        assert_eq!(request.get("greeting"), Some(Value::from("changed")));
    }

    assert_eq!(registration.get("greeting"), Some(Value::from("hi")));
    assert_eq!(registration.get("local"), None);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_catch_reports_source_location_of_failing_node() {
    let engine = Engine::new();
    let src = r#"{"name": "try", "children": [
        {"name": "do", "children": [
            {"name": "sleep", "value": true, "line": 3, "col": 9}
        ]},
        {"name": "catch", "children": [
            {"name": "as", "value": "err"},
            {"name": "$line", "value": "$err.line"},
            {"name": "$file", "value": "$err.file"}
        ]}
    ]}"#;
    let tree = JsonLoader::parse_str(src, "jobs.json").unwrap();
    let diags = Analyzer::new(&engine).run(&tree);
    assert_eq!(diags.len(), 1);

    let scope = Scope::new();
    scope.set("line", Value::Nil);
    scope.set("file", Value::Nil);
    let ctx = Context::new().with_timeout(Duration::from_secs(5));
    engine.execute(&ctx, &tree, &scope).await.unwrap();

    assert_eq!(scope.get("line"), Some(Value::Int(3)));
    assert_eq!(scope.get("file"), Some(Value::from("jobs.json")));
}
