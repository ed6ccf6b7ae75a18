//! Query and transaction slots against an in-memory SQLite database.

use std::sync::Arc;

use zeno_core::{
    Context, Engine, JsonLoader, Node, RuntimeError, Scope, SlotHandler, SlotMetadata, Value,
};
use zeno_db::{DEFAULT_CONNECTION, DatabaseManager};

struct Fail;

#[async_trait::async_trait]
impl SlotHandler for Fail {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        Err(RuntimeError::failed("handler exploded"))
    }
}

struct Finish;

#[async_trait::async_trait]
impl SlotHandler for Finish {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        Err(RuntimeError::Return)
    }
}

async fn setup() -> (Engine, Scope) {
    let manager = Arc::new(DatabaseManager::new());
    manager
        .connect(DEFAULT_CONNECTION, "sqlite::memory:")
        .await
        .unwrap();

    let engine = Engine::new();
    zeno_db::register(&engine, &manager);
    engine.register("fail", Arc::new(Fail), SlotMetadata::new("always fails"));
    engine.register("finish", Arc::new(Finish), SlotMetadata::new("ends the request"));

    let scope = Scope::new();
    run(
        &engine,
        &scope,
        r#"[
            {"name": "db.execute", "value": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, role TEXT)"},
            {"name": "db.execute", "value": "INSERT INTO users (name, role) VALUES (?, ?), (?, ?), (?, ?)",
             "children": [{"name": "bindings", "value": ["ada", "admin", "bob", "user", "cy", "user"]}]}
        ]"#,
    )
    .await
    .unwrap();
    (engine, scope)
}

async fn run(engine: &Engine, scope: &Scope, program: &str) -> Result<(), RuntimeError> {
    let tree = JsonLoader::parse_str(program, "test.json").unwrap();
    engine.execute(&Context::new(), &tree, scope).await
}

async fn count_users(engine: &Engine, scope: &Scope) -> Value {
    run(
        engine,
        scope,
        r#"[{"name": "table", "value": "users"}, {"name": "count", "children": [{"name": "as", "value": "n"}]}]"#,
    )
    .await
    .unwrap();
    scope.get("n").unwrap()
}

#[tokio::test]
async fn test_transaction_rolls_back_when_body_fails() {
    let (engine, scope) = setup().await;

    let err = run(
        &engine,
        &scope,
        r#"[{"name": "db.transaction", "children": [{"name": "do", "children": [
            {"name": "table", "value": "users"},
            {"name": "insert", "children": [{"name": "name", "value": "eve"}]},
            {"name": "fail"}
        ]}]}]"#,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("handler exploded"), "{err}");

    assert_eq!(count_users(&engine, &scope).await, Value::Int(3));
}

#[tokio::test]
async fn test_transaction_commits_clean_body() {
    let (engine, scope) = setup().await;
    run(
        &engine,
        &scope,
        r#"[{"name": "db.transaction", "children": [{"name": "do", "children": [
            {"name": "table", "value": "users"},
            {"name": "insert", "children": [
                {"name": "data", "children": [{"name": "name", "value": "eve"}, {"name": "role", "value": "user"}]},
                {"name": "as", "value": "id"}
            ]}
        ]}]}]"#,
    )
    .await
    .unwrap();

    assert_eq!(scope.get("id"), Some(Value::Int(4)));
    assert_eq!(count_users(&engine, &scope).await, Value::Int(4));
}

#[tokio::test]
async fn test_return_inside_transaction_commits() {
    let (engine, scope) = setup().await;
    let err = run(
        &engine,
        &scope,
        r#"[{"name": "db.transaction", "children": [{"name": "do", "children": [
            {"name": "table", "value": "users"},
            {"name": "insert", "children": [{"name": "name", "value": "eve"}]},
            {"name": "finish"}
        ]}]}]"#,
    )
    .await
    .unwrap_err();
    assert_eq!(err, RuntimeError::Return);

    assert_eq!(count_users(&engine, &scope).await, Value::Int(4));
}

#[tokio::test]
async fn test_nested_transactions_are_rejected() {
    let (engine, scope) = setup().await;
    let err = run(
        &engine,
        &scope,
        r#"[{"name": "db.transaction", "children": [{"name": "do", "children": [
            {"name": "db.transaction", "children": [{"name": "do", "children": []}]}
        ]}]}]"#,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("nested transactions"), "{err}");
}

#[tokio::test]
async fn test_fluent_query_binds_rows() {
    let (engine, scope) = setup().await;
    run(
        &engine,
        &scope,
        r#"[
            {"name": "$wanted", "value": "user"},
            {"name": "table", "value": "users"},
            {"name": "where", "value": "role", "children": [{"name": "value", "value": "$wanted"}]},
            {"name": "order_by", "value": "id DESC"},
            {"name": "get", "children": [{"name": "as", "value": "rows"}]},
            {"name": "first", "children": [{"name": "as", "value": "top"}]}
        ]"#,
    )
    .await
    .unwrap();

    let Some(Value::List(rows)) = scope.get("rows") else {
        panic!("rows not bound");
    };
    let names: Vec<String> = rows
        .iter()
        .map(|r| r.as_map().unwrap()["name"].to_display_string())
        .collect();
    assert_eq!(names, ["cy", "bob"]);
    assert_eq!(
        scope.resolve_path("top.name"),
        Value::from("cy")
    );
}

#[tokio::test]
async fn test_paginate_reports_totals() {
    let (engine, scope) = setup().await;
    run(
        &engine,
        &scope,
        r#"[
            {"name": "table", "value": "users"},
            {"name": "order_by", "value": "id"},
            {"name": "paginate", "children": [
                {"name": "per_page", "value": 2},
                {"name": "page", "value": 2},
                {"name": "as", "value": "page"}
            ]}
        ]"#,
    )
    .await
    .unwrap();

    assert_eq!(scope.resolve_path("page.total"), Value::Int(3));
    assert_eq!(scope.resolve_path("page.last_page"), Value::Int(2));
    assert_eq!(scope.resolve_path("page.from"), Value::Int(3));
    assert_eq!(scope.resolve_path("page.to"), Value::Int(3));
    assert_eq!(scope.resolve_path("page.data.0.name"), Value::from("cy"));
}

#[tokio::test]
async fn test_terminal_without_table_fails() {
    let (engine, scope) = setup().await;
    let err = run(&engine, &scope, r#"[{"name": "get"}]"#)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no active query"), "{err}");
}
