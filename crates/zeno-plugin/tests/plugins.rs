//! Plugins loaded from disk and invoked through the engine.

use std::path::Path;
use std::sync::Arc;

use zeno_common::{EngineConfig, ExecutionConfig, PluginConfig};
use zeno_core::{Context, Engine, Node, Scope, Value};
use zeno_plugin::PluginManager;
use zeno_wasm::WasmEngine;

/// `demo.read` asks the host for `/etc/passwd` and returns the host's
/// envelope unchanged; `demo.remember` writes `seen` into the scope;
/// every other slot answers `{"greeting": "hi"}`.
const GUEST: &str = r##"
    (module
        (import "env" "host_file_read" (func $host_file_read (param i32 i32) (result i32)))
        (import "env" "host_scope_set" (func $host_scope_set (param i32 i32) (result i32)))
        (import "env" "host_log" (func $host_log (param i32 i32 i32)))
        (memory (export "memory") 1)
        (global $heap (mut i32) (i32.const 1024))

        (data (i32.const 16) "/etc/passwd")
        (data (i32.const 32) "guest called")
        (data (i32.const 64) "[{\"name\":\"demo.read\"},{\"name\":\"demo.greet\"},{\"name\":\"demo.remember\"}]\00")
        (data (i32.const 256) "{\"success\":true,\"data\":{\"greeting\":\"hi\"}}\00")
        (data (i32.const 384) "{\"key\":\"seen\",\"value\":true}")

        (func $alloc (export "alloc") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap (i32.add (global.get $heap) (local.get $size)))
            (local.get $ptr))

        (func (export "plugin_init") (param i32 i32) (result i32)
            (i32.const 0))

        (func (export "plugin_register_slots") (result i32)
            (i32.const 64))

        (func (export "plugin_execute") (param $sp i32) (param $sl i32) (param $pp i32) (param $pl i32) (result i32)
            (call $host_log (i32.const 1) (i32.const 32) (i32.const 12))
            (if (i32.eq (local.get $sl) (i32.const 9))
                (then (return (call $host_file_read (i32.const 16) (i32.const 11)))))
            (if (i32.eq (local.get $sl) (i32.const 13))
                (then (drop (call $host_scope_set (i32.const 384) (i32.const 27)))))
            (i32.const 256))

        (func (export "plugin_cleanup"))
    )
"##;

const MANIFEST: &str = r#"
    name = "demo"
    version = "0.1.0"
    binary = "demo.wasm"

    [permissions]
    scope = ["write"]
"#;

fn write_plugin(root: &Path, dir: &str, manifest: &str, binary: &str, bytes: &[u8]) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.toml"), manifest).unwrap();
    std::fs::write(dir.join(binary), bytes).unwrap();
}

async fn manager(root: &Path) -> (Engine, Arc<PluginManager>) {
    let engine = Engine::new();
    let wasm = WasmEngine::new(&EngineConfig {
        pooling_allocator: false,
        epoch_interruption: false,
        ..Default::default()
    })
    .unwrap();
    let config = PluginConfig {
        enabled: true,
        dir: root.display().to_string(),
    };
    let manager =
        PluginManager::new(engine.clone(), wasm, &config, ExecutionConfig::default(), None).unwrap();
    (engine, manager)
}

async fn run(engine: &Engine, node: &Node, scope: &Scope) -> Result<(), zeno_core::RuntimeError> {
    engine.execute(&Context::new(), node, scope).await
}

#[tokio::test]
async fn test_plugin_slots_are_registered() {
    let root = tempfile::tempdir().unwrap();
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &wat::parse_str(GUEST).unwrap());
    let (engine, manager) = manager(root.path()).await;

    assert_eq!(manager.load_all().await.unwrap(), ["demo"]);
    for slot in ["demo.read", "demo.greet", "demo.remember"] {
        assert!(engine.registry().contains(slot), "{slot}");
    }
    let info = manager.list().await;
    assert_eq!(info[0].kind, "wasm");
    assert_eq!(info[0].slots.len(), 3);
}

#[tokio::test]
async fn test_file_read_without_permission_is_denied() {
    let root = tempfile::tempdir().unwrap();
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &wat::parse_str(GUEST).unwrap());
    let (engine, manager) = manager(root.path()).await;
    manager.load_all().await.unwrap();

    let scope = Scope::new();
    let err = run(&engine, &Node::new("demo.read"), &scope)
        .await
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("permission"), "{err}");
    assert!(scope.get("content").is_none());
}

#[tokio::test]
async fn test_reply_data_is_written_to_scope() {
    let root = tempfile::tempdir().unwrap();
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &wat::parse_str(GUEST).unwrap());
    let (engine, manager) = manager(root.path()).await;
    manager.load_all().await.unwrap();

    let scope = Scope::new();
    let node = Node::new("demo.greet").with_attr("as", "reply");
    run(&engine, &node, &scope).await.unwrap();
    assert_eq!(scope.get("greeting"), Some(Value::from("hi")));
    assert!(scope.get("reply").unwrap().as_map().is_some());

    run(&engine, &Node::new("demo.remember"), &scope).await.unwrap();
    assert_eq!(scope.get("seen"), Some(Value::Bool(true)));
}

#[tokio::test]
async fn test_async_call_returns_immediately() {
    let root = tempfile::tempdir().unwrap();
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &wat::parse_str(GUEST).unwrap());
    let (engine, manager) = manager(root.path()).await;
    manager.load_all().await.unwrap();

    let scope = Scope::new();
    let node = Node::new("demo.greet").with_attr("async", true);
    run(&engine, &node, &scope).await.unwrap();
    assert!(scope.get("greeting").is_none());
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_version() {
    let root = tempfile::tempdir().unwrap();
    let bytes = wat::parse_str(GUEST).unwrap();
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &bytes);
    let (engine, manager) = manager(root.path()).await;
    manager.load_all().await.unwrap();

    std::fs::write(root.path().join("demo/demo.wasm"), b"not wasm").unwrap();
    assert!(manager.reload("demo").await.is_err());

    let scope = Scope::new();
    run(&engine, &Node::new("demo.greet"), &scope).await.unwrap();
    assert_eq!(scope.get("greeting"), Some(Value::from("hi")));

    std::fs::write(root.path().join("demo/demo.wasm"), &bytes).unwrap();
    manager.reload_all().await.unwrap();
    assert!(engine.registry().contains("demo.greet"));
    assert!(manager.reload("missing").await.is_err());
}

#[tokio::test]
async fn test_unload_removes_slots() {
    let root = tempfile::tempdir().unwrap();
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &wat::parse_str(GUEST).unwrap());
    let (engine, manager) = manager(root.path()).await;
    manager.load_all().await.unwrap();

    manager.unload("demo").await.unwrap();
    assert!(!engine.registry().contains("demo.greet"));
    assert_eq!(manager.len().await, 0);
}

#[tokio::test]
async fn test_guest_without_required_exports_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let bytes = wat::parse_str(
        r#"(module
            (memory (export "memory") 1)
            (func (export "alloc") (param i32) (result i32) i32.const 0))"#,
    )
    .unwrap();
    write_plugin(root.path(), "bare", "name = \"bare\"\nbinary = \"bare.wasm\"\n", "bare.wasm", &bytes);
    let (_, manager) = manager(root.path()).await;

    let err = manager.load_all().await.unwrap_err();
    assert!(err.to_string().contains("plugin_execute"), "{err}");
    assert_eq!(manager.len().await, 0);
}

#[tokio::test]
async fn test_plugin_cannot_replace_builtin_slot() {
    let root = tempfile::tempdir().unwrap();
    let guest = GUEST.replace("demo.greet", "log");
    write_plugin(root.path(), "demo", MANIFEST, "demo.wasm", &wat::parse_str(&guest).unwrap());
    let (engine, manager) = manager(root.path()).await;

    let err = manager.load_all().await.unwrap_err();
    assert!(err.to_string().contains("cannot replace slot 'log'"), "{err}");
    assert!(!engine.registry().contains("demo.read"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_sidecar_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().unwrap();
    let script = "#!/bin/sh\nwhile read line; do\n  echo '{\"success\":true,\"data\":{\"answer\":42}}'\ndone\n";
    let manifest = r#"
        name = "side"
        binary = "side.sh"

        [[slots]]
        name = "side.answer"
        description = "The answer"
    "#;
    write_plugin(root.path(), "side", manifest, "side.sh", script.as_bytes());
    let script_path = root.path().join("side/side.sh");
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let (engine, manager) = manager(root.path()).await;
    manager.load_all().await.unwrap();
    assert_eq!(manager.list().await[0].kind, "sidecar");

    let scope = Scope::new();
    run(&engine, &Node::new("side.answer"), &scope).await.unwrap();
    assert_eq!(scope.get("answer"), Some(Value::Int(42)));

    manager.shutdown().await;
    assert!(!engine.registry().contains("side.answer"));
}
