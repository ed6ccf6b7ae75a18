//! Integration tests for zeno-wasm.
//!
//! These tests drive the complete guest pipeline:
//! - WAT compilation through the module cache
//! - Instantiation with host functions
//! - The alloc / NUL-terminated string protocol
//! - Fuel, timeout and trap handling

use std::time::Duration;

use wasmtime::{Caller, Linker};
use zeno_common::{EngineConfig, ExecutionConfig, RuntimeError};
use zeno_wasm::{
    CompiledModule, GuestInstance, GuestState, ModuleCache, WasmEngine, read_guest,
    write_guest_cstr,
};

/// Bump allocator, an `echo` export and a `greet` export that calls back
/// into the host.
const GUEST: &str = r#"
    (module
        (import "env" "host_greet" (func $host_greet (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (global $heap (mut i32) (i32.const 1024))

        (func $alloc (export "alloc") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap (i32.add (global.get $heap) (local.get $size)))
            (local.get $ptr))

        (func (export "echo") (param $ptr i32) (param $len i32) (result i32)
            (local $out i32)
            (local.set $out (call $alloc (i32.add (local.get $len) (i32.const 1))))
            (memory.copy (local.get $out) (local.get $ptr) (local.get $len))
            (i32.store8 (i32.add (local.get $out) (local.get $len)) (i32.const 0))
            (local.get $out))

        (func (export "greet") (param $ptr i32) (param $len i32) (result i32)
            (call $host_greet (local.get $ptr) (local.get $len)))

        (func (export "spin")
            (loop $forever (br $forever)))

        (func (export "crash")
            unreachable)
    )
"#;

type State = GuestState<Vec<String>>;

fn engine() -> WasmEngine {
    WasmEngine::new(&EngineConfig {
        pooling_allocator: false,
        epoch_interruption: false,
        ..Default::default()
    })
    .unwrap()
}

fn linker(engine: &WasmEngine) -> Linker<State> {
    let mut linker = Linker::new(engine.inner());
    linker
        .func_wrap_async(
            "env",
            "host_greet",
            |mut caller: Caller<'_, State>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let name = String::from_utf8(read_guest(&mut caller, ptr, len)?)?;
                    caller.data_mut().host.push(name.clone());
                    let reply = format!("hi, {name}");
                    Ok(write_guest_cstr(&mut caller, reply.as_bytes()).await?)
                })
            },
        )
        .unwrap();
    linker
}

async fn guest(config: ExecutionConfig) -> GuestInstance<Vec<String>> {
    let engine = engine();
    let module = CompiledModule::from_wat(engine.inner(), GUEST).unwrap();
    GuestInstance::instantiate(&engine, &module, &linker(&engine), &config, Vec::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_string_round_trip() {
    let mut guest = guest(ExecutionConfig::default()).await;

    let ptr = guest
        .invoke("echo", &[b"hello guest".as_slice()], "req-1".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guest.read_cstr(ptr).unwrap(), "hello guest");
    assert!(!guest.is_poisoned());
    assert!(guest.state().metrics.fuel_consumed > 0);
    assert_eq!(guest.state().request_id, "req-1");
}

#[tokio::test]
async fn test_host_function_reads_and_replies() {
    let mut guest = guest(ExecutionConfig::default()).await;

    let ptr = guest
        .invoke("greet", &[b"ada".as_slice()], "req-2".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(guest.read_cstr(ptr).unwrap(), "hi, ada");
    assert_eq!(guest.host(), &["ada".to_string()]);
}

#[tokio::test]
async fn test_fuel_exhaustion_poisons_instance() {
    let mut guest = guest(ExecutionConfig {
        max_fuel: 10_000,
        fuel_metering: true,
        ..Default::default()
    })
    .await;

    let err = guest.invoke("spin", &[], "req-3".into()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::FuelExhausted), "{err}");
    assert!(guest.is_poisoned());
}

#[tokio::test]
async fn test_timeout_cuts_unmetered_guest() {
    let mut guest = guest(ExecutionConfig {
        fuel_metering: false,
        timeout_ms: 50,
        ..Default::default()
    })
    .await;

    let started = std::time::Instant::now();
    let err = guest.invoke("spin", &[], "req-4".into()).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_trap_is_reported() {
    let mut guest = guest(ExecutionConfig::default()).await;
    let err = guest.invoke("crash", &[], "req-5".into()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Trap { .. }), "{err}");
}

#[tokio::test]
async fn test_missing_alloc_is_rejected() {
    let engine = engine();
    let module = CompiledModule::from_wat(
        engine.inner(),
        r#"(module (memory (export "memory") 1))"#,
    )
    .unwrap();
    let linker: Linker<GuestState<()>> = Linker::new(engine.inner());
    let err = GuestInstance::instantiate(&engine, &module, &linker, &ExecutionConfig::default(), ())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("alloc"), "{err}");
}

#[tokio::test]
async fn test_cached_module_instantiates_twice() {
    let engine = engine();
    let cache = ModuleCache::new();
    let bytes = wat::parse_str(GUEST).unwrap();
    let linker = linker(&engine);

    for _ in 0..2 {
        let module = cache.get_or_compile(engine.inner(), &bytes).unwrap();
        let mut guest = GuestInstance::instantiate(
            &engine,
            &module,
            &linker,
            &ExecutionConfig::default(),
            Vec::new(),
        )
        .await
        .unwrap();
        let ptr = guest.invoke("echo", &[b"x".as_slice()], "req".into()).await.unwrap().unwrap();
        assert_eq!(guest.read_cstr(ptr).unwrap(), "x");
    }
    assert_eq!(cache.len(), 1);
}
