//! Jobs enqueued from a program run through their handlers.

use std::sync::Arc;
use std::time::Duration;

use zeno_common::WorkerConfig;
use zeno_core::{Context, Engine, JsonLoader, Node, RuntimeError, Scope, SlotHandler, SlotMetadata, Value};
use zeno_worker::{JobHandlers, JobOutcome, Queue, SqliteQueue, WorkerPool};

/// Records `$payload` of every call.
#[derive(Default)]
struct Record {
    seen: parking_lot::Mutex<Vec<Value>>,
}

#[async_trait::async_trait]
impl SlotHandler for Record {
    async fn call(&self, _: &Context, _: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        self.seen.lock().push(scope.get("payload").unwrap_or_default());
        Ok(())
    }
}

struct Fail;

#[async_trait::async_trait]
impl SlotHandler for Fail {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        Err(RuntimeError::failed("smtp down"))
    }
}

struct Panic;

#[async_trait::async_trait]
impl SlotHandler for Panic {
    async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
        panic!("handler bug")
    }
}

struct Harness {
    engine: Engine,
    queue: Arc<SqliteQueue>,
    pool: Arc<WorkerPool>,
    record: Arc<Record>,
}

async fn harness(queues: &[&str], max_attempts: u32) -> Harness {
    let queue = Arc::new(
        SqliteQueue::in_memory()
            .await
            .unwrap()
            .with_max_attempts(max_attempts),
    );
    let dyn_queue: Arc<dyn Queue> = queue.clone();
    let handlers = Arc::new(JobHandlers::new());
    let record = Arc::new(Record::default());

    let engine = Engine::new();
    zeno_worker::register(&engine, &dyn_queue, &handlers);
    engine.register("record", record.clone(), SlotMetadata::new("record payload"));
    engine.register("fail", Arc::new(Fail), SlotMetadata::new("always fails"));
    engine.register("explode", Arc::new(Panic), SlotMetadata::new("panics"));

    let config = WorkerConfig {
        queues: queues.iter().map(|q| (*q).to_string()).collect(),
        retry_after_secs: 0,
        poll_interval_ms: 10,
        ..WorkerConfig::default()
    };
    let pool = Arc::new(WorkerPool::new(dyn_queue, engine.clone(), handlers, &config));
    Harness {
        engine,
        queue,
        pool,
        record,
    }
}

async fn run(engine: &Engine, program: &str) {
    let tree = JsonLoader::parse_str(program, "jobs.json").unwrap();
    engine
        .execute(&Context::new(), &tree, &Scope::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_enqueued_job_runs_its_handler() {
    let h = harness(&["emails"], 5).await;
    run(
        &h.engine,
        r#"[
            {"name": "job.handler", "value": "emails", "children": [{"name": "do", "children": [{"name": "record"}]}]},
            {"name": "$to", "value": "ada@example.com"},
            {"name": "job.enqueue", "value": "emails", "children": [
                {"name": "payload", "children": [{"name": "to", "value": "$to"}]}
            ]}
        ]"#,
    )
    .await;

    assert_eq!(h.pool.run_once().await.unwrap(), Some(JobOutcome::Acked));
    assert_eq!(h.pool.run_once().await.unwrap(), None);

    let seen = h.record.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].as_map().and_then(|m| m.get("to")).cloned(),
        Some(Value::from("ada@example.com"))
    );
    assert_eq!(h.queue.stats().await.unwrap().done, 1);
}

#[tokio::test]
async fn test_failing_job_retries_then_dies() {
    let h = harness(&["default"], 2).await;
    run(
        &h.engine,
        r#"[
            {"name": "job.handler", "value": "default", "children": [{"name": "do", "children": [{"name": "fail"}]}]},
            {"name": "job.enqueue", "children": [{"name": "payload", "value": 1}]}
        ]"#,
    )
    .await;

    let first = h.pool.run_once().await.unwrap();
    assert!(matches!(first, Some(JobOutcome::Retried(ref m)) if m.contains("smtp down")), "{first:?}");
    let second = h.pool.run_once().await.unwrap();
    assert!(matches!(second, Some(JobOutcome::Dead(_))), "{second:?}");
    assert_eq!(h.pool.run_once().await.unwrap(), None);
    assert_eq!(h.queue.stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let h = harness(&["default"], 5).await;
    run(
        &h.engine,
        r#"[
            {"name": "job.handler", "value": "default", "children": [{"name": "do", "children": [{"name": "explode"}]}]},
            {"name": "job.enqueue", "value": "default"}
        ]"#,
    )
    .await;

    let outcome = h.pool.run_once().await.unwrap();
    assert!(
        matches!(outcome, Some(JobOutcome::Retried(ref m)) if m.contains("handler bug")),
        "{outcome:?}"
    );
}

#[tokio::test]
async fn test_job_without_handler_is_retried() {
    let h = harness(&["orphans"], 5).await;
    h.queue
        .enqueue("orphans", b"{}", Duration::ZERO)
        .await
        .unwrap();
    let outcome = h.pool.run_once().await.unwrap();
    assert!(
        matches!(outcome, Some(JobOutcome::Retried(ref m)) if m.contains("no job.handler")),
        "{outcome:?}"
    );
}

#[tokio::test]
async fn test_pool_drains_queue_and_stops_on_cancel() {
    let h = harness(&["default"], 5).await;
    run(
        &h.engine,
        r#"[
            {"name": "job.handler", "value": "default", "children": [{"name": "do", "children": [{"name": "record"}]}]},
            {"name": "job.enqueue", "children": [{"name": "payload", "value": 1}]},
            {"name": "job.enqueue", "children": [{"name": "payload", "value": 2}]},
            {"name": "job.enqueue", "children": [{"name": "payload", "value": 3}]}
        ]"#,
    )
    .await;

    let handle = Arc::clone(&h.pool).spawn(tokio_util::sync::CancellationToken::new());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.queue.stats().await.unwrap().done < 3 {
        assert!(tokio::time::Instant::now() < deadline, "jobs not drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    let mut seen: Vec<i64> = h
        .record
        .seen
        .lock()
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, [1, 2, 3]);
}
