//! Polling workers that run job handlers through the engine.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zeno_common::{RuntimeError, WorkerConfig};
use zeno_core::{ArenaPool, Context, Engine, Node, Scope, Value, ValueMap};

use crate::queue::{FailOutcome, Job, Queue};

/// Handler subtrees by queue name, filled by `job.handler` at startup.
#[derive(Debug, Default)]
pub struct JobHandlers {
    handlers: DashMap<String, Arc<Node>>,
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `queue`.
    pub fn insert(&self, queue: impl Into<String>, node: Node) {
        let queue = queue.into();
        if self.handlers.insert(queue.clone(), Arc::new(node)).is_some() {
            tracing::warn!(queue = %queue, "job handler replaced");
        }
    }

    pub fn get(&self, queue: &str) -> Option<Arc<Node>> {
        self.handlers.get(queue).map(|h| Arc::clone(h.value()))
    }

    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Acked,
    Retried(String),
    Dead(String),
}

/// A set of worker loops sharing one queue and one engine.
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    engine: Engine,
    handlers: Arc<JobHandlers>,
    arenas: ArenaPool,
    queues: Vec<String>,
    concurrency: usize,
    poll_interval: Duration,
    retry_after: Duration,
    job_timeout: Option<Duration>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queues", &self.queues)
            .field("concurrency", &self.concurrency)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn Queue>,
        engine: Engine,
        handlers: Arc<JobHandlers>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            engine,
            handlers,
            arenas: ArenaPool::new(),
            queues: config.queues.clone(),
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            retry_after: Duration::from_secs(config.retry_after_secs),
            job_timeout: None,
        }
    }

    /// Bound every job by `timeout`.
    #[must_use]
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Start one loop per concurrency unit.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> WorkerHandle {
        tracing::info!(
            concurrency = self.concurrency,
            queues = ?self.queues,
            "starting worker pool"
        );
        let tasks = (0..self.concurrency)
            .map(|worker| {
                let pool = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run_loop(worker, cancel).await })
            })
            .collect();
        WorkerHandle { cancel, tasks }
    }

    async fn run_loop(&self, worker: usize, cancel: CancellationToken) {
        tracing::debug!(worker, "worker loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::error!(worker, error = %e, "claim failed");
                    true
                }
            };
            if !idle {
                continue;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::debug!(worker, "worker loop stopped");
    }

    /// Claim and process at most one job.
    ///
    /// # Errors
    ///
    /// Returns `Queue` when the backend cannot be reached; handler failures
    /// are reported through [`JobOutcome`].
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, RuntimeError> {
        let Some(job) = self.queue.claim(&self.queues).await? else {
            return Ok(None);
        };
        let id = job.id;
        let started = Instant::now();

        let result = match AssertUnwindSafe(self.execute(&job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(RuntimeError::failed(format!(
                "job handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(()) => {
                self.queue.ack(id).await?;
                tracing::info!(job_id = id, queue = %job.queue, duration_ms, "job done");
                JobOutcome::Acked
            }
            Err(e) => {
                let message = e.to_string();
                match self.queue.fail(id, self.retry_after, &message).await? {
                    FailOutcome::Retry => {
                        tracing::warn!(
                            job_id = id,
                            queue = %job.queue,
                            attempt = job.attempts,
                            error = %message,
                            "job failed; retry scheduled"
                        );
                        JobOutcome::Retried(message)
                    }
                    FailOutcome::Dead => {
                        tracing::error!(
                            job_id = id,
                            queue = %job.queue,
                            attempt = job.attempts,
                            error = %message,
                            "job failed permanently"
                        );
                        JobOutcome::Dead(message)
                    }
                }
            }
        };
        Ok(Some(outcome))
    }

    async fn execute(&self, job: &Job) -> Result<(), RuntimeError> {
        let handler = self.handlers.get(&job.queue).ok_or_else(|| {
            RuntimeError::queue(format!("no job.handler registered for '{}'", job.queue))
        })?;

        let arena = self.arenas.acquire();
        let scope = Scope::in_arena(arena.arena());
        scope.set("payload", decode_payload(&job.payload));
        scope.set("job", job_info(job));

        let mut ctx = Context::new().with_engine(self.engine.clone());
        if let Some(timeout) = self.job_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        match self
            .engine
            .execute_body(&ctx, &handler, &scope, &["queue"])
            .await
        {
            Err(e) if e.is_sentinel() => Ok(()),
            other => other,
        }
    }
}

/// JSON payloads become values; anything else is handed over as text.
fn decode_payload(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn job_info(job: &Job) -> Value {
    let mut info = ValueMap::new();
    info.insert("id".into(), Value::Int(job.id));
    info.insert("queue".into(), Value::from(job.queue.as_str()));
    info.insert("attempts".into(), Value::Int(i64::from(job.attempts)));
    Value::Map(info)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Running worker loops.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Stop polling and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "worker task aborted");
            }
        }
        tracing::info!("worker pool stopped");
    }
}
