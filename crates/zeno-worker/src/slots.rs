//! `job.enqueue` and `job.handler`.
//!
//! ```text
//! job.handler: emails
//!   do:
//!     log: "sending to $payload.to"
//!
//! job.enqueue: emails
//!   payload:
//!     to: $user.email
//!   delay: 5s
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use zeno_common::RuntimeError;
use zeno_core::slots::duration_of;
use zeno_core::{Context, Engine, Node, Scope, SlotHandler, SlotMetadata, Value};

use crate::pool::JobHandlers;
use crate::queue::Queue;

/// Queue used when a slot names none.
pub const DEFAULT_QUEUE: &str = "default";

struct Enqueue {
    queue: Arc<dyn Queue>,
}

#[async_trait]
impl SlotHandler for Enqueue {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let queue = match engine.value_or_attr(node, "queue", scope)? {
            Value::Nil => DEFAULT_QUEUE.to_string(),
            name => name.to_display_string(),
        };
        let payload = engine.attr(node, "payload", scope)?.unwrap_or_default();
        if payload.as_opaque().is_some() {
            return Err(RuntimeError::failed("job payload must be plain data"));
        }
        let delay = match engine.attr(node, "delay", scope)? {
            Some(value) if !value.is_nil() => duration_of(&value)?,
            _ => Duration::ZERO,
        };

        let bytes = payload.to_json().to_string().into_bytes();
        let enqueue = self.queue.enqueue(&queue, &bytes, delay);
        let id = match ctx.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, enqueue)
                .await
                .map_err(|_| ctx.timeout_error())??,
            None => enqueue.await?,
        };

        if let Some(target) = node.as_name() {
            scope.set(target, Value::Int(id));
        }
        Ok(())
    }
}

struct Handler {
    handlers: Arc<JobHandlers>,
}

#[async_trait]
impl SlotHandler for Handler {
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError> {
        let engine = ctx.require_engine()?;
        let queue = engine.value_or_attr(node, "queue", scope)?;
        if queue.is_nil() {
            return Err(RuntimeError::failed("job.handler requires a queue name"));
        }
        if !node.has_child("do") {
            return Err(RuntimeError::failed("job.handler requires a do block"));
        }
        let queue = queue.to_display_string();
        tracing::debug!(queue = %queue, "job handler registered");
        self.handlers.insert(queue, node.clone());
        Ok(())
    }
}

/// Register the job slots on `engine`.
pub fn register(engine: &Engine, queue: &Arc<dyn Queue>, handlers: &Arc<JobHandlers>) {
    engine.register(
        "job.enqueue",
        Arc::new(Enqueue {
            queue: Arc::clone(queue),
        }),
        SlotMetadata::new("Push a job onto a durable queue")
            .example("job.enqueue: emails\n  payload:\n    to: $user.email")
            .input("queue", "string", "Queue name (default `default`)")
            .input("payload", "any", "Data handed to the handler as `$payload`")
            .input("delay", "duration", "Delay before the job becomes visible")
            .input("as", "string", "Variable receiving the job id"),
    );
    engine.register(
        "job.handler",
        Arc::new(Handler {
            handlers: Arc::clone(handlers),
        }),
        SlotMetadata::new("Declare the body run for each job of a queue")
            .example("job.handler: emails\n  do:\n    log: $payload.to")
            .required("queue", "string", "Queue the handler consumes")
            .block("do"),
    );
}
