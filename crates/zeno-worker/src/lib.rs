//! Zeno Worker: durable background jobs.
//!
//! This crate provides:
//! - [`SqliteQueue`], an at-least-once queue with leases and an attempt cap
//! - [`WorkerPool`], polling loops that run `job.handler` bodies
//! - the `job.enqueue` / `job.handler` slots

pub mod pool;
pub mod queue;
pub mod slots;

pub use pool::{JobHandlers, JobOutcome, WorkerHandle, WorkerPool};
pub use queue::{DEFAULT_MAX_ATTEMPTS, FailOutcome, Job, Queue, QueueStats, SqliteQueue};
pub use slots::{DEFAULT_QUEUE, register};
