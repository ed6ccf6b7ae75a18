//! Durable job queue backed by a local SQLite file.
//!
//! A claim moves a job to `running` and pushes its `available_at` one lease
//! into the future. A worker that dies mid-job therefore never acks, and the
//! job turns visible again once the lease runs out.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use zeno_common::RuntimeError;

/// Attempts before a job is parked as `failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// A claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub payload: Vec<u8>,
    /// Attempts including the current one.
    pub attempts: u32,
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job becomes visible again after the retry delay.
    Retry,
    /// The attempt cap was reached; the job will not run again.
    Dead,
}

/// Operations the worker pool needs from a queue backend.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Add a job that becomes visible after `delay`.
    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Duration,
    ) -> Result<i64, RuntimeError>;

    /// Take the oldest visible job from any of `queues`.
    async fn claim(&self, queues: &[String]) -> Result<Option<Job>, RuntimeError>;

    /// Mark a job done.
    async fn ack(&self, id: i64) -> Result<(), RuntimeError>;

    /// Record a failed attempt and schedule the retry.
    async fn fail(
        &self,
        id: i64,
        retry_after: Duration,
        error: &str,
    ) -> Result<FailOutcome, RuntimeError>;
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    payload BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at INTEGER NOT NULL,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (queue, status, available_at);
";

/// Job counts by status, for readiness reporting and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

/// SQLite implementation of [`Queue`].
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    lease: Duration,
    max_attempts: u32,
}

impl SqliteQueue {
    /// Open (creating if needed) the queue file at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Queue` when the file or its schema cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RuntimeError::queue(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .map_err(|e| RuntimeError::queue(format!("open {}: {e}", path.display())))?;
        Self::from_pool(pool).await
    }

    /// A queue that lives only as long as the process.
    ///
    /// # Errors
    ///
    /// Returns `Queue` when the schema cannot be created.
    pub async fn in_memory() -> Result<Self, RuntimeError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(RuntimeError::queue)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema.
    ///
    /// # Errors
    ///
    /// Returns `Queue` when the schema cannot be created.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, RuntimeError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| RuntimeError::queue(format!("create schema: {e}")))?;
        Ok(Self {
            pool,
            lease: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Set the visibility timeout of a claim.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the attempt cap.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Count jobs per status.
    ///
    /// # Errors
    ///
    /// Returns `Queue` on a storage failure.
    pub async fn stats(&self) -> Result<QueueStats, RuntimeError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(RuntimeError::queue)?;
        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(RuntimeError::queue)?;
            let n: i64 = row.try_get("n").map_err(RuntimeError::queue)?;
            let n = u64::try_from(n).unwrap_or(0);
            match status.as_str() {
                "pending" => stats.pending = n,
                "running" => stats.running = n,
                "done" => stats.done = n,
                "failed" => stats.failed = n,
                _ => {}
            }
        }
        Ok(stats)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Duration,
    ) -> Result<i64, RuntimeError> {
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO jobs (queue, payload, available_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(queue)
        .bind(payload)
        .bind(now.saturating_add(millis(delay)))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| RuntimeError::queue(format!("enqueue on '{queue}': {e}")))?;

        let id = result.last_insert_rowid();
        tracing::debug!(job_id = id, queue, "job enqueued");
        Ok(id)
    }

    async fn claim(&self, queues: &[String]) -> Result<Option<Job>, RuntimeError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let now = now_ms();
        let placeholders = vec!["?"; queues.len()].join(", ");
        // A single statement: two workers can never take the same row.
        let sql = format!(
            "UPDATE jobs SET status = 'running', attempts = attempts + 1, \
             available_at = ?, updated_at = ? \
             WHERE id = (SELECT id FROM jobs \
                 WHERE queue IN ({placeholders}) \
                 AND status IN ('pending', 'running') AND available_at <= ? \
                 ORDER BY available_at, id LIMIT 1) \
             RETURNING id, queue, payload, attempts"
        );
        let mut query = sqlx::query(&sql)
            .bind(now.saturating_add(millis(self.lease)))
            .bind(now);
        for queue in queues {
            query = query.bind(queue);
        }
        let row = query
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RuntimeError::queue(format!("claim: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let attempts: i64 = row.try_get("attempts").map_err(RuntimeError::queue)?;
        Ok(Some(Job {
            id: row.try_get("id").map_err(RuntimeError::queue)?,
            queue: row.try_get("queue").map_err(RuntimeError::queue)?,
            payload: row.try_get("payload").map_err(RuntimeError::queue)?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, id: i64) -> Result<(), RuntimeError> {
        sqlx::query("UPDATE jobs SET status = 'done', updated_at = ? WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RuntimeError::queue(format!("ack {id}: {e}")))?;
        Ok(())
    }

    async fn fail(
        &self,
        id: i64,
        retry_after: Duration,
        error: &str,
    ) -> Result<FailOutcome, RuntimeError> {
        let now = now_ms();
        let row = sqlx::query(
            "UPDATE jobs SET \
                 status = CASE WHEN attempts >= ? THEN 'failed' ELSE 'pending' END, \
                 available_at = ?, last_error = ?, updated_at = ? \
             WHERE id = ? RETURNING status",
        )
        .bind(i64::from(self.max_attempts))
        .bind(now.saturating_add(millis(retry_after)))
        .bind(error)
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RuntimeError::queue(format!("fail {id}: {e}")))?
        .ok_or_else(|| RuntimeError::queue(format!("unknown job {id}")))?;

        let status: String = row.try_get("status").map_err(RuntimeError::queue)?;
        Ok(if status == "failed" {
            FailOutcome::Dead
        } else {
            FailOutcome::Retry
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_claim_is_fifo_per_subscription() {
        let queue = SqliteQueue::in_memory().await.unwrap();
        let first = queue.enqueue("mail", b"one", Duration::ZERO).await.unwrap();
        queue.enqueue("other", b"skip", Duration::ZERO).await.unwrap();
        let second = queue.enqueue("mail", b"two", Duration::ZERO).await.unwrap();

        let job = queue.claim(&queues(&["mail"])).await.unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.payload, b"one");
        assert_eq!(job.attempts, 1);

        let job = queue.claim(&queues(&["mail"])).await.unwrap().unwrap();
        assert_eq!(job.id, second);
        assert!(queue.claim(&queues(&["mail"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_is_invisible() {
        let queue = SqliteQueue::in_memory().await.unwrap();
        queue
            .enqueue("default", b"later", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(queue.claim(&queues(&["default"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_makes_job_visible_again() {
        let queue = SqliteQueue::in_memory()
            .await
            .unwrap()
            .with_lease(Duration::ZERO);
        let id = queue.enqueue("default", b"x", Duration::ZERO).await.unwrap();

        let job = queue.claim(&queues(&["default"])).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        // Never acked: the zero lease has already run out.
        let again = queue.claim(&queues(&["default"])).await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_ack_and_fail_transitions() {
        let queue = SqliteQueue::in_memory()
            .await
            .unwrap()
            .with_max_attempts(2);
        let done = queue.enqueue("q", b"ok", Duration::ZERO).await.unwrap();
        let job = queue.claim(&queues(&["q"])).await.unwrap().unwrap();
        assert_eq!(job.id, done);
        queue.ack(done).await.unwrap();

        let flaky = queue.enqueue("q", b"bad", Duration::ZERO).await.unwrap();
        queue.claim(&queues(&["q"])).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(flaky, Duration::ZERO, "boom").await.unwrap(),
            FailOutcome::Retry
        );
        queue.claim(&queues(&["q"])).await.unwrap().unwrap();
        assert_eq!(
            queue.fail(flaky, Duration::ZERO, "boom").await.unwrap(),
            FailOutcome::Dead
        );
        assert!(queue.claim(&queues(&["q"])).await.unwrap().is_none());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("zeno_internal.db");
        let queue = SqliteQueue::open(&path).await.unwrap();
        queue.enqueue("default", b"{}", Duration::ZERO).await.unwrap();
        queue.close().await;
        assert!(path.exists());

        let reopened = SqliteQueue::open(&path).await.unwrap();
        assert_eq!(reopened.stats().await.unwrap().pending, 1);
    }
}
