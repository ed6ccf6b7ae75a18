//! Side-band request context threaded through slot handlers.
//!
//! A [`Context`] is not a scope: it carries the active engine, an optional
//! deadline and native objects under well-known keys (the HTTP request and
//! writer, the active router, ...). Contexts are immutable; `with_*` returns
//! a new context sharing the untouched entries.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use zeno_common::RuntimeError;

use crate::engine::Engine;

/// Key of the incoming HTTP request.
pub const HTTP_REQUEST: &str = "httpRequest";
/// Key of the active response writer.
pub const HTTP_WRITER: &str = "httpWriter";
/// Key of the route collector used during registration.
pub const ROUTER: &str = "router";

type Entry = Arc<dyn Any + Send + Sync>;

/// Immutable, cheaply cloned request context.
#[derive(Clone, Default)]
pub struct Context {
    engine: Option<Engine>,
    deadline: Option<Deadline>,
    values: Arc<HashMap<&'static str, Entry>>,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the engine handle.
    #[must_use]
    pub fn with_engine(&self, engine: Engine) -> Self {
        let mut next = self.clone();
        next.engine = Some(engine);
        next
    }

    /// Attach a deadline `timeout` from now; an earlier deadline is kept.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Deadline {
            at: Instant::now() + timeout,
            budget: timeout,
        };
        let mut next = self.clone();
        next.deadline = match self.deadline {
            Some(existing) if existing.at <= candidate.at => Some(existing),
            _ => Some(candidate),
        };
        next
    }

    /// Attach a native value under a well-known key.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, key: &'static str, value: Arc<T>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key, value);
        let mut next = self.clone();
        next.values = Arc::new(values);
        next
    }

    /// Fetch a native value by key and type.
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    /// The engine handle, or a failure when the context was built without one.
    ///
    /// # Errors
    ///
    /// Returns `Failed` if no engine is attached.
    pub fn require_engine(&self) -> Result<&Engine, RuntimeError> {
        self.engine
            .as_ref()
            .ok_or_else(|| RuntimeError::failed("no engine attached to context"))
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.at.saturating_duration_since(Instant::now()))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    /// Fail with `Timeout` once the deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` carrying the configured budget.
    pub fn check_deadline(&self) -> Result<(), RuntimeError> {
        match self.deadline {
            Some(d) if Instant::now() >= d.at => Err(self.timeout_error()),
            _ => Ok(()),
        }
    }

    /// The error raised when the deadline passes.
    pub fn timeout_error(&self) -> RuntimeError {
        let budget = self.deadline.map_or(Duration::ZERO, |d| d.budget);
        RuntimeError::Timeout {
            duration_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Sleep for `duration`, cut short by the deadline.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the deadline passes while sleeping.
    pub async fn sleep(&self, duration: Duration) -> Result<(), RuntimeError> {
        match self.remaining() {
            Some(left) if left < duration => {
                tokio::time::sleep(left).await;
                Err(self.timeout_error())
            }
            _ => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("has_engine", &self.engine.is_some())
            .field("remaining", &self.remaining())
            .field("keys", &keys)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_by_key_and_type() {
        let ctx = Context::new().with_value(HTTP_REQUEST, Arc::new(String::from("GET /")));

        assert_eq!(
            ctx.value::<String>(HTTP_REQUEST).as_deref().map(String::as_str),
            Some("GET /")
        );
        assert!(ctx.value::<u32>(HTTP_REQUEST).is_none());
        assert!(ctx.value::<String>(HTTP_WRITER).is_none());
    }

    #[test]
    fn test_with_value_leaves_original_untouched() {
        let base = Context::new();
        let derived = base.with_value(ROUTER, Arc::new(1_u8));
        assert!(base.value::<u8>(ROUTER).is_none());
        assert!(derived.value::<u8>(ROUTER).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        assert!(ctx.check_deadline().is_ok());

        tokio::time::advance(Duration::from_millis(150)).await;
        let err = ctx.check_deadline().unwrap_err();
        assert_eq!(err, RuntimeError::Timeout { duration_ms: 100 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let ctx = Context::new()
            .with_timeout(Duration::from_millis(50))
            .with_timeout(Duration::from_secs(10));
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_respects_deadline() {
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let err = ctx.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_timeout());

        assert!(Context::new().sleep(Duration::from_millis(5)).await.is_ok());
    }
}
