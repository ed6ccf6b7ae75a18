//! Guest store state and per-call resource limits.
//!
//! This module provides:
//! - [`GuestState`]: Data owned by a guest's store, reachable from host functions
//! - [`LogEntry`] and [`LogLevel`]: Log lines emitted by guest code
//! - [`ExecutionMetrics`]: Fuel and timing of the latest guest call

use std::time::{Duration, Instant};

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use crate::WasmEngine;
use zeno_common::{ExecutionConfig, RuntimeError};

/// State held by a guest store.
///
/// `H` is the embedder's host context: the plugin host keeps its
/// permissions and the per-call scope snapshot there.
pub struct GuestState<H> {
    pub host: H,

    /// Identifier of the current call, for tracing.
    pub request_id: String,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    pub metrics: ExecutionMetrics,

    limits: StoreLimits,

    start_time: Instant,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Metrics of the latest guest call.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    pub fuel_consumed: u64,
    pub memory_used_bytes: usize,
    pub duration: Option<Duration>,
    /// Guest calls made through this store.
    pub calls: u64,
}

impl<H> GuestState<H> {
    pub fn new(host: H, config: &ExecutionConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size((config.max_memory_mb as usize) * 1024 * 1024)
            .build();
        Self {
            host,
            request_id: uuid::Uuid::new_v4().to_string(),
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            limits,
            start_time: Instant::now(),
        }
    }

    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Reset per-call bookkeeping before a new guest call.
    pub fn begin_call(&mut self, request_id: String) {
        self.request_id = request_id;
        self.logs.clear();
        self.start_time = Instant::now();
        self.metrics.calls += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn finalize_metrics(&mut self) {
        self.metrics.duration = Some(self.start_time.elapsed());
    }
}

/// Create a store for a guest, with its memory cap installed.
///
/// # Errors
///
/// Returns `InvalidConfig` if fuel cannot be set on the store.
pub fn create_store<H: Send>(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    host: H,
) -> Result<Store<GuestState<H>>, RuntimeError> {
    let mut store = Store::new(engine.inner(), GuestState::new(host, config));
    store.limiter(|state| &mut state.limits);
    refuel(&mut store, engine, config)?;
    Ok(store)
}

/// Restore the per-call budget: fuel, async yield cadence and epoch deadline.
///
/// # Errors
///
/// Returns `InvalidConfig` if fuel cannot be set on the store.
pub fn refuel<H>(
    store: &mut Store<GuestState<H>>,
    engine: &WasmEngine,
    config: &ExecutionConfig,
) -> Result<(), RuntimeError> {
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;
    // Yielding lets a tokio timeout cut a spinning guest short.
    store
        .fuel_async_yield_interval(Some(10_000))
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set yield interval: {e}")))?;

    // Deadline in ticks of a 1ms epoch ticker.
    if engine.config().epoch_interruption {
        store.set_epoch_deadline(config.timeout_ms);
    }
    Ok(())
}

pub fn get_remaining_fuel<H>(store: &Store<GuestState<H>>) -> Option<u64> {
    store.get_fuel().ok()
}

pub fn calculate_fuel_consumed<H>(initial_fuel: u64, store: &Store<GuestState<H>>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
