//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is shared by every plugin guest. It carries no
//! per-plugin state; stores and instances hang off it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use zeno_common::{EngineConfig, RuntimeError};

/// Thread-safe WebAssembly engine wrapper.
///
/// The engine is configured with:
/// - **Pooling Allocator**: Pre-allocates memory slots for guest instances
/// - **Fuel Metering**: Deterministic CPU limit per guest call
/// - **Epoch Interruption**: Wall-clock backstop driven by [`Self::spawn_epoch_ticker`]
/// - **Async Support**: Host functions may await database and network I/O
///
/// # Example
///
/// ```ignore
/// use zeno_common::EngineConfig;
/// use zeno_wasm::WasmEngine;
///
/// let engine = WasmEngine::new(&EngineConfig::default())?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the Wasmtime configuration is rejected
    /// (for example when the pooling allocator cannot reserve its slots).
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(true);
        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }
        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);
            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        if config.cache_compiled_modules {
            let loaded = match config.cache_dir.as_deref() {
                Some(file) => wasmtime_config.cache_config_load(file),
                None => wasmtime_config.cache_config_load_default(),
            };
            loaded.map_err(|e| {
                RuntimeError::invalid_config(format!("Invalid module cache config: {e}"))
            })?;
            debug!(cache_config = ?config.cache_dir, "On-disk module cache enabled");
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;

        info!("Wasmtime engine initialized");

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        // One core instance, memory and table per loaded plugin.
        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Advance the epoch counter by one tick.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Tick the epoch every `interval` until `cancel` fires.
    ///
    /// Store deadlines are expressed in ticks of this interval.
    pub fn spawn_epoch_ticker(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => engine.increment_epoch(),
                }
            }
            debug!("epoch ticker stopped");
        })
    }

    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("instance_memory_mb", &self.config.instance_memory_mb)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpooled() -> EngineConfig {
        EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_engine_creation_default() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        assert!(engine.is_pooling_enabled());
    }

    #[test]
    fn test_engine_creation_no_pooling() {
        let engine = WasmEngine::new(&unpooled()).unwrap();
        assert!(!engine.is_pooling_enabled());
    }

    #[tokio::test]
    async fn test_epoch_ticker_stops_on_cancel() {
        let engine = WasmEngine::new(&unpooled()).unwrap();
        let cancel = CancellationToken::new();
        let ticker = engine.spawn_epoch_ticker(Duration::from_millis(1), cancel.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        ticker.await.unwrap();
    }

    #[test]
    fn test_engine_debug() {
        let engine = WasmEngine::new(&unpooled()).unwrap();
        let debug_str = format!("{engine:?}");
        assert!(debug_str.contains("WasmEngine"));
        assert!(debug_str.contains("pooling_allocator"));
    }
}
