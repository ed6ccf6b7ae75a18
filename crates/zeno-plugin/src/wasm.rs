//! WebAssembly plugin backend.
//!
//! A guest exports `memory`, `alloc(size) -> ptr` and:
//!
//! - `plugin_init(config_ptr, config_len) -> i32`: 0 on success
//! - `plugin_register_slots() -> ptr`: JSON array of slot declarations
//! - `plugin_execute(slot_ptr, slot_len, params_ptr, params_len) -> ptr`:
//!   JSON [`Envelope`]
//! - `plugin_cleanup()`
//!
//! Returned pointers address NUL-terminated UTF-8.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wasmtime::Linker;
use zeno_common::{ExecutionConfig, RuntimeError};
use zeno_core::ValueMap;
use zeno_wasm::{CompiledModule, GuestInstance, WasmEngine};

use crate::backend::{CallOutcome, CallRequest, PluginBackend};
use crate::host::{Envelope, HostContext};
use crate::linker::PluginState;
use crate::manifest::SlotDeclaration;

/// Exports every plugin guest must provide.
pub const REQUIRED_EXPORTS: &[&str] = &[
    "plugin_init",
    "plugin_register_slots",
    "plugin_execute",
    "plugin_cleanup",
    "alloc",
];

/// Key under which the call context is passed to `plugin_execute`.
pub const CONTEXT_KEY: &str = "_context";

pub struct WasmBackend {
    name: String,
    engine: WasmEngine,
    module: CompiledModule,
    linker: Arc<Linker<PluginState>>,
    config: ExecutionConfig,
    host: HostContext,
    init_config: Vec<u8>,
    /// `None` after shutdown.
    instance: Mutex<Option<GuestInstance<HostContext>>>,
}

impl WasmBackend {
    /// Instantiate and initialize the guest.
    ///
    /// # Errors
    ///
    /// Returns `Plugin` for missing exports or a failing `plugin_init`,
    /// and the guest's error when instantiation traps.
    pub async fn load(
        name: &str,
        engine: &WasmEngine,
        module: CompiledModule,
        linker: Arc<Linker<PluginState>>,
        config: ExecutionConfig,
        host: HostContext,
        init_config: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, RuntimeError> {
        let exported = module.exported_functions();
        let missing: Vec<&str> = REQUIRED_EXPORTS
            .iter()
            .copied()
            .filter(|export| !exported.iter().any(|e| e == export))
            .collect();
        if !missing.is_empty() {
            return Err(RuntimeError::plugin(
                name,
                format!("guest is missing exports: {}", missing.join(", ")),
            ));
        }

        let init_config = serde_json::to_vec(init_config)
            .map_err(|e| RuntimeError::plugin(name, format!("config: {e}")))?;
        let backend = Self {
            name: name.to_string(),
            engine: engine.clone(),
            module,
            linker,
            config,
            host,
            init_config,
            instance: Mutex::new(None),
        };
        let instance = backend.start().await?;
        *backend.instance.lock().await = Some(instance);
        info!(plugin = name, content_hash = backend.content_hash(), "wasm plugin started");
        Ok(backend)
    }

    pub fn content_hash(&self) -> &str {
        self.module.content_hash()
    }

    async fn start(&self) -> Result<GuestInstance<HostContext>, RuntimeError> {
        let mut instance = GuestInstance::instantiate(
            &self.engine,
            &self.module,
            &self.linker,
            &self.config,
            self.host.clone(),
        )
        .await?;
        let status = instance
            .invoke("plugin_init", &[self.init_config.as_slice()], request_id())
            .await?;
        match status {
            Some(0) | None => Ok(instance),
            Some(code) => Err(RuntimeError::plugin(
                &self.name,
                format!("plugin_init returned {code}"),
            )),
        }
    }

    fn closed(&self) -> RuntimeError {
        RuntimeError::plugin(&self.name, "plugin has been unloaded")
    }
}

#[async_trait]
impl PluginBackend for WasmBackend {
    fn kind(&self) -> &'static str {
        "wasm"
    }

    async fn slots(&self) -> Result<Vec<SlotDeclaration>, RuntimeError> {
        let mut guard = self.instance.lock().await;
        let instance = guard.as_mut().ok_or_else(|| self.closed())?;
        let ptr = instance
            .invoke("plugin_register_slots", &[], request_id())
            .await?
            .unwrap_or(0);
        if ptr == 0 {
            return Ok(Vec::new());
        }
        let json = instance.read_cstr(ptr)?;
        serde_json::from_str(&json)
            .map_err(|e| RuntimeError::plugin(&self.name, format!("slot declarations: {e}")))
    }

    async fn call(&self, request: CallRequest, scope: ValueMap) -> Result<CallOutcome, RuntimeError> {
        let mut guard = self.instance.lock().await;
        let slot = guard.as_mut().ok_or_else(|| self.closed())?;
        if slot.is_poisoned() {
            warn!(plugin = %self.name, "re-instantiating poisoned guest");
            *slot = self.start().await?;
        }

        let CallRequest {
            slot_name,
            mut parameters,
            context,
        } = request;
        if let Some(context) = context {
            parameters.insert(CONTEXT_KEY.into(), context);
        }
        let params = serde_json::to_vec(&parameters)
            .map_err(|e| RuntimeError::plugin(&self.name, format!("parameters: {e}")))?;

        slot.host().begin_call(scope);
        let ptr = slot
            .invoke(
                "plugin_execute",
                &[slot_name.as_bytes(), params.as_slice()],
                request_id(),
            )
            .await?
            .unwrap_or(0);
        let scope_writes = slot.host().take_writes();

        let response = if ptr == 0 {
            Envelope::failure(format!("{slot_name} returned no reply"))
        } else {
            let reply = slot.read_cstr(ptr)?;
            serde_json::from_str(&reply).map_err(|e| {
                RuntimeError::plugin(&self.name, format!("malformed reply from {slot_name}: {e}"))
            })?
        };
        debug!(
            plugin = %self.name,
            slot = %slot_name,
            success = response.success,
            fuel_consumed = slot.state().metrics.fuel_consumed,
            "plugin call finished"
        );
        Ok(CallOutcome {
            response,
            scope_writes,
        })
    }

    async fn shutdown(&self) {
        let Some(mut instance) = self.instance.lock().await.take() else {
            return;
        };
        if instance.is_poisoned() {
            return;
        }
        if let Err(e) = instance.invoke("plugin_cleanup", &[], request_id()).await {
            warn!(plugin = %self.name, error = %e, "plugin_cleanup failed");
        }
    }
}

impl std::fmt::Debug for WasmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBackend")
            .field("name", &self.name)
            .field("content_hash", &self.content_hash())
            .finish_non_exhaustive()
    }
}

fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
