//! The seam between the plugin manager and a plugin's runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use zeno_common::RuntimeError;
use zeno_core::ValueMap;

use crate::host::Envelope;
use crate::manifest::SlotDeclaration;

/// One slot invocation as sent to a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub slot_name: String,
    pub parameters: serde_json::Map<String, Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Json>,
}

/// A plugin's reply plus the scope writes its host calls made.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub response: Envelope,
    pub scope_writes: ValueMap,
}

impl CallOutcome {
    pub fn reply(response: Envelope) -> Self {
        Self {
            response,
            scope_writes: ValueMap::new(),
        }
    }
}

/// A loaded plugin runtime: a Wasm guest or a sidecar process.
#[async_trait]
pub trait PluginBackend: Send + Sync {
    /// `wasm` or `sidecar`.
    fn kind(&self) -> &'static str;

    /// Slots the plugin contributes.
    async fn slots(&self) -> Result<Vec<SlotDeclaration>, RuntimeError>;

    /// Run one slot. `scope` is the caller's visible variables.
    async fn call(&self, request: CallRequest, scope: ValueMap) -> Result<CallOutcome, RuntimeError>;

    /// Release the runtime. Calls after shutdown fail.
    async fn shutdown(&self);
}
