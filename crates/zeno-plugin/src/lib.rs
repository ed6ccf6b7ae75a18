//! Zeno plugin host.
//!
//! Plugins extend the slot registry with code that runs outside the
//! interpreter, either as a WebAssembly guest or as a sidecar process.
//!
//! # Modules
//!
//! - [`manifest`]: `plugin.toml` / `plugin.yaml` / `plugin.json` parsing
//! - [`permissions`]: Capability checks built from the manifest
//! - [`host`] and [`linker`]: Host functions imported by Wasm guests
//! - [`http_outbound`]: Outbound HTTP with SSRF protection and a per-call cap
//! - [`wasm`] and [`sidecar`]: The two [`PluginBackend`] implementations
//! - [`manager`]: Loading, hot reload and slot registration
//!
//! # Security Model
//!
//! 1. **Permissions**: Every host function checks the manifest's grants
//!    before doing any work; a denial is an error envelope.
//! 2. **Resource limits**: Each guest call gets fresh fuel, a memory cap
//!    and a deadline.
//! 3. **SSRF Protection**: Private and metadata addresses are blocked
//!    regardless of network patterns.

pub mod backend;
pub mod host;
pub mod http_outbound;
pub mod linker;
pub mod logging;
pub mod manager;
pub mod manifest;
pub mod permissions;
pub mod sidecar;
pub mod slot;
pub mod wasm;

pub use backend::{CallOutcome, CallRequest, PluginBackend};
pub use host::{Envelope, HostContext};
pub use http_outbound::HttpOutboundHost;
pub use logging::LoggingHost;
pub use manager::{LoadedPlugin, PluginInfo, PluginManager};
pub use manifest::{ConfigField, ManifestPermissions, PluginManifest, SlotDeclaration};
pub use permissions::Permissions;
pub use sidecar::SidecarBackend;
pub use slot::PluginSlot;
pub use wasm::WasmBackend;
