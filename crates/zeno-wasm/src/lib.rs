//! Wasmtime runtime for zeno plugin guests.
//!
//! This crate provides the WebAssembly side of the plugin host:
//! - [`WasmEngine`]: Configured Wasmtime engine with pooling allocator
//! - [`CompiledModule`] and [`ModuleCache`]: Compiled guests, cached by content hash
//! - [`GuestState`]: Store data reachable from host functions
//! - [`GuestInstance`]: An instantiated guest and its memory protocol
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared by all plugins, thread-safe)                   │
//! │  - Pooling Allocator                                    │
//! │  - Fuel metering, epoch interruption                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ModuleCache                          │
//! │  (Content hash → CompiledModule)                        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          GuestInstance<H> (Store<GuestState<H>>)        │
//! │  (One per loaded plugin, calls serialized)              │
//! │  - alloc / NUL-terminated reply protocol                │
//! │  - Fuel and timeout budget per call                     │
//! │  - Guest logs and metrics                               │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod module;
pub mod store;

pub use engine::WasmEngine;
pub use instance::{GuestInstance, read_guest, trap_to_error, write_guest_cstr};
pub use module::{CompiledModule, ModuleCache, compute_hash};
pub use store::{ExecutionMetrics, GuestState, LogEntry, LogLevel, create_store};
