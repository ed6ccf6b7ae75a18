//! Zeno Core: the slot tree interpreter.
//!
//! This crate provides:
//! - [`Value`] and [`Node`], the data every layer exchanges
//! - [`Scope`] chains allocated from a pooled [`Arena`]
//! - the [`SlotRegistry`] and the [`Engine`] that dispatches into it
//! - the built-in control-flow slots and the preflight [`Analyzer`]

pub mod analyzer;
pub mod arena;
pub mod context;
pub mod engine;
pub mod expr;
pub mod loader;
pub mod node;
pub mod registry;
pub mod scope;
pub mod slots;
pub mod value;

pub use analyzer::Analyzer;
pub use arena::{Arena, ArenaGuard, ArenaPool, PoolStats};
pub use context::Context;
pub use engine::{Engine, assign_path};
pub use loader::{JsonLoader, NodeLoader};
pub use node::Node;
pub use registry::{InputSpec, SlotEntry, SlotHandler, SlotMetadata, SlotRegistry};
pub use scope::Scope;
pub use value::{Opaque, Value, ValueMap};
pub use zeno_common::{RuntimeError, SourceLocation};
