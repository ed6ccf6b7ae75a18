//! Common types, errors, and utilities for zeno.
//!
//! This crate provides shared functionality used across the zeno workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures, the TOML config file and environment overlay
//! - Source locations carried by nodes and diagnostics

pub mod config;
pub mod config_file;
pub mod error;
pub mod location;

pub use config::{
    AdminConfig, ConnectionConfig, DatabaseConfig, EngineConfig, ExecutionConfig, PluginConfig,
    RuntimeConfig, ServerConfig, WorkerConfig, parse_bool, parse_duration,
};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{Diagnostic, HostFunctionError, RuntimeError};
pub use location::SourceLocation;
