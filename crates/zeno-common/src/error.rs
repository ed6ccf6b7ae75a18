//! Error types for zeno.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors raised while loading, analyzing and
//!   executing slot trees, plus the infrastructure errors beneath them
//! - [`HostFunctionError`]: Errors from plugin host function implementations
//! - [`Diagnostic`]: The structured shape bound into `catch` blocks

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::location::SourceLocation;

/// Top-level runtime errors.
///
/// Control-flow sentinels (`Return`, `Break`, `Continue`, `FnReturn`) travel
/// through the same channel as failures so that `?` unwinds the tree walk;
/// boundaries that understand them consume them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// The tree could not be built from its source.
    #[error("Syntax error at {location}: {message}")]
    Syntax {
        /// Description of the syntax problem.
        message: String,
        /// Where the problem was found.
        location: SourceLocation,
    },

    /// A problem found by the static analyzer.
    #[error("{location}: {message}")]
    Static {
        /// Description of the problem.
        message: String,
        /// Offending node location.
        location: SourceLocation,
    },

    /// A node named a slot that is not registered.
    #[error("Unknown slot '{slot}' at {location}")]
    UnknownSlot {
        /// The unregistered slot name.
        slot: String,
        /// Offending node location.
        location: SourceLocation,
    },

    /// A slot handler failed; carries the slot name and the node location.
    #[error("{slot} at {location}: {message}")]
    Slot {
        /// Name of the failing slot.
        slot: String,
        /// Failure description.
        message: String,
        /// Offending node location.
        location: SourceLocation,
    },

    /// A handler failure not yet attributed to a node.
    ///
    /// The engine converts this into [`RuntimeError::Slot`] when it unwinds
    /// past the dispatching node.
    #[error("{message}")]
    Failed {
        /// Failure description.
        message: String,
    },

    /// A disallowed operation was attempted.
    #[error("Security violation: {message}")]
    Security {
        /// What was denied.
        message: String,
    },

    /// The request or job deadline passed.
    #[error("Execution timeout after {duration_ms}ms")]
    Timeout {
        /// The configured timeout in milliseconds.
        duration_ms: u64,
    },

    /// Early, successful termination after a response was written.
    #[error("return")]
    Return,

    /// Leave the innermost loop.
    #[error("break outside of loop")]
    Break,

    /// Skip to the next loop iteration.
    #[error("continue outside of loop")]
    Continue,

    /// Leave the innermost function frame; the value sits in the frame scope.
    #[error("return outside of function")]
    FnReturn,

    /// A database operation failed.
    #[error("Database error during {operation}: {details}")]
    Database {
        /// The operation being performed.
        operation: String,
        /// Driver-level failure description.
        details: String,
    },

    /// A worker queue operation failed.
    #[error("Queue error: {reason}")]
    Queue {
        /// Failure description.
        reason: String,
    },

    /// A plugin could not be loaded or invoked.
    #[error("Plugin '{plugin}': {reason}")]
    Plugin {
        /// Plugin name.
        plugin: String,
        /// Failure description.
        reason: String,
    },

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// The bytecode VM failed.
    #[error("VM error: {message}")]
    Vm {
        /// Failure description.
        message: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Guest execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// A WebAssembly trap occurred during guest execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// I/O operation failed.
    #[error("IO error: {message}")]
    Io {
        /// Failure description.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from plugin host function implementations.
///
/// These errors occur when host functions (provided by the runtime to
/// guest plugins) fail to complete their operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostFunctionError {
    /// An HTTP request made by the guest failed.
    #[error("HTTP request failed: {url} (status: {status})")]
    HttpRequestFailed {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code (0 if connection failed).
        status: u16,
    },

    /// The requested operation was denied by the permission system.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// Rate limit for host function calls was exceeded.
    #[error("Rate limit exceeded: {operation}")]
    RateLimitExceeded {
        /// The operation that was rate-limited.
        operation: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The backing resource failed (database, filesystem, ...).
    #[error("{operation} failed: {reason}")]
    Backend {
        /// The host operation.
        operation: String,
        /// Failure description.
        reason: String,
    },
}

/// Structured error shape bound into `catch` blocks.
///
/// Every catch site binds this shape, never a bare string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Human-readable message.
    pub message: String,
    /// The failing slot, when known.
    pub slot: Option<String>,
    /// Source file, empty when unknown.
    pub file: String,
    /// 1-based line, 0 when unknown.
    pub line: u32,
    /// 1-based column, 0 when unknown.
    pub col: u32,
}

impl RuntimeError {
    /// Create a new `Failed` error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Create a new `Security` error.
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    /// Create a new `Database` error.
    pub fn database(operation: impl Into<String>, details: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// Create a new `Queue` error.
    pub fn queue(reason: impl std::fmt::Display) -> Self {
        Self::Queue {
            reason: reason.to_string(),
        }
    }

    /// Create a new `Plugin` error.
    pub fn plugin(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `Vm` error.
    pub fn vm(message: impl Into<String>) -> Self {
        Self::Vm {
            message: message.into(),
        }
    }

    /// Create a new `Io` error.
    pub fn io(message: impl std::fmt::Display) -> Self {
        Self::Io {
            message: message.to_string(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a new `Syntax` error.
    pub fn syntax(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Syntax {
            message: message.into(),
            location,
        }
    }

    /// Returns `true` for the control-flow sentinels.
    pub fn is_sentinel(&self) -> bool {
        matches!(
            self,
            Self::Return | Self::Break | Self::Continue | Self::FnReturn
        )
    }

    /// Returns `true` if this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` for security violations, including denied host calls.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::Security { .. }
                | Self::HostFunction(HostFunctionError::PermissionDenied { .. })
        )
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted | Self::Timeout { .. })
    }

    /// Attribute this error to a slot and node location.
    ///
    /// Sentinels, timeouts, security violations and errors that already carry
    /// a location are returned unchanged.
    #[must_use]
    pub fn at_slot(self, slot: &str, location: &SourceLocation) -> Self {
        match self {
            Self::Syntax { .. }
            | Self::Static { .. }
            | Self::UnknownSlot { .. }
            | Self::Slot { .. }
            | Self::Security { .. }
            | Self::Timeout { .. }
            | Self::Return
            | Self::Break
            | Self::Continue
            | Self::FnReturn => self,
            Self::HostFunction(HostFunctionError::PermissionDenied { .. }) => self,
            Self::Failed { message } => Self::Slot {
                slot: slot.to_string(),
                message,
                location: location.clone(),
            },
            other => Self::Slot {
                slot: slot.to_string(),
                message: other.to_string(),
                location: location.clone(),
            },
        }
    }

    /// Build the structured diagnostic bound by `catch`.
    pub fn diagnostic(&self) -> Diagnostic {
        let (message, slot, location) = match self {
            Self::Slot {
                slot,
                message,
                location,
            } => (message.clone(), Some(slot.clone()), Some(location)),
            Self::UnknownSlot { slot, location } => {
                (self.to_string(), Some(slot.clone()), Some(location))
            }
            Self::Syntax { message, location } | Self::Static { message, location } => {
                (message.clone(), None, Some(location))
            }
            other => (other.to_string(), None, None),
        };

        Diagnostic {
            message,
            slot,
            file: location.map(|l| l.file.clone()).unwrap_or_default(),
            line: location.map_or(0, |l| l.line),
            col: location.map_or(0, |l| l.col),
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> SourceLocation {
        SourceLocation::new("app.json", 3, 7)
    }

    #[test]
    fn test_error_display() {
        let err = RuntimeError::Timeout { duration_ms: 100 };
        assert_eq!(err.to_string(), "Execution timeout after 100ms");

        let err = RuntimeError::FuelExhausted;
        assert_eq!(err.to_string(), "Fuel exhausted: CPU limit exceeded");
    }

    #[test]
    fn test_error_from_host_function() {
        let host_err = HostFunctionError::PermissionDenied {
            resource: "filesystem: /etc/passwd".into(),
        };
        let runtime_err: RuntimeError = host_err.into();

        assert!(matches!(runtime_err, RuntimeError::HostFunction(_)));
        assert!(runtime_err.is_security());
    }

    #[test]
    fn test_at_slot_wraps_failures_once() {
        let err = RuntimeError::failed("boom").at_slot("db.get", &loc());
        assert_eq!(
            err,
            RuntimeError::Slot {
                slot: "db.get".into(),
                message: "boom".into(),
                location: loc(),
            }
        );

        let rewrapped = err.clone().at_slot("try", &SourceLocation::default());
        assert_eq!(rewrapped, err);
    }

    #[test]
    fn test_at_slot_passes_sentinels() {
        for sentinel in [
            RuntimeError::Return,
            RuntimeError::Break,
            RuntimeError::Continue,
            RuntimeError::FnReturn,
        ] {
            assert!(sentinel.is_sentinel());
            assert_eq!(sentinel.clone().at_slot("x", &loc()), sentinel);
        }

        let timeout = RuntimeError::Timeout { duration_ms: 5 };
        assert_eq!(timeout.clone().at_slot("x", &loc()), timeout);
    }

    #[test]
    fn test_at_slot_wraps_infrastructure_errors() {
        let err = RuntimeError::database("select", "no such table: t").at_slot("get", &loc());
        match err {
            RuntimeError::Slot { slot, message, .. } => {
                assert_eq!(slot, "get");
                assert!(message.contains("no such table"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_diagnostic_shape() {
        let err = RuntimeError::failed("bad input").at_slot("validate", &loc());
        let diag = err.diagnostic();

        assert_eq!(diag.message, "bad input");
        assert_eq!(diag.slot.as_deref(), Some("validate"));
        assert_eq!(diag.file, "app.json");
        assert_eq!(diag.line, 3);
        assert_eq!(diag.col, 7);

        let diag = RuntimeError::failed("plain").diagnostic();
        assert_eq!(diag.slot, None);
        assert_eq!(diag.line, 0);
    }

    #[test]
    fn test_is_resource_limit() {
        assert!(RuntimeError::FuelExhausted.is_resource_limit());
        assert!(RuntimeError::Timeout { duration_ms: 100 }.is_resource_limit());
        assert!(!RuntimeError::failed("x").is_resource_limit());
    }
}
