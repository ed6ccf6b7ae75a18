//! Guest logging.
//!
//! Guest log lines are kept on the store for the current call and also
//! emitted via `tracing`, tagged with the plugin name.

use tracing::{debug, error, info, warn};
use zeno_wasm::{GuestState, LogLevel};

use crate::host::HostContext;

pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(state: &mut GuestState<HostContext>, level: LogLevel, message: &str) {
        state.log(level, message.to_string());

        let request_id = state.request_id.as_str();
        let plugin = &*state.host.plugin;
        match level {
            LogLevel::Debug => debug!(plugin, request_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(plugin, request_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(plugin, request_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(plugin, request_id, guest_log = true, "{}", message),
        }
    }
}

/// Convert a numeric log level (0=debug, 1=info, 2=warn, 3=error).
///
/// Unknown values map to Info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// Parse a level name as used by sidecar and JSON log requests.
pub fn level_from_str(level: &str) -> LogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => LogLevel::Debug,
        "warn" | "warning" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeno_common::ExecutionConfig;

    #[test]
    fn test_logging_stores_in_state() {
        let mut state = GuestState::new(HostContext::detached("logger"), &ExecutionConfig::default());

        LoggingHost::log(&mut state, LogLevel::Info, "Hello");
        LoggingHost::log(&mut state, LogLevel::Error, "World");

        assert_eq!(state.logs.len(), 2);
        assert_eq!(state.logs[0].message, "Hello");
        assert_eq!(state.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!(level_from_str("WARN"), LogLevel::Warn);
        assert_eq!(level_from_str("debug"), LogLevel::Debug);
        assert_eq!(level_from_str("whatever"), LogLevel::Info);
    }
}
