//! Host function registration for plugin guests.
//!
//! All functions live in the `env` namespace:
//!
//! | Import | Signature | Argument |
//! |---|---|---|
//! | `host_log` | `(level, ptr, len)` | message text |
//! | `host_db_query` | `(ptr, len) -> ptr` | `{connection?, sql, bindings?}` |
//! | `host_http_request` | `(ptr, len) -> ptr` | `{method?, url, headers?, body?}` |
//! | `host_scope_get` | `(ptr, len) -> ptr` | variable name |
//! | `host_scope_set` | `(ptr, len) -> ptr` | `{key, value}` |
//! | `host_file_read` | `(ptr, len) -> ptr` | relative path |
//! | `host_file_write` | `(ptr, len) -> ptr` | `{path, content}` |
//! | `host_env_get` | `(ptr, len) -> ptr` | variable name |
//!
//! Every `-> ptr` function returns a NUL-terminated JSON [`Envelope`]
//! allocated with the guest's `alloc`.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, warn};
use wasmtime::{Caller, Linker};
use zeno_common::RuntimeError;
use zeno_wasm::{GuestState, read_guest, write_guest_cstr};

use crate::host::{Envelope, HostContext};
use crate::logging::{LoggingHost, level_from_i32};

pub type PluginState = GuestState<HostContext>;

/// Register every host function on `linker`.
///
/// # Errors
///
/// Returns `InvalidConfig` if a function cannot be registered.
pub fn register_all(linker: &mut Linker<PluginState>) -> Result<(), RuntimeError> {
    register_logging(linker)?;
    register_envelope(linker, "host_db_query", HostContext::db_query)?;
    register_envelope(linker, "host_http_request", HostContext::http_request)?;
    register_envelope(linker, "host_scope_get", HostContext::scope_get)?;
    register_envelope(linker, "host_scope_set", HostContext::scope_set)?;
    register_envelope(linker, "host_file_read", HostContext::file_read)?;
    register_envelope(linker, "host_file_write", HostContext::file_write)?;
    register_envelope(linker, "host_env_get", HostContext::env_get)?;
    Ok(())
}

/// Register `env::host_log(level: i32, ptr: i32, len: i32)`.
///
/// Levels are 0=debug, 1=info, 2=warn, 3=error. Out-of-bounds messages are
/// dropped with a warning rather than trapping the guest.
pub fn register_logging(linker: &mut Linker<PluginState>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "host_log",
            |mut caller: Caller<'_, PluginState>, level: i32, ptr: i32, len: i32| {
                let message = match read_guest(&mut caller, ptr, len) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => {
                        warn!(ptr, len, error = %e, "guest log message unreadable");
                        return;
                    }
                };
                LoggingHost::log(caller.data_mut(), level_from_i32(level), &message);
            },
        )
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register host_log: {e}")))?;
    Ok(())
}

/// Register an `(ptr, len) -> ptr` function backed by `op`.
///
/// A panic inside `op` becomes a failure envelope.
fn register_envelope<Fut>(
    linker: &mut Linker<PluginState>,
    name: &'static str,
    op: fn(HostContext, Vec<u8>) -> Fut,
) -> Result<(), RuntimeError>
where
    Fut: Future<Output = Envelope> + Send + 'static,
{
    linker
        .func_wrap_async(
            "env",
            name,
            move |mut caller: Caller<'_, PluginState>, (ptr, len): (i32, i32)| {
                Box::new(async move {
                    let envelope = match read_guest(&mut caller, ptr, len) {
                        Ok(input) => {
                            let host = caller.data().host.clone();
                            match AssertUnwindSafe(op(host, input)).catch_unwind().await {
                                Ok(envelope) => envelope,
                                Err(_) => {
                                    error!(function = name, "host function panicked");
                                    Envelope::failure(format!("{name} failed internally"))
                                }
                            }
                        }
                        Err(e) => Envelope::failure(e.to_string()),
                    };
                    let reply = serde_json::to_vec(&envelope)?;
                    Ok(write_guest_cstr(&mut caller, &reply).await?)
                })
            },
        )
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register {name}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeno_common::EngineConfig;
    use zeno_wasm::WasmEngine;

    #[test]
    fn test_register_all() {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap();
        let mut linker = Linker::new(engine.inner());
        assert!(register_all(&mut linker).is_ok());
        // Names are unique.
        assert!(register_logging(&mut linker).is_err());
    }
}
